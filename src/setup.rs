//! Public entry point: prepare a device against a firmware specification.
//!
//! `prepare` classifies the device, dispatches to the DFU or JLink
//! orchestrator when reprogramming is needed, and returns a fresh snapshot
//! plus a programmed/not-programmed flag. Callers that only want the verdict
//! use [`resolve_mode`](crate::resolve::resolve_mode) directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ENUMERATION_TIMEOUT;
use crate::device::{DeviceLister, DeviceSnapshot};
use crate::dfu::{self, DfuProtocol};
use crate::error::{Result, SetupError};
use crate::firmware::{FirmwareSpec, HexSource, RawBinarySource};
use crate::hooks::{AutoConfirm, InteractionHooks};
use crate::init_packet::FirmwareType;
use crate::jlink::{self, DebugProbe};
use crate::resolve::{resolve_mode, SetupMode};
use crate::usb::UsbControl;

/// Outcome of a preparation flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupResult {
    /// Fresh snapshot of the device after the last step.
    pub snapshot: DeviceSnapshot,
    /// Whether any firmware was written to the device.
    pub was_programmed: bool,
    /// Optional diagnostic detail.
    pub detail: Option<String>,
}

impl SetupResult {
    fn untouched(snapshot: &DeviceSnapshot, detail: Option<String>) -> Self {
        Self {
            snapshot: snapshot.clone(),
            was_programmed: false,
            detail,
        }
    }
}

/// Progress stages reported while preparing a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data")]
pub enum SetupStage {
    /// Classifying the device against the specification.
    Classifying,
    /// Sending the detach request and waiting for the bootloader.
    EnteringBootloader,
    /// Bootloader re-enumerated after the detach handshake.
    DetectedBootloader,
    /// Installing a newer bootloader before the firmware transfer.
    UpdatingBootloader,
    /// Transferring one firmware image.
    TransferringImage { firmware_type: FirmwareType },
    /// Waiting for the device to reboot and re-enumerate.
    WaitingForReboot,
    /// Verifying the required serial port opens.
    ValidatingSerialPort,
    /// Opening the debug probe.
    OpeningProbe,
    /// Flashing over the debug probe.
    Flashing,
    /// Preparation complete.
    Complete,
}

impl SetupStage {
    /// Get a percentage estimate for this stage.
    pub fn percent(&self) -> f32 {
        match self {
            SetupStage::Classifying => 0.0,
            SetupStage::EnteringBootloader => 10.0,
            SetupStage::DetectedBootloader => 20.0,
            SetupStage::UpdatingBootloader => 30.0,
            SetupStage::TransferringImage { .. } => 50.0,
            SetupStage::WaitingForReboot => 85.0,
            SetupStage::ValidatingSerialPort => 95.0,
            SetupStage::OpeningProbe => 20.0,
            SetupStage::Flashing => 50.0,
            SetupStage::Complete => 100.0,
        }
    }

    /// Get a human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            SetupStage::Classifying => "Inspecting device...".into(),
            SetupStage::EnteringBootloader => "Entering bootloader mode...".into(),
            SetupStage::DetectedBootloader => "Bootloader detected".into(),
            SetupStage::UpdatingBootloader => "Updating bootloader...".into(),
            SetupStage::TransferringImage { firmware_type } => match firmware_type {
                FirmwareType::SoftDevice => "Transferring SoftDevice image...".into(),
                FirmwareType::Bootloader => "Transferring bootloader image...".into(),
                FirmwareType::SoftDeviceBootloader => {
                    "Transferring SoftDevice and bootloader image...".into()
                }
                FirmwareType::Application => "Transferring application image...".into(),
            },
            SetupStage::WaitingForReboot => "Waiting for device to restart...".into(),
            SetupStage::ValidatingSerialPort => "Checking serial port...".into(),
            SetupStage::OpeningProbe => "Opening debug probe...".into(),
            SetupStage::Flashing => "Programming over debug probe...".into(),
            SetupStage::Complete => "Device ready".into(),
        }
    }
}

/// Collaborators a preparation flow works through.
///
/// The lister is always required; the USB handle, DFU protocol, and debug
/// probe are optional and only needed for the paths that use them. Hooks
/// default to [`AutoConfirm`] and image reading to [`RawBinarySource`].
pub struct SetupContext<'a> {
    /// Device-listing collaborator.
    pub lister: &'a dyn DeviceLister,
    /// USB control handle bound to the device being prepared.
    pub usb: Option<&'a mut dyn UsbControl>,
    /// Wire-level DFU collaborator.
    pub dfu: Option<&'a mut dyn DfuProtocol>,
    /// Debug-probe collaborator.
    pub probe: Option<&'a mut dyn DebugProbe>,
    /// Confirmation and choice callbacks.
    pub hooks: &'a dyn InteractionHooks,
    /// Firmware-image reading collaborator.
    pub hex: &'a dyn HexSource,
    /// Progress observer.
    pub progress: Option<&'a dyn Fn(SetupStage)>,
    /// Timeout for every re-enumeration wait.
    pub enumeration_timeout: Duration,
}

impl<'a> SetupContext<'a> {
    /// Create a context with defaults: no optional collaborators, auto-confirm
    /// hooks, raw binary images, and the default enumeration timeout.
    pub fn new(lister: &'a dyn DeviceLister) -> Self {
        Self {
            lister,
            usb: None,
            dfu: None,
            probe: None,
            hooks: &AutoConfirm,
            hex: &RawBinarySource,
            progress: None,
            enumeration_timeout: ENUMERATION_TIMEOUT,
        }
    }
}

/// Prepare a device so it runs the firmware the specification requires.
///
/// Classifies the device, reprograms it over DFU or the debug probe when
/// needed, and returns a fresh snapshot with a `was_programmed` flag. A
/// device that is already `Ready` (or cannot be classified) is returned
/// untouched with `was_programmed == false`.
///
/// Declined confirmation gates surface as [`SetupError::SetupCancelled`];
/// the caller's snapshot is never mutated.
pub fn prepare(
    snapshot: &DeviceSnapshot,
    spec: &FirmwareSpec,
    ctx: &mut SetupContext<'_>,
) -> Result<SetupResult> {
    let noop: fn(SetupStage) = |_| {};
    let progress: &dyn Fn(SetupStage) = match ctx.progress {
        Some(observer) => observer,
        None => &noop,
    };

    progress(SetupStage::Classifying);
    let mode = resolve_mode(
        snapshot,
        spec,
        ctx.usb.as_deref_mut(),
        ctx.probe.as_deref_mut(),
    )?;
    log::debug!(
        "device '{}' classified as {:?}",
        snapshot.serial_number,
        mode
    );

    match mode {
        SetupMode::Ready => Ok(SetupResult::untouched(
            snapshot,
            Some("device already runs the required firmware".into()),
        )),
        SetupMode::Impossible => {
            log::warn!(
                "device '{}' cannot be classified against the supplied firmware; returning it untouched",
                snapshot.serial_number
            );
            Ok(SetupResult::untouched(
                snapshot,
                Some("device could not be classified".into()),
            ))
        }
        SetupMode::NeedsDfu => {
            let Some(protocol) = ctx.dfu.as_deref_mut() else {
                return Err(SetupError::MissingCollaborator {
                    name: "DFU protocol".into(),
                });
            };
            dfu::run_dfu(
                snapshot,
                spec,
                ctx.usb.as_deref_mut(),
                ctx.lister,
                protocol,
                ctx.hooks,
                ctx.hex,
                progress,
                ctx.enumeration_timeout,
            )
        }
        SetupMode::NeedsJlink => {
            let Some(probe) = ctx.probe.as_deref_mut() else {
                return Err(SetupError::MissingCollaborator {
                    name: "debug probe".into(),
                });
            };
            jlink::run_jlink(
                snapshot,
                spec,
                probe,
                ctx.lister,
                ctx.hooks,
                progress,
                ctx.enumeration_timeout,
            )
        }
    }
}
