//! DFU orchestrator and wire-protocol collaborator interface.
//!
//! Drives a device through bootloader entry, an optional bootloader
//! self-update, the firmware transfer, and the final re-enumeration. The
//! wire-level upgrade itself happens behind the [`DfuProtocol`] trait; this
//! module owns the sequencing, the confirmation gates, and the serial
//! tracking across resets.

use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::bundle;
use crate::config::MIN_BOOTLOADER_VERSION;
use crate::detach;
use crate::device::{wait_for_device, Capability, DeviceLister, DeviceSnapshot};
use crate::error::{Result, SetupError};
use crate::firmware::{DfuFirmware, FirmwareSpec, HexSource, InitPacketParams};
use crate::hooks::InteractionHooks;
use crate::init_packet::{build_init_packet, FirmwareType};
use crate::port::verify_serial_port;
use crate::probe;
use crate::setup::{SetupResult, SetupStage};
use crate::usb::UsbControl;

/// One (init packet, firmware image) pair handed to the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuTransfer {
    /// Init packet authorizing and describing the image.
    pub init_packet: Vec<u8>,
    /// Firmware image bytes.
    pub image: Vec<u8>,
    /// Which firmware component the image updates.
    pub firmware_type: FirmwareType,
}

/// Transport handle for the wire protocol: a serial port when one is known,
/// otherwise the USB-serial identity to locate the device by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuTarget {
    /// Serial number of the device being updated.
    pub serial_number: String,
    /// Serial port path, when the bootloader exposes one.
    pub serial_port: Option<String>,
}

impl DfuTarget {
    fn for_device(snapshot: &DeviceSnapshot) -> Self {
        Self {
            serial_number: snapshot.serial_number.clone(),
            serial_port: snapshot.serial_port.clone(),
        }
    }
}

/// Version of one firmware component currently installed on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledFirmware {
    /// Which component the version describes.
    pub firmware_type: FirmwareType,
    /// Version number reported by the device.
    pub version: u32,
}

/// Wire-level DFU collaborator.
///
/// Given ordered (init packet, image) pairs and a transport handle, performs
/// the upgrade and returns when the device has accepted the images.
#[cfg_attr(test, automock)]
pub trait DfuProtocol: Send {
    /// Perform the upgrade for the given transfers, in order.
    fn perform(&mut self, target: &DfuTarget, transfers: &[DfuTransfer]) -> Result<()>;

    /// Read the firmware versions currently installed on the device.
    fn read_installed_firmware(&mut self, target: &DfuTarget) -> Result<Vec<InstalledFirmware>>;
}

/// Reprogram a device over DFU.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_dfu(
    snapshot: &DeviceSnapshot,
    spec: &FirmwareSpec,
    mut usb: Option<&mut (dyn UsbControl + '_)>,
    lister: &dyn DeviceLister,
    protocol: &mut dyn DfuProtocol,
    hooks: &dyn InteractionHooks,
    hex: &dyn HexSource,
    progress: &dyn Fn(SetupStage),
    timeout: Duration,
) -> Result<SetupResult> {
    if !hooks.confirm(&format!(
        "Device {} must be reprogrammed via DFU. Proceed?",
        snapshot.display_label()
    )) {
        return Err(SetupError::SetupCancelled);
    }

    let (key, entry) = choose_firmware(spec, hooks)?;
    log::info!(
        "selected firmware '{}' for device '{}'",
        key,
        snapshot.serial_number
    );

    // Get the device into the bootloader if it is not already there. The
    // detach request is irreversible; the handshake always completes its
    // re-enumeration wait so the device is never left in an unknown state.
    let kind = probe::classify(snapshot, usb.as_deref_mut());
    let current = if kind.in_bootloader {
        snapshot.clone()
    } else {
        let Some(interface) = kind.trigger_interface else {
            return Err(SetupError::dfu(
                "bootloader entry",
                SetupError::DetachFailed {
                    reason: "device exposes no trigger interface".into(),
                },
            ));
        };
        let Some(usb) = usb.as_deref_mut() else {
            return Err(SetupError::dfu(
                "bootloader entry",
                SetupError::DetachFailed {
                    reason: "no USB control handle available".into(),
                },
            ));
        };
        progress(SetupStage::EnteringBootloader);
        let rebooted = detach::detach_and_wait(usb, lister, snapshot, interface, timeout)?;
        progress(SetupStage::DetectedBootloader);
        rebooted
    };

    let current = maybe_update_bootloader(&current, entry, lister, protocol, hooks, progress, timeout)?;
    let target = DfuTarget::for_device(&current);

    // Companion image first; its post-transfer wait fails softly since the
    // application image still follows.
    if let Some(softdevice) = &entry.softdevice {
        let image = softdevice
            .resolve(hex)
            .map_err(|e| SetupError::dfu("softdevice image", e))?;
        progress(SetupStage::TransferringImage {
            firmware_type: FirmwareType::SoftDevice,
        });
        protocol
            .perform(&target, &[make_transfer(FirmwareType::SoftDevice, &image, &entry.params)])
            .map_err(|e| SetupError::dfu("softdevice transfer", e))?;

        if let Err(e) = wait_for_device(lister, &current.serial_number, &[], timeout) {
            log::warn!(
                "device '{}' not seen after softdevice transfer ({}); continuing",
                current.serial_number,
                e
            );
        }
    }

    let image = entry
        .application
        .resolve(hex)
        .map_err(|e| SetupError::dfu("application image", e))?;
    progress(SetupStage::TransferringImage {
        firmware_type: FirmwareType::Application,
    });
    protocol
        .perform(&target, &[make_transfer(FirmwareType::Application, &image, &entry.params)])
        .map_err(|e| SetupError::dfu("application transfer", e))?;

    // The device must come back with a serial port before the preparation
    // counts as done.
    progress(SetupStage::WaitingForReboot);
    let fresh = wait_for_device(
        lister,
        &current.serial_number,
        &[Capability::Serial],
        timeout,
    )?;

    if entry.needs_serial_port {
        let port = fresh
            .serial_port
            .clone()
            .ok_or_else(|| SetupError::MissingSerialPort {
                serial: fresh.serial_number.clone(),
            })?;
        progress(SetupStage::ValidatingSerialPort);
        verify_serial_port(&port).map_err(|e| SetupError::dfu("serial port validation", e))?;
    }

    progress(SetupStage::Complete);
    Ok(SetupResult {
        snapshot: fresh,
        was_programmed: true,
        detail: Some(format!("programmed with '{}'", key)),
    })
}

/// Pick the firmware entry to install.
///
/// A single entry is auto-selected; several put the choice to the caller.
fn choose_firmware<'s>(
    spec: &'s FirmwareSpec,
    hooks: &dyn InteractionHooks,
) -> Result<(&'s str, &'s DfuFirmware)> {
    let entries: Vec<(&String, &DfuFirmware)> = spec.dfu.iter().collect();
    match entries.len() {
        0 => Err(SetupError::InvalidManifest {
            reason: "specification contains no DFU firmware".into(),
        }),
        1 => Ok((entries[0].0.as_str(), entries[0].1)),
        _ => {
            let labels: Vec<String> = entries.iter().map(|(key, _)| (*key).clone()).collect();
            match hooks.choose_one("Which firmware should be installed?", &labels) {
                Some(index) if index < entries.len() => {
                    Ok((entries[index].0.as_str(), entries[index].1))
                }
                _ => Err(SetupError::SetupCancelled),
            }
        }
    }
}

/// Update the bootloader first when the installed one is too old.
///
/// Only attempted when the firmware entry ships a bootloader bundle. Version
/// readout is best-effort; an unreadable version skips the cycle.
fn maybe_update_bootloader(
    current: &DeviceSnapshot,
    entry: &DfuFirmware,
    lister: &dyn DeviceLister,
    protocol: &mut dyn DfuProtocol,
    hooks: &dyn InteractionHooks,
    progress: &dyn Fn(SetupStage),
    timeout: Duration,
) -> Result<DeviceSnapshot> {
    let Some(bundle_path) = &entry.bootloader_bundle else {
        return Ok(current.clone());
    };

    let target = DfuTarget::for_device(current);
    let installed = match protocol.read_installed_firmware(&target) {
        Ok(versions) => versions,
        Err(e) => {
            log::warn!(
                "cannot read installed firmware versions of '{}': {}; skipping bootloader check",
                current.serial_number,
                e
            );
            return Ok(current.clone());
        }
    };

    let Some(bootloader) = installed
        .iter()
        .find(|v| v.firmware_type == FirmwareType::Bootloader)
    else {
        return Ok(current.clone());
    };
    if bootloader.version >= MIN_BOOTLOADER_VERSION {
        return Ok(current.clone());
    }

    if !hooks.confirm(&format!(
        "Bootloader version {} is below the supported minimum {}. Update it first?",
        bootloader.version, MIN_BOOTLOADER_VERSION
    )) {
        return Err(SetupError::SetupCancelled);
    }

    progress(SetupStage::UpdatingBootloader);
    let bundle =
        bundle::read_bundle(bundle_path).map_err(|e| SetupError::dfu("bootloader bundle", e))?;
    let transfer = DfuTransfer {
        init_packet: bundle.init_data,
        image: bundle.firmware_data,
        firmware_type: FirmwareType::Bootloader,
    };
    protocol
        .perform(&target, &[transfer])
        .map_err(|e| SetupError::dfu("bootloader update", e))?;

    // The device reboots into the new bootloader; re-derive its presence.
    let fresh = wait_for_device(lister, &current.serial_number, &[Capability::Serial], timeout)?;
    if !probe::classify(&fresh, None).in_bootloader {
        log::warn!(
            "device '{}' did not report bootloader identity after bootloader update",
            fresh.serial_number
        );
    }
    Ok(fresh)
}

fn make_transfer(
    firmware_type: FirmwareType,
    image: &[u8],
    params: &InitPacketParams,
) -> DfuTransfer {
    DfuTransfer {
        init_packet: build_init_packet(firmware_type, params, image),
        image: image.to_vec(),
        firmware_type,
    }
}
