//! Mode resolver: decide what it takes to make a device ready.
//!
//! Pure classification apart from the reads it performs (USB interface table,
//! semantic version, firmware identity over the debug probe). Never mutates
//! device state.

use serde::{Deserialize, Serialize};

use crate::device::{Capability, DeviceSnapshot};
use crate::error::{Result, SetupError};
use crate::firmware::FirmwareSpec;
use crate::jlink::{DebugProbe, ProbeGuard};
use crate::probe;
use crate::usb::UsbControl;

/// What a device needs before it satisfies a firmware specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupMode {
    /// The device already runs the required firmware.
    Ready,
    /// The device must be (re)flashed over DFU.
    NeedsDfu,
    /// The device must be programmed over the debug probe.
    NeedsJlink,
    /// The device cannot be classified against the supplied specification.
    Impossible,
}

/// Classify a device against a firmware specification.
///
/// Rules, evaluated in order:
/// 1. DFU firmware defined and the device sits in the bootloader: `NeedsDfu`.
/// 2. DFU firmware defined and application firmware exposes a trigger
///    interface: compare the reported semantic version against the expected
///    ones. Match plus a present (or not required) serial port is `Ready`;
///    mismatch is `NeedsDfu`; a required but absent serial port fails with
///    [`SetupError::MissingSerialPort`].
/// 3. JLink firmware defined and a debug probe is available: identify the
///    family, look up its firmware entry
///    ([`SetupError::UnsupportedFamily`] if absent) and validate the flashed
///    identity. Valid is `Ready`, anything else `NeedsJlink`. The probe is
///    closed again on every path.
/// 4. Otherwise `Impossible`; the caller proceeds at its own risk with the
///    unmodified snapshot.
pub fn resolve_mode(
    snapshot: &DeviceSnapshot,
    spec: &FirmwareSpec,
    mut usb: Option<&mut (dyn UsbControl + '_)>,
    probe: Option<&mut (dyn DebugProbe + '_)>,
) -> Result<SetupMode> {
    if spec.has_dfu() {
        let kind = probe::classify(snapshot, usb.as_deref_mut());
        if kind.in_bootloader {
            return Ok(SetupMode::NeedsDfu);
        }
        if let Some(interface) = kind.trigger_interface {
            return resolve_application_mode(snapshot, spec, usb, interface);
        }
    }

    if spec.has_jlink() && snapshot.has_capability(Capability::JlinkProbe) {
        if let Some(probe) = probe {
            return resolve_over_probe(spec, probe);
        }
    }

    Ok(SetupMode::Impossible)
}

fn resolve_application_mode(
    snapshot: &DeviceSnapshot,
    spec: &FirmwareSpec,
    usb: Option<&mut (dyn UsbControl + '_)>,
    interface: u8,
) -> Result<SetupMode> {
    let Some(usb) = usb else {
        // No control handle to read the version through; an unknown version
        // cannot match the expected one.
        return Ok(SetupMode::NeedsDfu);
    };

    let version = match probe::read_semver(usb, interface) {
        Ok(version) => version,
        Err(e) => {
            log::warn!(
                "cannot read firmware version of '{}': {}; reflash required",
                snapshot.serial_number,
                e
            );
            return Ok(SetupMode::NeedsDfu);
        }
    };

    match spec.dfu_entry_matching_semver(&version) {
        Some((key, entry)) => {
            if entry.needs_serial_port && !snapshot.has_capability(Capability::Serial) {
                return Err(SetupError::MissingSerialPort {
                    serial: snapshot.serial_number.clone(),
                });
            }
            log::debug!(
                "device '{}' already runs '{}' ({})",
                snapshot.serial_number,
                version,
                key
            );
            Ok(SetupMode::Ready)
        }
        None => Ok(SetupMode::NeedsDfu),
    }
}

fn resolve_over_probe(spec: &FirmwareSpec, probe: &mut dyn DebugProbe) -> Result<SetupMode> {
    let mut guard = ProbeGuard::acquire(probe)?;

    let family = guard.family()?;
    let entry = spec
        .jlink
        .get(&family)
        .ok_or_else(|| SetupError::UnsupportedFamily {
            family: family.clone(),
        })?;

    let mut bytes = vec![0u8; entry.identity.read_length()];
    guard.read_memory(entry.identity_address, &mut bytes)?;

    if entry.identity.matches(&bytes) {
        Ok(SetupMode::Ready)
    } else {
        Ok(SetupMode::NeedsJlink)
    }
}
