//! JLink orchestrator and debug-probe collaborator interface.
//!
//! Programming over a debug probe bypasses whatever firmware the device runs.
//! The probe is physical hardware that stays locked while held, so every
//! acquisition goes through [`ProbeGuard`], which guarantees release on every
//! exit path.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::device::{wait_for_device, DeviceLister, DeviceSnapshot};
use crate::error::{Result, SetupError};
use crate::firmware::FirmwareSpec;
use crate::hooks::InteractionHooks;
use crate::port::verify_serial_port;
use crate::setup::{SetupResult, SetupStage};

/// Debug-probe collaborator: open/close by device identity, memory reads,
/// erase, and programming from an image file.
#[cfg_attr(test, automock)]
pub trait DebugProbe: Send {
    /// Whether the probe connection is currently open.
    fn is_open(&self) -> bool;

    /// Open the probe connection.
    fn open(&mut self) -> Result<()>;

    /// Close the probe connection. Closing a closed probe is a no-op.
    fn close(&mut self);

    /// Identify the hardware family of the connected device.
    fn family(&mut self) -> Result<String>;

    /// Read `buffer.len()` bytes of device memory at `address`.
    fn read_memory(&mut self, address: u32, buffer: &mut [u8]) -> Result<()>;

    /// Erase the device flash.
    fn erase_all(&mut self) -> Result<()>;

    /// Program the device from an image file.
    fn program_file(&mut self, path: &Path) -> Result<()>;
}

/// Scoped probe acquisition.
///
/// Opens the probe on acquire (if not already open) and closes it when
/// dropped, so a failing or cancelled flow can never leave the hardware
/// locked.
pub struct ProbeGuard<'a> {
    probe: &'a mut dyn DebugProbe,
}

impl<'a> ProbeGuard<'a> {
    /// Open the probe and return the guard.
    pub fn acquire(probe: &'a mut dyn DebugProbe) -> Result<Self> {
        if !probe.is_open() {
            probe.open()?;
        }
        Ok(Self { probe })
    }
}

impl<'a> Deref for ProbeGuard<'a> {
    type Target = dyn DebugProbe + 'a;

    fn deref(&self) -> &Self::Target {
        self.probe
    }
}

impl<'a> DerefMut for ProbeGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.probe
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.close();
    }
}

/// Program a device over the debug probe.
pub(crate) fn run_jlink(
    snapshot: &DeviceSnapshot,
    spec: &FirmwareSpec,
    probe: &mut dyn DebugProbe,
    lister: &dyn DeviceLister,
    hooks: &dyn InteractionHooks,
    progress: &dyn Fn(SetupStage),
    timeout: Duration,
) -> Result<SetupResult> {
    // A wedged serial port would hang any later use of the device, so prove
    // reachability before the probe is even opened.
    if spec.jlink.values().any(|entry| entry.needs_serial_port) {
        match &snapshot.serial_port {
            Some(port) => {
                progress(SetupStage::ValidatingSerialPort);
                verify_serial_port(port)?;
            }
            None => {
                return Err(SetupError::MissingSerialPort {
                    serial: snapshot.serial_number.clone(),
                })
            }
        }
    }

    progress(SetupStage::OpeningProbe);
    let mut guard = ProbeGuard::acquire(probe)?;

    let family = guard.family()?;
    let entry = spec
        .jlink
        .get(&family)
        .ok_or_else(|| SetupError::UnsupportedFamily {
            family: family.clone(),
        })?;

    if !hooks.confirm(&format!(
        "Device {} must be programmed over the debug probe. Proceed?",
        snapshot.display_label()
    )) {
        // Guard drop closes the probe.
        return Err(SetupError::SetupCancelled);
    }

    progress(SetupStage::Flashing);
    log::info!(
        "programming '{}' ({}) from {}",
        snapshot.serial_number,
        family,
        entry.image_path.display()
    );
    guard.erase_all().map_err(programming_failed)?;
    guard
        .program_file(&entry.image_path)
        .map_err(programming_failed)?;

    drop(guard);

    // Flashing resets the device. Probe-only rigs may never re-enumerate on
    // USB, so a missing reappearance is not a failure.
    progress(SetupStage::WaitingForReboot);
    let fresh = match wait_for_device(lister, &snapshot.serial_number, &[], timeout) {
        Ok(device) => device,
        Err(e) => {
            log::warn!(
                "device '{}' did not re-enumerate after programming ({}); keeping pre-flash identity",
                snapshot.serial_number,
                e
            );
            snapshot.clone()
        }
    };

    progress(SetupStage::Complete);
    Ok(SetupResult {
        snapshot: fresh,
        was_programmed: true,
        detail: Some(format!("programmed '{}' over debug probe", family)),
    })
}

fn programming_failed(e: SetupError) -> SetupError {
    SetupError::ProgrammingFailed {
        source: Box::new(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{FirmwareIdentity, JlinkFirmware};
    use crate::hooks::{AutoConfirm, MockInteractionHooks};
    use crate::test_helpers::{SnapshotBuilder, StaticLister};
    use std::path::PathBuf;

    /// Stateful probe that tracks open/close balance.
    struct FakeProbe {
        open: bool,
        open_calls: u32,
        family: String,
        fail_program: bool,
        programmed: Vec<PathBuf>,
    }

    impl FakeProbe {
        fn new(family: &str) -> Self {
            Self {
                open: false,
                open_calls: 0,
                family: family.to_string(),
                fail_program: false,
                programmed: Vec::new(),
            }
        }
    }

    impl DebugProbe for FakeProbe {
        fn is_open(&self) -> bool {
            self.open
        }

        fn open(&mut self) -> Result<()> {
            assert!(!self.open, "probe opened while already open");
            self.open = true;
            self.open_calls += 1;
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn family(&mut self) -> Result<String> {
            assert!(self.open);
            Ok(self.family.clone())
        }

        fn read_memory(&mut self, _address: u32, buffer: &mut [u8]) -> Result<()> {
            assert!(self.open);
            buffer.fill(0xFF);
            Ok(())
        }

        fn erase_all(&mut self) -> Result<()> {
            assert!(self.open);
            Ok(())
        }

        fn program_file(&mut self, path: &Path) -> Result<()> {
            assert!(self.open);
            if self.fail_program {
                return Err(SetupError::Probe {
                    operation: "program".into(),
                    reason: "target voltage too low".into(),
                });
            }
            self.programmed.push(path.to_path_buf());
            Ok(())
        }
    }

    fn spec_for(family: &str) -> FirmwareSpec {
        let mut spec = FirmwareSpec::default();
        spec.jlink.insert(
            family.to_string(),
            JlinkFirmware {
                image_path: PathBuf::from("connectivity.hex"),
                identity_address: 0x2000_0000,
                identity: FirmwareIdentity::Exact(b"connectivity 1.1.0".to_vec()),
                needs_serial_port: false,
            },
        );
        spec
    }

    fn noop(_: SetupStage) {}

    #[test]
    fn test_flash_success_closes_probe() {
        let snapshot = SnapshotBuilder::new().serial("JL01").jlink().build();
        let lister = StaticLister::new(vec![snapshot.clone()]);
        let mut probe = FakeProbe::new("nRF52");

        let result = run_jlink(
            &snapshot,
            &spec_for("nRF52"),
            &mut probe,
            &lister,
            &AutoConfirm,
            &noop,
            Duration::from_millis(500),
        )
        .unwrap();

        assert!(result.was_programmed);
        assert_eq!(result.snapshot.serial_number, "JL01");
        assert_eq!(probe.programmed, vec![PathBuf::from("connectivity.hex")]);
        assert!(!probe.is_open());
        // A fresh acquisition must succeed immediately.
        assert!(ProbeGuard::acquire(&mut probe).is_ok());
    }

    #[test]
    fn test_cancellation_returns_unprogrammed_with_probe_closed() {
        let snapshot = SnapshotBuilder::new().serial("JL02").jlink().build();
        let lister = StaticLister::new(vec![snapshot.clone()]);
        let mut probe = FakeProbe::new("nRF52");
        let mut hooks = MockInteractionHooks::new();
        hooks.expect_confirm().return_const(false);

        let result = run_jlink(
            &snapshot,
            &spec_for("nRF52"),
            &mut probe,
            &lister,
            &hooks,
            &noop,
            Duration::from_millis(500),
        );

        assert!(matches!(result, Err(SetupError::SetupCancelled)));
        assert!(probe.programmed.is_empty());
        assert!(!probe.is_open());
    }

    #[test]
    fn test_flash_failure_closes_probe() {
        let snapshot = SnapshotBuilder::new().serial("JL03").jlink().build();
        let lister = StaticLister::new(vec![snapshot.clone()]);
        let mut probe = FakeProbe::new("nRF52");
        probe.fail_program = true;

        let result = run_jlink(
            &snapshot,
            &spec_for("nRF52"),
            &mut probe,
            &lister,
            &AutoConfirm,
            &noop,
            Duration::from_millis(500),
        );

        assert!(matches!(result, Err(SetupError::ProgrammingFailed { .. })));
        assert!(!probe.is_open());
    }

    #[test]
    fn test_unsupported_family_closes_probe() {
        let snapshot = SnapshotBuilder::new().serial("JL04").jlink().build();
        let lister = StaticLister::new(vec![snapshot.clone()]);
        let mut probe = FakeProbe::new("nRF51");

        let result = run_jlink(
            &snapshot,
            &spec_for("nRF52"),
            &mut probe,
            &lister,
            &AutoConfirm,
            &noop,
            Duration::from_millis(500),
        );

        assert!(matches!(
            result,
            Err(SetupError::UnsupportedFamily { ref family }) if family == "nRF51"
        ));
        assert!(!probe.is_open());
    }

    #[test]
    fn test_required_serial_port_missing_fails_before_probe_open() {
        let snapshot = SnapshotBuilder::new()
            .serial("JL05")
            .jlink()
            .no_serial_port()
            .build();
        let lister = StaticLister::new(vec![snapshot.clone()]);
        let mut probe = FakeProbe::new("nRF52");
        let mut spec = spec_for("nRF52");
        spec.jlink.get_mut("nRF52").unwrap().needs_serial_port = true;

        let result = run_jlink(
            &snapshot,
            &spec,
            &mut probe,
            &lister,
            &AutoConfirm,
            &noop,
            Duration::from_millis(500),
        );

        assert!(matches!(result, Err(SetupError::MissingSerialPort { .. })));
        assert_eq!(probe.open_calls, 0);
    }

    #[test]
    fn test_probe_guard_closes_on_drop() {
        let mut probe = FakeProbe::new("nRF52");
        {
            let guard = ProbeGuard::acquire(&mut probe).unwrap();
            assert!(guard.is_open());
        }
        assert!(!probe.is_open());
    }
}
