//! Transport probe: classify a device's current mode.
//!
//! Decides whether a device is sitting in the DFU bootloader, running
//! application firmware with a trigger interface, or neither, and reads the
//! semantic version string the trigger interface reports.

use crate::config::{
    is_bootloader_identity, matches_trigger_signature, BOOTLOADER_PRODUCT_STRING,
    REQUEST_SEMVER, REQUEST_TYPE_CLASS_IN, SEMVER_MAX_LENGTH,
};
use crate::device::{Capability, DeviceSnapshot};
use crate::error::{Result, SetupError};
use crate::usb::{ControlRequest, UsbControl};

/// Result of classifying one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportKind {
    /// The device is running the DFU bootloader.
    pub in_bootloader: bool,
    /// Interface number of the DFU trigger interface, when application
    /// firmware exposes one.
    pub trigger_interface: Option<u8>,
}

/// Run a closure against an open USB handle, restoring the prior open state.
///
/// If the handle is already open it is left open; if it was closed it is
/// opened for the duration of the call and closed again on every exit path.
pub fn with_open_handle<T>(
    usb: &mut dyn UsbControl,
    f: impl FnOnce(&mut dyn UsbControl) -> Result<T>,
) -> Result<T> {
    if usb.is_open() {
        return f(usb);
    }
    usb.open().map_err(SetupError::Usb)?;
    let result = f(usb);
    usb.close();
    result
}

/// Classify the current mode of a device.
///
/// Bootloader detection compares the USB identity against the known
/// bootloader signature and is side-effect free. Trigger-interface detection
/// prefers the interface table already recorded in the snapshot and falls
/// back to querying the device, briefly opening the handle if needed. A
/// device that cannot be opened reports no trigger interface; that is a
/// classification result, not an error.
pub fn classify(snapshot: &DeviceSnapshot, usb: Option<&mut (dyn UsbControl + '_)>) -> TransportKind {
    let in_bootloader = snapshot.usb.as_ref().is_some_and(|identity| {
        is_bootloader_identity(identity.vid, identity.pid)
            || identity.product.as_deref() == Some(BOOTLOADER_PRODUCT_STRING)
    });

    TransportKind {
        in_bootloader,
        trigger_interface: find_trigger_interface(snapshot, usb),
    }
}

fn find_trigger_interface(
    snapshot: &DeviceSnapshot,
    usb: Option<&mut (dyn UsbControl + '_)>,
) -> Option<u8> {
    if let Some(identity) = &snapshot.usb {
        if !identity.interfaces.is_empty() {
            return identity
                .interfaces
                .iter()
                .find(|i| matches_trigger_signature(i.class, i.subclass, i.protocol))
                .map(|i| i.number);
        }
    }

    if !snapshot.has_capability(Capability::UsbControl) {
        return None;
    }
    let usb = usb?;

    match with_open_handle(usb, |u| Ok(u.interface_descriptors()?)) {
        Ok(interfaces) => interfaces
            .iter()
            .find(|i| matches_trigger_signature(i.class, i.subclass, i.protocol))
            .map(|i| i.number),
        Err(e) => {
            log::debug!(
                "cannot read interface table of '{}': {}",
                snapshot.serial_number,
                e
            );
            None
        }
    }
}

/// Read the semantic version string over the trigger interface.
pub fn read_semver(usb: &mut dyn UsbControl, interface: u8) -> Result<String> {
    let request = ControlRequest {
        request_type: REQUEST_TYPE_CLASS_IN,
        request: REQUEST_SEMVER,
        value: 0,
        index: interface as u16,
    };

    let bytes = with_open_handle(usb, |u| {
        u.control_in(request, SEMVER_MAX_LENGTH)
            .map_err(|e| SetupError::SemverReadFailed {
                reason: e.to_string(),
            })
    })?;

    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::SnapshotBuilder;
    use crate::usb::{InterfaceDescriptor, MockUsbControl, UsbError};
    use mockall::predicate::eq;

    #[test]
    fn test_classify_bootloader_by_vid_pid() {
        let snapshot = SnapshotBuilder::new().bootloader().build();
        let kind = classify(&snapshot, None);

        assert!(kind.in_bootloader);
        assert_eq!(kind.trigger_interface, None);
    }

    #[test]
    fn test_classify_bootloader_by_product_string() {
        let snapshot = SnapshotBuilder::new()
            .vid_pid(0x1915, 0x0000)
            .product("Open DFU Bootloader")
            .build();

        assert!(classify(&snapshot, None).in_bootloader);
    }

    #[test]
    fn test_classify_application_device_is_not_bootloader() {
        let snapshot = SnapshotBuilder::new().build();
        assert!(!classify(&snapshot, None).in_bootloader);
    }

    #[test]
    fn test_trigger_interface_from_snapshot_table() {
        let snapshot = SnapshotBuilder::new().trigger_interface(2).build();
        // No USB handle supplied: the recorded table must be enough.
        let kind = classify(&snapshot, None);

        assert_eq!(kind.trigger_interface, Some(2));
    }

    #[test]
    fn test_trigger_interface_read_from_device() {
        let snapshot = SnapshotBuilder::new().build();
        let mut usb = MockUsbControl::new();
        usb.expect_is_open().return_const(false);
        usb.expect_open().times(1).returning(|| Ok(()));
        usb.expect_interface_descriptors().times(1).returning(|| {
            Ok(vec![
                InterfaceDescriptor {
                    number: 0,
                    class: 2,
                    subclass: 2,
                    protocol: 1,
                },
                InterfaceDescriptor {
                    number: 3,
                    class: 255,
                    subclass: 1,
                    protocol: 1,
                },
            ])
        });
        usb.expect_close().times(1).return_const(());

        let kind = classify(&snapshot, Some(&mut usb));
        assert_eq!(kind.trigger_interface, Some(3));
    }

    #[test]
    fn test_trigger_interface_open_failure_is_not_fatal() {
        let snapshot = SnapshotBuilder::new().build();
        let mut usb = MockUsbControl::new();
        usb.expect_is_open().return_const(false);
        usb.expect_open().returning(|| Err(UsbError::Access));

        let kind = classify(&snapshot, Some(&mut usb));
        assert_eq!(kind.trigger_interface, None);
    }

    #[test]
    fn test_trigger_lookup_skipped_without_usb_control_capability() {
        let snapshot = SnapshotBuilder::new()
            .capabilities(&[Capability::Serial])
            .build();
        // An unexpected mock call would panic; none may happen here.
        let mut usb = MockUsbControl::new();

        let kind = classify(&snapshot, Some(&mut usb));
        assert_eq!(kind.trigger_interface, None);
    }

    #[test]
    fn test_with_open_handle_leaves_open_handle_open() {
        let mut usb = MockUsbControl::new();
        usb.expect_is_open().return_const(true);
        // Neither open nor close may be called.

        let result = with_open_handle(&mut usb, |_| Ok(42)).unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_with_open_handle_closes_after_error() {
        let mut usb = MockUsbControl::new();
        usb.expect_is_open().return_const(false);
        usb.expect_open().times(1).returning(|| Ok(()));
        usb.expect_close().times(1).return_const(());

        let result: Result<()> = with_open_handle(&mut usb, |_| {
            Err(SetupError::SemverReadFailed {
                reason: "nope".into(),
            })
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_read_semver_trims_nul_padding() {
        let mut usb = MockUsbControl::new();
        usb.expect_is_open().return_const(true);
        usb.expect_control_in()
            .with(
                eq(ControlRequest {
                    request_type: REQUEST_TYPE_CLASS_IN,
                    request: REQUEST_SEMVER,
                    value: 0,
                    index: 1,
                }),
                eq(SEMVER_MAX_LENGTH),
            )
            .returning(|_, _| {
                let mut bytes = b"fw 1.0.0".to_vec();
                bytes.extend_from_slice(&[0, 0, 0, 0]);
                Ok(bytes)
            });

        assert_eq!(read_semver(&mut usb, 1).unwrap(), "fw 1.0.0");
    }

    #[test]
    fn test_read_semver_failure_is_typed() {
        let mut usb = MockUsbControl::new();
        usb.expect_is_open().return_const(true);
        usb.expect_control_in()
            .returning(|_, _| Err(UsbError::Stall));

        let result = read_semver(&mut usb, 0);
        assert!(matches!(result, Err(SetupError::SemverReadFailed { .. })));
    }
}
