//! Detach-reboot handshake.
//!
//! Sends a DFU detach request on a trigger interface, predicts the post-reset
//! identity, and waits for the device to re-enumerate with a serial port. A
//! detaching device typically drops off the bus before the control transfer
//! completes, so specific transfer errors count as success; the mapping lives
//! in the quirk table in `config`.

use std::time::Duration;

use crate::config::{
    current_platform, detach_outcome, DetachOutcome, DETACH_TIMEOUT_VALUE, REQUEST_DETACH,
    REQUEST_TYPE_CLASS_OUT,
};
use crate::device::{wait_for_device, Capability, DeviceLister, DeviceSnapshot};
use crate::error::{Result, SetupError};
use crate::probe::with_open_handle;
use crate::usb::{ControlRequest, UsbControl};

/// Predict the serial identity the device will report after reset.
///
/// Best-effort: reads the serial string descriptor before detaching and
/// assumes it survives the transition. No firmware contract guarantees this;
/// the waiter's capability-match fallback covers a wrong prediction.
pub fn predict_serial_after_reset(
    usb: &mut dyn UsbControl,
    snapshot: &DeviceSnapshot,
) -> String {
    match with_open_handle(usb, |u| Ok(u.read_serial_string()?)) {
        Ok(serial) if !serial.is_empty() => serial,
        Ok(_) => snapshot.serial_number.clone(),
        Err(e) => {
            log::debug!(
                "cannot read serial descriptor of '{}' before detach: {}",
                snapshot.serial_number,
                e
            );
            snapshot.serial_number.clone()
        }
    }
}

/// Send a detach request and wait for the device to come back.
///
/// Once the detach request has been issued the device will reset regardless
/// of what the caller does next, so this function always runs the
/// re-enumeration wait before returning.
pub fn detach_and_wait(
    usb: &mut dyn UsbControl,
    lister: &dyn DeviceLister,
    snapshot: &DeviceSnapshot,
    interface: u8,
    timeout: Duration,
) -> Result<DeviceSnapshot> {
    let predicted = predict_serial_after_reset(usb, snapshot);

    send_detach(usb, interface)?;
    log::info!(
        "detach sent to '{}'; waiting for '{}' to re-enumerate",
        snapshot.serial_number,
        predicted
    );

    wait_for_device(lister, &predicted, &[Capability::Serial], timeout)
}

fn send_detach(usb: &mut dyn UsbControl, interface: u8) -> Result<()> {
    let request = ControlRequest {
        request_type: REQUEST_TYPE_CLASS_OUT,
        request: REQUEST_DETACH,
        value: DETACH_TIMEOUT_VALUE,
        index: interface as u16,
    };

    with_open_handle(usb, |u| match u.control_out(request, &[]) {
        Ok(()) => Ok(()),
        Err(e) => match detach_outcome(current_platform(), e.kind()) {
            DetachOutcome::Success => {
                log::debug!("detach completed via expected transfer error: {}", e);
                Ok(())
            }
            DetachOutcome::Failure => Err(SetupError::DetachFailed {
                reason: e.to_string(),
            }),
        },
    })
}
