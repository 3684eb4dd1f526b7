//! USB control-transfer collaborator interface.
//!
//! The crate does not talk to USB hardware itself. Callers supply an
//! implementation of [`UsbControl`] bound to one physical device; everything
//! here is the narrow surface the preparation flow needs: class-specific
//! control transfers, string descriptors, and the interface table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Errors surfaced by a USB control collaborator.
#[derive(Debug, Clone, Error)]
pub enum UsbError {
    /// The endpoint stalled the transfer.
    #[error("transfer stalled")]
    Stall,

    /// The device disconnected before the transfer completed.
    #[error("device disconnected")]
    Disconnected,

    /// Access to the device was denied.
    #[error("access denied")]
    Access,

    /// The device is no longer present.
    #[error("device not found")]
    NotFound,

    /// Low-level I/O failure.
    #[error("I/O failure: {0}")]
    Io(String),
}

/// Coarse classification of a [`UsbError`], used by the detach quirk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbErrorKind {
    Stall,
    Disconnected,
    Access,
    NotFound,
    Io,
}

impl UsbError {
    /// The kind of this error.
    pub fn kind(&self) -> UsbErrorKind {
        match self {
            UsbError::Stall => UsbErrorKind::Stall,
            UsbError::Disconnected => UsbErrorKind::Disconnected,
            UsbError::Access => UsbErrorKind::Access,
            UsbError::NotFound => UsbErrorKind::NotFound,
            UsbError::Io(_) => UsbErrorKind::Io,
        }
    }
}

/// A class-specific control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// bmRequestType field.
    pub request_type: u8,
    /// bRequest field.
    pub request: u8,
    /// wValue field.
    pub value: u16,
    /// wIndex field (the interface number for interface-directed requests).
    pub index: u16,
}

/// One entry of a device's USB interface table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// bInterfaceNumber.
    pub number: u8,
    /// bInterfaceClass.
    pub class: u8,
    /// bInterfaceSubClass.
    pub subclass: u8,
    /// bInterfaceProtocol.
    pub protocol: u8,
}

/// Abstraction over USB control transfers for one device.
///
/// Implementations wrap whatever USB stack the host application uses. All
/// methods operate on the single device the handle was created for.
#[cfg_attr(test, automock)]
pub trait UsbControl: Send {
    /// Whether the underlying handle is currently open.
    fn is_open(&self) -> bool;

    /// Open the device handle.
    fn open(&mut self) -> Result<(), UsbError>;

    /// Close the device handle. Closing a closed handle is a no-op.
    fn close(&mut self);

    /// Perform a device-to-host control transfer, returning the bytes read.
    fn control_in(&mut self, request: ControlRequest, length: usize) -> Result<Vec<u8>, UsbError>;

    /// Perform a host-to-device control transfer.
    fn control_out(&mut self, request: ControlRequest, data: &[u8]) -> Result<(), UsbError>;

    /// Read the serial-number string descriptor.
    fn read_serial_string(&mut self) -> Result<String, UsbError>;

    /// The device's interface descriptor table.
    fn interface_descriptors(&mut self) -> Result<Vec<InterfaceDescriptor>, UsbError>;
}
