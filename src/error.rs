//! Error types for device preparation.

use thiserror::Error;

use crate::usb::UsbError;

/// Result type alias for setup operations.
pub type Result<T> = std::result::Result<T, SetupError>;

/// Errors that can occur while preparing a device.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// USB control transfer error.
    #[error("USB error: {0}")]
    Usb(#[from] UsbError),

    /// ZIP archive error while reading an update bundle.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing error for a bundle manifest.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Device did not re-enumerate within the timeout.
    #[error("Device '{serial}' not found within {timeout_ms}ms")]
    DeviceNotFound { serial: String, timeout_ms: u64 },

    /// Detach request was rejected for an unrecognized reason.
    #[error("Detach request failed: {reason}")]
    DetachFailed { reason: String },

    /// A required serial port is absent after otherwise-successful classification.
    #[error("Device '{serial}' exposes no serial port")]
    MissingSerialPort { serial: String },

    /// No firmware entry exists for the detected hardware family.
    #[error("No firmware defined for device family '{family}'")]
    UnsupportedFamily { family: String },

    /// A DFU step failed for a reason other than user cancellation.
    #[error("DFU failed during {operation}: {source}")]
    DfuFailed {
        operation: String,
        #[source]
        source: Box<SetupError>,
    },

    /// Flashing over the debug probe failed.
    #[error("Programming failed: {source}")]
    ProgrammingFailed {
        #[source]
        source: Box<SetupError>,
    },

    /// Debug probe operation failed.
    #[error("Debug probe error during {operation}: {reason}")]
    Probe { operation: String, reason: String },

    /// User declined at a confirmation gate.
    #[error("Setup cancelled by user")]
    SetupCancelled,

    /// Semantic version could not be read over the trigger interface.
    #[error("Failed to read firmware version: {reason}")]
    SemverReadFailed { reason: String },

    /// Required file missing from an update bundle.
    #[error("Missing file in update bundle: {filename}")]
    MissingFile { filename: String },

    /// Invalid or malformed bundle manifest.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Bundle image does not match the checksum recorded in its manifest.
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Serial port is busy (in use by another process).
    #[error("Port '{port}' is busy or in use by another application")]
    PortBusy { port: String },

    /// Permission denied accessing a serial port.
    #[error("Permission denied for port '{port}'")]
    PortPermissionDenied { port: String },

    /// Device has no serial number (required for tracking through mode changes).
    #[error("Device has no serial number - cannot track through mode changes")]
    NoSerialNumber,

    /// A collaborator required by the resolved mode was not supplied.
    #[error("Missing collaborator: {name}")]
    MissingCollaborator { name: String },
}

impl SetupError {
    /// Check if this error is retriable by the caller.
    ///
    /// Re-enumeration timeouts and transient port contention may succeed on a
    /// later attempt; classification and transfer failures will not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SetupError::DeviceNotFound { .. } | SetupError::PortBusy { .. }
        )
    }

    /// Check if this error is a user cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SetupError::SetupCancelled)
    }

    /// Get a stable error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            SetupError::Serial(_) => "SETUP-001",
            SetupError::Io(_) => "SETUP-002",
            SetupError::Usb(_) => "SETUP-003",
            SetupError::Zip(_) => "SETUP-004",
            SetupError::Json(_) => "SETUP-005",
            SetupError::DeviceNotFound { .. } => "SETUP-010",
            SetupError::DetachFailed { .. } => "SETUP-011",
            SetupError::MissingSerialPort { .. } => "SETUP-012",
            SetupError::UnsupportedFamily { .. } => "SETUP-013",
            SetupError::DfuFailed { .. } => "SETUP-020",
            SetupError::ProgrammingFailed { .. } => "SETUP-021",
            SetupError::Probe { .. } => "SETUP-022",
            SetupError::SemverReadFailed { .. } => "SETUP-030",
            SetupError::MissingFile { .. } => "SETUP-040",
            SetupError::InvalidManifest { .. } => "SETUP-041",
            SetupError::CrcMismatch { .. } => "SETUP-042",
            SetupError::PortBusy { .. } => "SETUP-050",
            SetupError::PortPermissionDenied { .. } => "SETUP-051",
            SetupError::NoSerialNumber => "SETUP-052",
            SetupError::MissingCollaborator { .. } => "SETUP-060",
            SetupError::SetupCancelled => "SETUP-099",
        }
    }

    /// Wrap a lower-level error with the DFU operation that produced it.
    pub fn dfu(operation: impl Into<String>, source: SetupError) -> Self {
        SetupError::DfuFailed {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}
