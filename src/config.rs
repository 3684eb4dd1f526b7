//! Configuration constants for device preparation.

use std::time::Duration;

use crate::usb::UsbErrorKind;

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// Nordic Semiconductor USB Vendor ID.
pub const NORDIC_VID: u16 = 0x1915;

/// Product ID of the serial DFU bootloader.
pub const BOOTLOADER_PID: u16 = 0x521F;

/// Product string reported by the serial DFU bootloader.
///
/// Used as a fallback when a platform reports a generic PID for composite
/// devices.
pub const BOOTLOADER_PRODUCT_STRING: &str = "Open DFU Bootloader";

/// Check if a VID/PID pair identifies the DFU bootloader.
pub fn is_bootloader_identity(vid: u16, pid: u16) -> bool {
    vid == NORDIC_VID && pid == BOOTLOADER_PID
}

// ============================================================================
// DFU Trigger Interface Signature
// ============================================================================

/// Interface class of the DFU trigger interface (vendor specific).
pub const TRIGGER_INTERFACE_CLASS: u8 = 255;

/// Interface subclass of the DFU trigger interface.
pub const TRIGGER_INTERFACE_SUBCLASS: u8 = 1;

/// Interface protocol of the DFU trigger interface.
pub const TRIGGER_INTERFACE_PROTOCOL: u8 = 1;

/// Check if an interface descriptor triple matches the trigger signature.
pub fn matches_trigger_signature(class: u8, subclass: u8, protocol: u8) -> bool {
    class == TRIGGER_INTERFACE_CLASS
        && subclass == TRIGGER_INTERFACE_SUBCLASS
        && protocol == TRIGGER_INTERFACE_PROTOCOL
}

// ============================================================================
// Control Requests (class-specific, trigger interface)
// ============================================================================

/// DFU_DETACH class request.
pub const REQUEST_DETACH: u8 = 0x00;

/// Vendor request to read the firmware semantic version string.
pub const REQUEST_SEMVER: u8 = 0x08;

/// bmRequestType for host-to-device class requests on an interface.
pub const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;

/// bmRequestType for device-to-host class requests on an interface.
pub const REQUEST_TYPE_CLASS_IN: u8 = 0xA1;

/// Maximum length of the semantic version string returned by the device.
pub const SEMVER_MAX_LENGTH: usize = 256;

/// wValue passed with DFU_DETACH: time the device may wait before resetting.
pub const DETACH_TIMEOUT_VALUE: u16 = 1000;

// ============================================================================
// Timeouts and Retry Configuration
// ============================================================================

/// Default timeout for a device to re-enumerate after a mode change.
pub const ENUMERATION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Bounded number of delayed re-checks after the exact-serial wait expires.
pub const FALLBACK_RECHECKS: u32 = 2;

/// Delay between fallback re-checks.
pub const FALLBACK_RECHECK_DELAY: Duration = Duration::from_millis(150);

/// Interval between port scans in the serial-port device lister.
pub const PORT_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum number of attempts when validating that a serial port opens.
pub const PORT_OPEN_RETRIES: u32 = 10;

/// Delay between serial-port open attempts.
pub const PORT_OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// Bootloader Version Requirements
// ============================================================================

/// Minimum bootloader firmware version able to accept current init packets.
///
/// Devices reporting an older bootloader get a bootloader-only update cycle
/// before the application transfer, when an update bundle is available.
pub const MIN_BOOTLOADER_VERSION: u32 = 3;

// ============================================================================
// Detach Quirk Table
// ============================================================================

/// Host platform, for quirk matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

/// Platform selector in the quirk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuirkPlatform {
    Any,
    Windows,
}

impl QuirkPlatform {
    fn matches(self, platform: Platform) -> bool {
        match self {
            QuirkPlatform::Any => true,
            QuirkPlatform::Windows => platform == Platform::Windows,
        }
    }
}

/// Outcome of a detach request whose control transfer did not complete
/// normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The error is the expected signature of a successful detach.
    Success,
    /// The error is a genuine failure.
    Failure,
}

/// Error codes that signal a *successful* detach.
///
/// A detaching device drops off the bus before completing the status stage,
/// so the transfer surfaces as an error on the host side. Which error depends
/// on the platform and USB stack. Entries here require hardware-in-the-loop
/// verification per target platform.
pub const DETACH_QUIRKS: &[(QuirkPlatform, UsbErrorKind, DetachOutcome)] = &[
    // The device stalls the request while it reboots.
    (QuirkPlatform::Any, UsbErrorKind::Stall, DetachOutcome::Success),
    // The device disconnects before the response is returned.
    (
        QuirkPlatform::Any,
        UsbErrorKind::Disconnected,
        DetachOutcome::Success,
    ),
    // winusb reports a raw I/O failure when the device vanishes mid-transfer.
    (QuirkPlatform::Windows, UsbErrorKind::Io, DetachOutcome::Success),
];

/// Classify a failed detach transfer against the quirk table.
pub fn detach_outcome(platform: Platform, kind: UsbErrorKind) -> DetachOutcome {
    for (quirk_platform, quirk_kind, outcome) in DETACH_QUIRKS {
        if quirk_platform.matches(platform) && *quirk_kind == kind {
            return *outcome;
        }
    }
    DetachOutcome::Failure
}

/// The platform this process is running on.
pub fn current_platform() -> Platform {
    if cfg!(target_os = "linux") {
        Platform::Linux
    } else if cfg!(target_os = "macos") {
        Platform::MacOs
    } else if cfg!(target_os = "windows") {
        Platform::Windows
    } else {
        Platform::Other
    }
}
