//! Caller-supplied firmware specifications.
//!
//! A [`FirmwareSpec`] describes the firmware a device must end up running,
//! keyed by board or hardware-family identifier. The DFU side carries images
//! plus the numeric parameters that go into the init packet; the JLink side
//! carries an image path and a check for the currently-flashed firmware
//! identity.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::error::Result;

/// A firmware image, inline or on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareImage {
    /// Raw image bytes.
    Bytes(Vec<u8>),
    /// Path to an image file, read through a [`HexSource`].
    Path(PathBuf),
}

impl FirmwareImage {
    /// Resolve the image to raw bytes.
    pub fn resolve(&self, hex: &dyn HexSource) -> Result<Vec<u8>> {
        match self {
            FirmwareImage::Bytes(bytes) => Ok(bytes.clone()),
            FirmwareImage::Path(path) => hex.read_image(path),
        }
    }
}

/// Firmware-image reading collaborator.
///
/// Hex parsing lives outside this crate; implementations turn a file path
/// into flat image bytes and can extract a contiguous address range.
#[cfg_attr(test, automock)]
pub trait HexSource: Send + Sync {
    /// Read a whole image file into flat bytes.
    fn read_image(&self, path: &Path) -> Result<Vec<u8>>;

    /// Extract the contiguous byte range `[start, end)` of an image file.
    fn extract_range(&self, path: &Path, start: u32, end: u32) -> Result<Vec<u8>>;
}

/// Trivial [`HexSource`] for images that are already flat binaries.
#[derive(Debug, Default)]
pub struct RawBinarySource;

impl HexSource for RawBinarySource {
    fn read_image(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }

    fn extract_range(&self, path: &Path, start: u32, end: u32) -> Result<Vec<u8>> {
        let data = std::fs::read(path)?;
        let start = (start as usize).min(data.len());
        let end = (end as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

/// Numeric parameters encoded into a DFU init packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPacketParams {
    /// Target hardware version.
    pub hardware_version: u32,
    /// Version of the firmware being installed.
    pub firmware_version: u32,
    /// Device types/revisions this firmware is compatible with.
    pub device_req: Vec<u16>,
    /// SoftDevice versions this firmware is compatible with.
    pub sd_req: Vec<u16>,
}

/// One DFU firmware choice.
#[derive(Debug, Clone)]
pub struct DfuFirmware {
    /// Application image.
    pub application: FirmwareImage,
    /// Optional companion SoftDevice image, transferred before the
    /// application.
    pub softdevice: Option<FirmwareImage>,
    /// Semantic version string the application reports when this firmware is
    /// already installed. Compared byte-exact.
    pub expected_semver: String,
    /// Init-packet parameters.
    pub params: InitPacketParams,
    /// Whether the prepared device must expose a working serial port.
    pub needs_serial_port: bool,
    /// Bootloader update bundle, used when the installed bootloader is older
    /// than the supported minimum.
    pub bootloader_bundle: Option<PathBuf>,
}

/// Check for the firmware identity currently flashed on a device.
#[derive(Clone)]
pub enum FirmwareIdentity {
    /// The bytes at the identity address must equal this string exactly.
    Exact(Vec<u8>),
    /// A caller-supplied validator over the bytes read.
    Validator {
        /// Number of bytes to read at the identity address.
        length: usize,
        /// Returns true when the bytes identify the expected firmware.
        validate: Arc<dyn Fn(&[u8]) -> bool + Send + Sync>,
    },
}

impl FirmwareIdentity {
    /// Number of bytes to read from the device for this check.
    pub fn read_length(&self) -> usize {
        match self {
            FirmwareIdentity::Exact(expected) => expected.len(),
            FirmwareIdentity::Validator { length, .. } => *length,
        }
    }

    /// Check bytes read from the device against this identity.
    ///
    /// Exact checks are byte-exact; no case folding or trimming.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        match self {
            FirmwareIdentity::Exact(expected) => expected.as_slice() == bytes,
            FirmwareIdentity::Validator { validate, .. } => validate(bytes),
        }
    }
}

impl fmt::Debug for FirmwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareIdentity::Exact(expected) => {
                f.debug_tuple("Exact").field(expected).finish()
            }
            FirmwareIdentity::Validator { length, .. } => f
                .debug_struct("Validator")
                .field("length", length)
                .finish_non_exhaustive(),
        }
    }
}

/// One JLink firmware choice, keyed by device family.
#[derive(Debug, Clone)]
pub struct JlinkFirmware {
    /// Image file flashed over the debug probe.
    pub image_path: PathBuf,
    /// Memory address where the firmware identity is stored.
    pub identity_address: u32,
    /// Expected firmware identity at that address.
    pub identity: FirmwareIdentity,
    /// Whether a reachable serial port is required before programming.
    pub needs_serial_port: bool,
}

/// The firmware a device must be prepared with.
#[derive(Debug, Clone, Default)]
pub struct FirmwareSpec {
    /// DFU firmware entries, keyed by board identifier.
    pub dfu: BTreeMap<String, DfuFirmware>,
    /// JLink firmware entries, keyed by hardware family.
    pub jlink: BTreeMap<String, JlinkFirmware>,
}

impl FirmwareSpec {
    /// Whether any DFU firmware is defined.
    pub fn has_dfu(&self) -> bool {
        !self.dfu.is_empty()
    }

    /// Whether any JLink firmware is defined.
    pub fn has_jlink(&self) -> bool {
        !self.jlink.is_empty()
    }

    /// Find the DFU entry whose expected version matches `semver` exactly.
    pub fn dfu_entry_matching_semver(&self, semver: &str) -> Option<(&String, &DfuFirmware)> {
        self.dfu.iter().find(|(_, e)| e.expected_semver == semver)
    }
}
