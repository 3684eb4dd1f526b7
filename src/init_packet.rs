//! Init-packet construction for DFU transfers.
//!
//! An init packet is the small metadata structure transmitted before a
//! firmware image to authorize and validate the upgrade: firmware type,
//! compatibility requirement lists, image size, and an SHA-256 digest in the
//! byte order the bootloader expects.

use sha2::{Digest, Sha256};

use crate::firmware::InitPacketParams;

/// What firmware component an image updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum FirmwareType {
    /// SoftDevice image.
    SoftDevice = 0x01,
    /// Bootloader image.
    Bootloader = 0x02,
    /// Combined SoftDevice + Bootloader image.
    SoftDeviceBootloader = 0x03,
    /// Application image.
    Application = 0x04,
}

impl FirmwareType {
    /// Wire code of this firmware type.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Compute the firmware digest in wire byte order.
///
/// The bootloader compares the SHA-256 digest with its byte order reversed.
pub fn firmware_hash(image: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(image);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    hash.reverse();
    hash
}

/// Build an init packet for one firmware image.
///
/// Layout (little-endian):
/// - hardware version (4)
/// - firmware version (4)
/// - device requirement count (2) + entries (2 each)
/// - SoftDevice requirement count (2) + entries (2 each)
/// - firmware type (1)
/// - image size (4)
/// - SHA-256 digest, byte-order reversed (32)
pub fn build_init_packet(
    firmware_type: FirmwareType,
    params: &InitPacketParams,
    image: &[u8],
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(
        4 + 4 + 2 + params.device_req.len() * 2 + 2 + params.sd_req.len() * 2 + 1 + 4 + 32,
    );

    packet.extend_from_slice(&params.hardware_version.to_le_bytes());
    packet.extend_from_slice(&params.firmware_version.to_le_bytes());

    packet.extend_from_slice(&(params.device_req.len() as u16).to_le_bytes());
    for requirement in &params.device_req {
        packet.extend_from_slice(&requirement.to_le_bytes());
    }

    packet.extend_from_slice(&(params.sd_req.len() as u16).to_le_bytes());
    for requirement in &params.sd_req {
        packet.extend_from_slice(&requirement.to_le_bytes());
    }

    packet.push(firmware_type.code());
    packet.extend_from_slice(&(image.len() as u32).to_le_bytes());
    packet.extend_from_slice(&firmware_hash(image));

    packet
}
