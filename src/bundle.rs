//! DFU update bundle reader.
//!
//! Reads a Nordic DFU zip bundle containing:
//! - manifest.json - bundle metadata
//! - *.bin - firmware binary
//! - *.dat - init packet
//!
//! A bundle carries either an application image or a bootloader image; the
//! bootloader variant drives the bootloader-update cycle before an
//! application transfer.

use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, SetupError};
use crate::init_packet::FirmwareType;

/// Contents of a DFU update bundle.
#[derive(Debug)]
pub struct UpdateBundle {
    /// Init packet data (.dat contents).
    pub init_data: Vec<u8>,
    /// Firmware binary data (.bin contents).
    pub firmware_data: Vec<u8>,
    /// Parsed manifest metadata.
    pub manifest: BundleManifest,
}

/// Parsed manifest.json data.
#[derive(Debug, Clone)]
pub struct BundleManifest {
    /// Which firmware component the bundle updates.
    pub firmware_type: FirmwareType,
    /// DFU protocol version from the manifest, if present.
    pub dfu_version: Option<f32>,
    /// CRC16 of the firmware binary, if recorded.
    pub firmware_crc16: Option<u16>,
    /// Name of the binary file.
    bin_file: String,
    /// Name of the init packet file.
    dat_file: String,
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: ManifestInner,
}

#[derive(Debug, Deserialize)]
struct ManifestInner {
    application: Option<ManifestEntry>,
    bootloader: Option<ManifestEntry>,
    dfu_version: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    bin_file: String,
    dat_file: String,
    init_packet_data: Option<InitPacketData>,
}

#[derive(Debug, Deserialize)]
struct InitPacketData {
    firmware_crc16: Option<u16>,
}

/// Read and parse a DFU update bundle.
///
/// Verifies the firmware binary against the CRC16 recorded in the manifest
/// when one is present.
pub fn read_bundle<P: AsRef<Path>>(path: P) -> Result<UpdateBundle> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let manifest = read_manifest(&mut archive)?;

    let init_data = read_file_from_zip(&mut archive, &manifest.dat_file)?;
    let firmware_data = read_file_from_zip(&mut archive, &manifest.bin_file)?;

    if let Some(expected) = manifest.firmware_crc16 {
        let actual = crc16::State::<crc16::CCITT_FALSE>::calculate(&firmware_data);
        if actual != expected {
            return Err(SetupError::CrcMismatch { expected, actual });
        }
    }

    Ok(UpdateBundle {
        init_data,
        firmware_data,
        manifest,
    })
}

/// Read and parse the manifest.json from the archive.
fn read_manifest(archive: &mut zip::ZipArchive<std::fs::File>) -> Result<BundleManifest> {
    let mut manifest_file =
        archive
            .by_name("manifest.json")
            .map_err(|_| SetupError::MissingFile {
                filename: "manifest.json".to_string(),
            })?;

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;

    let raw: RawManifest = serde_json::from_str(&contents)?;

    let (firmware_type, entry) = if let Some(application) = raw.manifest.application {
        (FirmwareType::Application, application)
    } else if let Some(bootloader) = raw.manifest.bootloader {
        (FirmwareType::Bootloader, bootloader)
    } else {
        return Err(SetupError::InvalidManifest {
            reason: "neither application nor bootloader entry present".to_string(),
        });
    };

    Ok(BundleManifest {
        firmware_type,
        dfu_version: raw.manifest.dfu_version,
        firmware_crc16: entry.init_packet_data.and_then(|d| d.firmware_crc16),
        bin_file: entry.bin_file,
        dat_file: entry.dat_file,
    })
}

/// Read a file from the zip archive by name.
fn read_file_from_zip(
    archive: &mut zip::ZipArchive<std::fs::File>,
    name: &str,
) -> Result<Vec<u8>> {
    let mut file = archive.by_name(name).map_err(|_| SetupError::MissingFile {
        filename: name.to_string(),
    })?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn create_bundle(
        dir: &TempDir,
        manifest: Option<&str>,
        bin: Option<&[u8]>,
        dat: Option<&[u8]>,
    ) -> std::path::PathBuf {
        let zip_path = dir.path().join("update.zip");
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        if let Some(manifest_content) = manifest {
            zip.start_file("manifest.json", options).unwrap();
            zip.write_all(manifest_content.as_bytes()).unwrap();
        }
        if let Some(bin) = bin {
            zip.start_file("firmware.bin", options).unwrap();
            zip.write_all(bin).unwrap();
        }
        if let Some(dat) = dat {
            zip.start_file("firmware.dat", options).unwrap();
            zip.write_all(dat).unwrap();
        }

        zip.finish().unwrap();
        zip_path
    }

    fn application_manifest(crc: u16) -> String {
        format!(
            r#"{{
                "manifest": {{
                    "application": {{
                        "bin_file": "firmware.bin",
                        "dat_file": "firmware.dat",
                        "init_packet_data": {{ "firmware_crc16": {} }}
                    }},
                    "dfu_version": 0.5
                }}
            }}"#,
            crc
        )
    }

    const BIN: &[u8] = &[0x01, 0x02, 0x03, 0x04];
    const DAT: &[u8] = &[0x0A, 0x0B, 0x0C];

    fn bin_crc() -> u16 {
        crc16::State::<crc16::CCITT_FALSE>::calculate(BIN)
    }

    #[test]
    fn test_read_valid_application_bundle() {
        let dir = TempDir::new().unwrap();
        let path = create_bundle(
            &dir,
            Some(&application_manifest(bin_crc())),
            Some(BIN),
            Some(DAT),
        );

        let bundle = read_bundle(&path).unwrap();

        assert_eq!(bundle.firmware_data, BIN);
        assert_eq!(bundle.init_data, DAT);
        assert_eq!(bundle.manifest.firmware_type, FirmwareType::Application);
        assert_eq!(bundle.manifest.dfu_version, Some(0.5));
        assert_eq!(bundle.manifest.firmware_crc16, Some(bin_crc()));
    }

    #[test]
    fn test_read_bootloader_bundle() {
        let dir = TempDir::new().unwrap();
        let manifest = r#"{
            "manifest": {
                "bootloader": {
                    "bin_file": "firmware.bin",
                    "dat_file": "firmware.dat"
                }
            }
        }"#;
        let path = create_bundle(&dir, Some(manifest), Some(BIN), Some(DAT));

        let bundle = read_bundle(&path).unwrap();

        assert_eq!(bundle.manifest.firmware_type, FirmwareType::Bootloader);
        assert_eq!(bundle.manifest.dfu_version, None);
        // No recorded CRC: nothing to verify.
        assert_eq!(bundle.manifest.firmware_crc16, None);
    }

    #[test]
    fn test_crc_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let wrong = bin_crc().wrapping_add(1);
        let path = create_bundle(&dir, Some(&application_manifest(wrong)), Some(BIN), Some(DAT));

        let result = read_bundle(&path);

        assert!(matches!(
            result,
            Err(SetupError::CrcMismatch { expected, actual })
                if expected == wrong && actual == bin_crc()
        ));
    }

    #[test]
    fn test_read_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let path = create_bundle(&dir, None, Some(BIN), Some(DAT));

        let result = read_bundle(&path);

        assert!(matches!(
            result,
            Err(SetupError::MissingFile { filename }) if filename == "manifest.json"
        ));
    }

    #[test]
    fn test_read_missing_firmware_bin() {
        let dir = TempDir::new().unwrap();
        let path = create_bundle(&dir, Some(&application_manifest(bin_crc())), None, Some(DAT));

        let result = read_bundle(&path);

        assert!(matches!(
            result,
            Err(SetupError::MissingFile { filename }) if filename == "firmware.bin"
        ));
    }

    #[test]
    fn test_read_manifest_without_entries() {
        let dir = TempDir::new().unwrap();
        let path = create_bundle(&dir, Some(r#"{ "manifest": {} }"#), Some(BIN), Some(DAT));

        let result = read_bundle(&path);

        assert!(matches!(result, Err(SetupError::InvalidManifest { .. })));
    }

    #[test]
    fn test_read_invalid_manifest_json() {
        let dir = TempDir::new().unwrap();
        let path = create_bundle(&dir, Some("{ invalid json }"), Some(BIN), Some(DAT));

        let result = read_bundle(&path);

        assert!(matches!(result, Err(SetupError::Json(_))));
    }

    #[test]
    fn test_nonexistent_bundle_path() {
        let result = read_bundle("/nonexistent/path/update.zip");
        assert!(matches!(result, Err(SetupError::Io(_))));
    }
}
