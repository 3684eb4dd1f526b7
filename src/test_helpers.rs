//! Shared test fixtures: snapshot/spec builders and canned collaborators.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;

use crate::config::{BOOTLOADER_PID, NORDIC_VID};
use crate::device::{
    Capability, DeviceLister, DeviceMap, DeviceSnapshot, Subscription, UsbIdentity,
};
use crate::firmware::{DfuFirmware, FirmwareImage, InitPacketParams};
use crate::usb::InterfaceDescriptor;

/// Builder for test [`DeviceSnapshot`] instances.
pub struct SnapshotBuilder {
    serial: String,
    capabilities: Vec<Capability>,
    has_usb: bool,
    vid: u16,
    pid: u16,
    product: Option<String>,
    interfaces: Vec<InterfaceDescriptor>,
    serial_port: Option<String>,
    probe_id: Option<u32>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self {
            serial: "FA000001".to_string(),
            capabilities: vec![Capability::Serial, Capability::UsbControl],
            has_usb: true,
            vid: NORDIC_VID,
            pid: 0x520F,
            product: None,
            interfaces: Vec::new(),
            serial_port: Some("/dev/ttyACM0".to_string()),
            probe_id: None,
        }
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = serial.to_string();
        self
    }

    pub fn capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    pub fn vid_pid(mut self, vid: u16, pid: u16) -> Self {
        self.vid = vid;
        self.pid = pid;
        self
    }

    pub fn product(mut self, product: &str) -> Self {
        self.product = Some(product.to_string());
        self
    }

    /// Give the snapshot the DFU bootloader USB identity.
    pub fn bootloader(self) -> Self {
        self.vid_pid(NORDIC_VID, BOOTLOADER_PID)
    }

    /// Record a DFU trigger interface in the interface table.
    pub fn trigger_interface(mut self, number: u8) -> Self {
        self.interfaces.push(InterfaceDescriptor {
            number,
            class: 255,
            subclass: 1,
            protocol: 1,
        });
        self
    }

    pub fn no_serial_port(mut self) -> Self {
        self.serial_port = None;
        self
    }

    pub fn no_usb(mut self) -> Self {
        self.has_usb = false;
        self
    }

    /// Attach a debug probe to the snapshot.
    pub fn jlink(mut self) -> Self {
        if !self.capabilities.contains(&Capability::JlinkProbe) {
            self.capabilities.push(Capability::JlinkProbe);
        }
        self.probe_id = Some(1);
        self
    }

    pub fn build(self) -> DeviceSnapshot {
        DeviceSnapshot {
            serial_number: self.serial,
            capabilities: BTreeSet::from_iter(self.capabilities),
            usb: self.has_usb.then(|| UsbIdentity {
                vid: self.vid,
                pid: self.pid,
                product: self.product,
                interfaces: self.interfaces,
            }),
            serial_port: self.serial_port,
            probe_id: self.probe_id,
        }
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal DFU firmware entry with an inline application image.
pub fn dfu_firmware(semver: &str) -> DfuFirmware {
    DfuFirmware {
        application: FirmwareImage::Bytes(vec![0xA5; 32]),
        softdevice: None,
        expected_semver: semver.to_string(),
        params: InitPacketParams {
            hardware_version: 52,
            firmware_version: 1,
            device_req: vec![0x0052],
            sd_req: vec![0x00B6],
        },
        needs_serial_port: false,
        bootloader_bundle: None,
    }
}

/// Lister that reports a fixed device set once, then goes quiet.
///
/// `unsubscribed` flips to true when a waiter releases its subscription.
pub struct StaticLister {
    pub devices: Vec<DeviceSnapshot>,
    pub unsubscribed: Arc<AtomicBool>,
}

impl StaticLister {
    pub fn new(devices: Vec<DeviceSnapshot>) -> Self {
        Self {
            devices,
            unsubscribed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl DeviceLister for StaticLister {
    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        let mut map = DeviceMap::new();
        for device in &self.devices {
            map.insert(device.serial_number.clone(), device.clone());
        }
        let _ = tx.send(map);
        let flag = Arc::clone(&self.unsubscribed);
        Subscription::new(
            rx,
            Some(Box::new(move || {
                flag.store(true, std::sync::atomic::Ordering::SeqCst)
            })),
        )
    }

    fn list(&self) -> Vec<DeviceSnapshot> {
        self.devices.clone()
    }
}

/// Write a bootloader update bundle to `dir` and return its path.
pub fn write_bootloader_bundle(dir: &Path, bin: &[u8]) -> PathBuf {
    use std::io::Write;
    use zip::write::FileOptions;

    let path = dir.join("bootloader-update.zip");
    let file = std::fs::File::create(&path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

    let manifest = r#"{
        "manifest": {
            "bootloader": {
                "bin_file": "bootloader.bin",
                "dat_file": "bootloader.dat"
            }
        }
    }"#;
    zip.start_file("manifest.json", options).unwrap();
    zip.write_all(manifest.as_bytes()).unwrap();
    zip.start_file("bootloader.bin", options).unwrap();
    zip.write_all(bin).unwrap();
    zip.start_file("bootloader.dat", options).unwrap();
    zip.write_all(&[0x01, 0x02]).unwrap();
    zip.finish().unwrap();

    path
}
