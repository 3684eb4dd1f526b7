//! Device snapshots, the device-listing collaborator, and the
//! re-enumeration waiter.
//!
//! A [`DeviceSnapshot`] is an immutable view of one physical device at one
//! point in time. Snapshots are produced by a [`DeviceLister`] and never
//! mutated; any state change on the device produces a fresh snapshot after
//! re-enumeration. The serial number is the stable identity that bridges
//! snapshots across mode transitions of the same physical unit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};

#[cfg(test)]
use mockall::automock;

use crate::config::{
    FALLBACK_RECHECKS, FALLBACK_RECHECK_DELAY, NORDIC_VID, PORT_SCAN_INTERVAL,
};
use crate::error::{Result, SetupError};
use crate::usb::InterfaceDescriptor;

/// A transport the host can currently use to talk to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// USB control transfers (trigger interface, detach requests).
    UsbControl,
    /// A serial port (CDC ACM) is exposed.
    Serial,
    /// A debug probe is attached to the device.
    JlinkProbe,
}

/// USB identity fields of a snapshot, when the device is visible on USB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbIdentity {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// Product string (if reported).
    pub product: Option<String>,
    /// Interface descriptor table (may be empty if not yet read).
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Immutable view of one physical device at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Stable serial identifier, preserved across mode transitions.
    pub serial_number: String,
    /// Transports currently available on this device.
    pub capabilities: BTreeSet<Capability>,
    /// USB identity, when enumerated over USB.
    pub usb: Option<UsbIdentity>,
    /// Serial port path (e.g. "/dev/cu.usbmodem1234" or "COM3").
    pub serial_port: Option<String>,
    /// Debug probe identifier, when a probe is attached.
    pub probe_id: Option<u32>,
}

impl DeviceSnapshot {
    /// Check a single capability.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Check that every capability in `required` is available.
    pub fn has_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Get a display label for this device.
    pub fn display_label(&self) -> String {
        if let Some(product) = self.usb.as_ref().and_then(|u| u.product.clone()) {
            product
        } else {
            format!("Nordic device ({})", self.serial_number)
        }
    }
}

/// The full current device set, keyed by serial number.
pub type DeviceMap = BTreeMap<String, DeviceSnapshot>;

/// A registration on a lister's notification stream.
///
/// Receives the full device map whenever the attached-device set changes.
/// Dropping the subscription deregisters it; listeners are never leaked to
/// garbage collection.
pub struct Subscription {
    receiver: Receiver<DeviceMap>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription from a receiver and a deregistration action.
    pub fn new(
        receiver: Receiver<DeviceMap>,
        unsubscribe: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            receiver,
            unsubscribe,
        }
    }

    /// Wait up to `timeout` for the next device-set change event.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<DeviceMap, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Push-based enumeration of attached devices.
///
/// Subscribers receive the full device map on every change; `list` takes a
/// one-shot snapshot of the current set.
#[cfg_attr(test, automock)]
pub trait DeviceLister: Send + Sync {
    /// Register on the notification stream. The current device set is
    /// delivered as the first event.
    fn subscribe(&self) -> Subscription;

    /// One-shot snapshot of the currently attached devices.
    fn list(&self) -> Vec<DeviceSnapshot>;
}

/// Wait for a device with the given serial number and capabilities to appear.
///
/// Event-driven: blocks on the lister's notification stream rather than
/// polling. Fails with [`SetupError::DeviceNotFound`] once `timeout` elapses.
///
/// The target serial is a prediction when called after a reset, and no
/// firmware contract guarantees it survives the transition. When the exact
/// serial never appears, a bounded number of delayed re-checks accepts a
/// device that *uniquely* matches the required capability set.
pub fn wait_for_device(
    lister: &dyn DeviceLister,
    serial: &str,
    required: &[Capability],
    timeout: Duration,
) -> Result<DeviceSnapshot> {
    let deadline = Instant::now() + timeout;
    let subscription = lister.subscribe();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match subscription.recv_timeout(remaining) {
            Ok(map) => {
                if let Some(found) = map.get(serial) {
                    if found.has_all(required) {
                        return Ok(found.clone());
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                // Lister shut down; nothing more will arrive on this stream.
                // Hold to the deadline so failure timing stays deterministic,
                // then run the one-shot re-checks.
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
                break;
            }
        }
    }
    drop(subscription);

    for _ in 0..FALLBACK_RECHECKS {
        thread::sleep(FALLBACK_RECHECK_DELAY);
        let devices = lister.list();
        if let Some(found) = devices.iter().find(|d| d.serial_number == serial) {
            if found.has_all(required) {
                return Ok(found.clone());
            }
        }
        let candidates: Vec<&DeviceSnapshot> =
            devices.iter().filter(|d| d.has_all(required)).collect();
        if candidates.len() == 1 {
            log::warn!(
                "device '{}' not seen after reset; accepting sole capability match '{}'",
                serial,
                candidates[0].serial_number
            );
            return Ok(candidates[0].clone());
        }
    }

    Err(SetupError::DeviceNotFound {
        serial: serial.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    })
}

// ============================================================================
// Serial-port-backed lister
// ============================================================================

struct ListerShared {
    subscribers: Mutex<Vec<(u64, mpsc::Sender<DeviceMap>)>>,
    next_id: AtomicU64,
    stop: AtomicBool,
}

/// Production [`DeviceLister`] backed by serial-port enumeration.
///
/// A background scan thread diffs the attached-port set and pushes the full
/// device map to subscribers whenever it changes.
pub struct SerialPortLister {
    shared: Arc<ListerShared>,
    scanner: Option<thread::JoinHandle<()>>,
}

impl SerialPortLister {
    /// Start the lister and its background scan thread.
    pub fn new() -> Self {
        let shared = Arc::new(ListerShared {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });

        let scan_shared = Arc::clone(&shared);
        let scanner = thread::spawn(move || {
            let mut last = DeviceMap::new();
            while !scan_shared.stop.load(Ordering::Relaxed) {
                let map = scan_serial_ports();
                if map != last {
                    last = map.clone();
                    let mut subscribers = scan_shared
                        .subscribers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    subscribers.retain(|(_, tx)| tx.send(map.clone()).is_ok());
                }
                thread::sleep(PORT_SCAN_INTERVAL);
            }
        });

        Self {
            shared,
            scanner: Some(scanner),
        }
    }
}

impl Default for SerialPortLister {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLister for SerialPortLister {
    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        // Seed with the current state so a waiter observes devices that are
        // already attached.
        let _ = tx.send(scan_serial_ports());

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, tx));

        let shared = Arc::clone(&self.shared);
        Subscription::new(
            rx,
            Some(Box::new(move || {
                shared
                    .subscribers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|(other, _)| *other != id);
            })),
        )
    }

    fn list(&self) -> Vec<DeviceSnapshot> {
        scan_serial_ports().into_values().collect()
    }
}

impl Drop for SerialPortLister {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(scanner) = self.scanner.take() {
            let _ = scanner.join();
        }
    }
}

/// Scan attached serial ports into a device map.
///
/// On macOS, `tty.*` ports are skipped to avoid duplicates (each device
/// appears as both `cu.*` and `tty.*`; `cu.*` doesn't block waiting for DCD).
fn scan_serial_ports() -> DeviceMap {
    let mut map = DeviceMap::new();

    let ports = match available_ports() {
        Ok(ports) => ports,
        Err(_) => return map,
    };

    for port in ports {
        #[cfg(target_os = "macos")]
        if port.port_name.contains("/dev/tty.") {
            continue;
        }

        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            // Devices without a serial number cannot be tracked through mode
            // changes; skip them.
            let Some(serial) = usb_info.serial_number.clone() else {
                continue;
            };

            let mut capabilities = BTreeSet::new();
            capabilities.insert(Capability::Serial);
            if usb_info.vid == NORDIC_VID {
                capabilities.insert(Capability::UsbControl);
            }

            map.insert(
                serial.clone(),
                DeviceSnapshot {
                    serial_number: serial,
                    capabilities,
                    usb: Some(UsbIdentity {
                        vid: usb_info.vid,
                        pid: usb_info.pid,
                        product: usb_info.product.clone(),
                        interfaces: Vec::new(),
                    }),
                    serial_port: Some(port.port_name.clone()),
                    probe_id: None,
                },
            );
        }
    }

    map
}
