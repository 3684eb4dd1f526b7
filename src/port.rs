//! Serial-port reachability checks.
//!
//! After a DFU cycle the device must come back with a usable serial port, and
//! before JLink programming a required port must be proven reachable (a
//! wedged port would otherwise hang the flow indefinitely). Both checks are
//! an open-then-close probe with bounded retries, since after USB
//! re-enumeration a device can appear in port enumeration before its driver
//! is ready.

use std::time::Duration;

use crate::config::{PORT_OPEN_RETRIES, PORT_OPEN_RETRY_DELAY};
use crate::error::{Result, SetupError};

/// Baud rate used for the open probe. The port is closed again immediately,
/// so the rate only needs to be one the driver accepts.
const PROBE_BAUD_RATE: u32 = 115_200;

/// Timeout configured on the probe handle.
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Verify that a serial port can actually be opened.
///
/// Retries transient failures with a fixed delay; maps persistent failures to
/// [`SetupError::PortBusy`] / [`SetupError::PortPermissionDenied`] where the
/// cause is recognizable.
pub fn verify_serial_port(port_name: &str) -> Result<()> {
    let normalized = normalize_port_name(port_name);
    let mut last_error: Option<serialport::Error> = None;

    for attempt in 0..PORT_OPEN_RETRIES {
        match serialport::new(&normalized, PROBE_BAUD_RATE)
            .timeout(PROBE_TIMEOUT)
            .open()
        {
            Ok(port) => {
                drop(port);
                return Ok(());
            }
            Err(e) => {
                let message = e.to_string().to_lowercase();

                // Transient conditions seen during driver initialization:
                // - "not functioning": Windows driver not ready after USB
                //   re-enumeration
                // - "temporarily unavailable": device briefly claimed
                // - "interrupted": may succeed on retry
                let is_transient = message.contains("not functioning")
                    || message.contains("temporarily unavailable")
                    || message.contains("interrupted")
                    || matches!(e.kind(), serialport::ErrorKind::NoDevice);

                if is_transient && attempt < PORT_OPEN_RETRIES - 1 {
                    std::thread::sleep(PORT_OPEN_RETRY_DELAY);
                    last_error = Some(e);
                    continue;
                }

                return Err(match e.kind() {
                    serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                        SetupError::PortPermissionDenied {
                            port: port_name.to_string(),
                        }
                    }
                    _ if message.contains("busy") || message.contains("in use") => {
                        SetupError::PortBusy {
                            port: port_name.to_string(),
                        }
                    }
                    _ => SetupError::Serial(e),
                });
            }
        }
    }

    Err(SetupError::Serial(last_error.expect(
        "last_error should be set after retry loop",
    )))
}

/// Normalize a port name for cross-platform compatibility.
pub fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. for better compatibility
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}
