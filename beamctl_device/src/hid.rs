//! USB-HID transport.
//!
//! Some bench-top devices ship with a USB HID interface instead of a
//! serial or network port. On Linux the kernel exposes them as
//! `/dev/hidraw*` character devices: writes send output reports, reads
//! block until an input report arrives. A dedicated reader thread turns
//! the blocking reads into the same chunk-oriented [`Transport`]
//! interface the communication worker expects.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};

use beamctl_common::error::DeviceError;

use crate::transport::Transport;

/// Largest HID report the reader accepts.
const MAX_REPORT_SIZE: usize = 64;

/// Transport over a raw HID character device.
pub struct HidTransport {
    device: File,
    inbound: Receiver<Vec<u8>>,
}

impl HidTransport {
    /// Open a `hidraw` device node.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                DeviceError::Communication(format!(
                    "cannot open HID device {}: {e}",
                    path.display()
                ))
            })?;
        let mut reader = device.try_clone().map_err(|e| {
            DeviceError::Communication(format!("cannot clone the HID handle: {e}"))
        })?;
        let (tx, inbound) = unbounded();
        let name = format!("hid-{}", path.display());
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut report = [0u8; MAX_REPORT_SIZE];
                loop {
                    match reader.read(&mut report) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(report[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                // Dropping the sender signals the detach to recv().
            })
            .map_err(|e| DeviceError::Communication(e.to_string()))?;
        Ok(Self { device, inbound })
    }
}

impl Transport for HidTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        if data.len() > MAX_REPORT_SIZE {
            return Err(DeviceError::Communication(format!(
                "HID report of {} bytes exceeds the {MAX_REPORT_SIZE}-byte limit",
                data.len()
            )));
        }
        self.device
            .write_all(data)
            .map_err(|e| DeviceError::Communication(format!("HID write failed: {e}")))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, DeviceError> {
        match self.inbound.recv_timeout(timeout) {
            Ok(report) => Ok(Some(report)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::Communication(
                "HID device detached".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_a_missing_device_is_a_communication_error() {
        let result = HidTransport::open("/dev/hidraw-does-not-exist");
        assert!(matches!(result, Err(DeviceError::Communication(_))));
    }

    #[test]
    fn oversized_reports_are_rejected_before_writing() {
        // A plain file stands in for the device node.
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut transport = HidTransport::open(file.path()).unwrap();
        let oversized = vec![0u8; MAX_REPORT_SIZE + 1];
        assert!(matches!(
            transport.send(&oversized),
            Err(DeviceError::Communication(_))
        ));
        transport.send(&[0x02, 0x01]).unwrap();
    }
}
