//! Vacuum gauge back-end.
//!
//! Framed ASCII protocol: every message starts with the device address
//! `001` and ends with `\r`, with a modulo-64 checksum character before
//! the terminator. The pressure reading is a four-digit mantissa and a
//! two-digit exponent biased by 23:
//! `pressure = mantissa * 10^(exponent - 23)` mbar.
//!
//! The gauge answers queries without pairing; replies identify
//! themselves by their command letter.

use std::time::Duration;

use beamctl_common::error::DeviceError;

use crate::backend::{BackendIo, DeviceProcedure};
use crate::transport::split_lines;
use crate::message::DeviceStatus;
use crate::variable::{VarSpec, VarValue};
use crate::varname::VarName;

/// Pressure above which there is effectively no vacuum [mbar].
pub const NO_VACUUM_ABOVE: f64 = 1.0;
/// Pressure below which the vacuum is good enough for measurement.
pub const VACUUM_OK_BELOW: f64 = 0.1;

/// Classify a pressure reading the way the status page shows it.
pub fn classify(pressure: f64) -> &'static str {
    if pressure > NO_VACUUM_ABOVE {
        "No vacuum"
    } else if pressure > VACUUM_OK_BELOW {
        "Medium vacuum"
    } else {
        "Vacuum OK"
    }
}

/// Append the modulo-64 checksum and terminator to a message stem.
fn frame(stem: &[u8]) -> Vec<u8> {
    let checksum = stem.iter().fold(0u32, |acc, b| acc + u32::from(*b)) % 64 + 64;
    let mut out = stem.to_vec();
    out.push(checksum as u8);
    out.push(b'\r');
    out
}

/// TPG-class vacuum gauge back-end.
pub struct VacuumGaugeBackend;

impl VacuumGaugeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VacuumGaugeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProcedure for VacuumGaugeBackend {
    fn device_type(&self) -> &'static str {
        "vacuumgauge"
    }

    fn variables(&self) -> Vec<VarSpec> {
        vec![
            VarSpec::new(VarName::plain("pressure"))
                .urgent()
                .timeout(Duration::from_secs(1)),
            VarSpec::new(VarName::plain("version")),
            VarSpec::new(VarName::plain("units")),
        ]
    }

    fn query(&mut self, io: &mut BackendIo, name: &VarName) -> Result<(), DeviceError> {
        match name.base() {
            "pressure" => io.send_direct(frame(b"001M")),
            "version" => io.send_direct(frame(b"001T")),
            "units" => io.send_direct(frame(b"001U")),
            other => Err(DeviceError::UnknownVariable(other.to_string())),
        }
    }

    fn execute(
        &mut self,
        io: &mut BackendIo,
        command: &str,
        _args: &[VarValue],
    ) -> Result<(), DeviceError> {
        io.command_failed(command, "the vacuum gauge has no commands");
        Ok(())
    }

    fn interpret(
        &mut self,
        io: &mut BackendIo,
        frame: &[u8],
        _sent: Option<&[u8]>,
    ) -> Result<(), DeviceError> {
        if frame.is_empty() {
            return Ok(());
        }
        if !frame.starts_with(b"001") || frame.len() < 5 {
            return Err(DeviceError::Communication(format!(
                "invalid gauge message: {frame:02x?}"
            )));
        }
        let (body, checksum) = frame.split_at(frame.len() - 1);
        let expected = body.iter().fold(0u32, |acc, b| acc + u32::from(*b)) % 64 + 64;
        if u32::from(checksum[0]) != expected {
            return Err(DeviceError::Communication(format!(
                "checksum error on gauge message {frame:02x?}"
            )));
        }
        let payload = &body[4..];
        match body[3] {
            b'M' => {
                if payload.len() < 6 {
                    return Err(DeviceError::Device("short pressure reading".into()));
                }
                let mantissa: f64 = String::from_utf8_lossy(&payload[..4])
                    .parse()
                    .map_err(|_| DeviceError::Device("unparsable pressure mantissa".into()))?;
                let exponent: f64 = String::from_utf8_lossy(&payload[4..6])
                    .parse()
                    .map_err(|_| DeviceError::Device("unparsable pressure exponent".into()))?;
                let pressure = mantissa * 10f64.powf(exponent - 23.0);
                if io.update(&VarName::plain("pressure"), pressure) {
                    io.set_auxstatus(classify(pressure));
                }
                Ok(())
            }
            b'T' => {
                io.update(
                    &VarName::plain("version"),
                    String::from_utf8_lossy(payload).trim().to_string(),
                );
                Ok(())
            }
            b'U' => {
                io.update(
                    &VarName::plain("units"),
                    String::from_utf8_lossy(payload).trim().to_string(),
                );
                Ok(())
            }
            other => Err(DeviceError::Device(format!(
                "unknown gauge message code {}",
                other as char
            ))),
        }
    }

    fn split_frames(&self, buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
        split_lines(buffer, b'\r')
    }

    fn on_variables_ready(&mut self, io: &mut BackendIo) -> Result<(), DeviceError> {
        io.set_status(DeviceStatus::Idle);
        Ok(())
    }
}

/// Encode a pressure reading the way the gauge sends it (simulators and
/// tests).
pub fn encode_pressure(pressure: f64) -> Vec<u8> {
    // Normalize to a 4-digit integer mantissa: p = mmmm * 10^(ee - 23).
    let mut exponent = 23i32;
    let mut mantissa = pressure;
    while mantissa != 0.0 && mantissa < 1000.0 {
        mantissa *= 10.0;
        exponent -= 1;
    }
    while mantissa >= 10000.0 {
        mantissa /= 10.0;
        exponent += 1;
    }
    let stem = format!("001M{:04.0}{:02}", mantissa, exponent);
    frame(stem.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_thresholds() {
        assert_eq!(classify(2.0), "No vacuum");
        assert_eq!(classify(1.0), "Medium vacuum");
        assert_eq!(classify(0.5), "Medium vacuum");
        assert_eq!(classify(0.1), "Vacuum OK");
        assert_eq!(classify(1e-3), "Vacuum OK");
    }

    #[test]
    fn query_frames_carry_the_documented_checksum() {
        assert_eq!(frame(b"001M"), b"001M^\r".to_vec());
        assert_eq!(frame(b"001T"), b"001Te\r".to_vec());
        assert_eq!(frame(b"001U"), b"001Uf\r".to_vec());
    }

    #[test]
    fn encoded_pressure_decodes_to_the_same_value() {
        for pressure in [950.0, 1.0, 0.15, 2.3e-2, 4.0e-4] {
            let encoded = encode_pressure(pressure);
            // Strip the terminator like the frame splitter does.
            let body = &encoded[..encoded.len() - 1];
            let payload = &body[4..body.len() - 1];
            let mantissa: f64 =
                String::from_utf8_lossy(&payload[..4]).parse().unwrap();
            let exponent: f64 =
                String::from_utf8_lossy(&payload[4..6]).parse().unwrap();
            let decoded = mantissa * 10f64.powf(exponent - 23.0);
            assert!(
                (decoded - pressure).abs() / pressure < 1e-3,
                "{pressure} decoded as {decoded}"
            );
        }
    }
}
