//! Circulator thermostat back-end (line-oriented TCP).
//!
//! Short two-letter commands, `\r`-terminated, with self-identifying
//! replies: `T+025.43` (bath temperature), `S+030.00` (setpoint),
//! `O1`/`O0` (circulator running), `OK` (write acknowledged).

use std::time::Duration;

use beamctl_common::error::DeviceError;

use crate::backend::{BackendIo, DeviceProcedure};
use crate::transport::split_lines;
use crate::message::DeviceStatus;
use crate::variable::{VarSpec, VarValue};
use crate::varname::VarName;

/// Lowest permitted setpoint [°C].
pub const SETPOINT_MIN: f64 = -50.0;
/// Highest permitted setpoint [°C].
pub const SETPOINT_MAX: f64 = 200.0;

/// Haake-class circulator back-end.
pub struct ThermostatBackend;

impl ThermostatBackend {
    pub fn new() -> Self {
        Self
    }

    fn send_line(&self, io: &mut BackendIo, line: &str) -> Result<(), DeviceError> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\r');
        io.send_direct(bytes)
    }

    fn write_setpoint(&self, io: &mut BackendIo, setpoint: f64) -> Result<(), DeviceError> {
        if !(SETPOINT_MIN..=SETPOINT_MAX).contains(&setpoint) {
            return Err(DeviceError::OutOfRange(format!(
                "setpoint {setpoint} °C outside [{SETPOINT_MIN}, {SETPOINT_MAX}] °C"
            )));
        }
        self.send_line(io, &format!("WS{setpoint:+07.2}"))?;
        self.send_line(io, "RS")
    }
}

impl Default for ThermostatBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProcedure for ThermostatBackend {
    fn device_type(&self) -> &'static str {
        "thermostat"
    }

    fn variables(&self) -> Vec<VarSpec> {
        vec![
            VarSpec::new(VarName::plain("temperature"))
                .urgent()
                .timeout(Duration::from_secs(1)),
            VarSpec::new(VarName::plain("setpoint"))
                .urgent()
                .timeout(Duration::from_secs(2)),
            VarSpec::new(VarName::plain("running"))
                .urgent()
                .timeout(Duration::from_secs(1)),
        ]
    }

    fn query(&mut self, io: &mut BackendIo, name: &VarName) -> Result<(), DeviceError> {
        match name.base() {
            "temperature" => self.send_line(io, "RT"),
            "setpoint" => self.send_line(io, "RS"),
            "running" => self.send_line(io, "RO"),
            other => Err(DeviceError::UnknownVariable(other.to_string())),
        }
    }

    fn set(
        &mut self,
        io: &mut BackendIo,
        name: &VarName,
        value: &VarValue,
    ) -> Result<(), DeviceError> {
        match name.base() {
            "setpoint" => {
                let setpoint = value
                    .as_f64()
                    .ok_or_else(|| DeviceError::Device("setpoint must be a number".into()))?;
                self.write_setpoint(io, setpoint)
            }
            other => Err(DeviceError::UnknownVariable(other.to_string())),
        }
    }

    fn execute(
        &mut self,
        io: &mut BackendIo,
        command: &str,
        args: &[VarValue],
    ) -> Result<(), DeviceError> {
        match command {
            "start" => {
                self.send_line(io, "GO")?;
                self.send_line(io, "RO")?;
                io.command_finished(command, "circulator starting");
                Ok(())
            }
            "stop" => {
                self.send_line(io, "ST")?;
                self.send_line(io, "RO")?;
                io.command_finished(command, "circulator stopping");
                Ok(())
            }
            "setpoint" => {
                let setpoint = args
                    .first()
                    .and_then(VarValue::as_f64)
                    .ok_or_else(|| DeviceError::Device("setpoint: numeric argument required".into()))?;
                match self.write_setpoint(io, setpoint) {
                    Ok(()) => {
                        io.command_finished(command, format!("setpoint {setpoint:.2} °C"));
                        Ok(())
                    }
                    Err(DeviceError::OutOfRange(message)) => {
                        io.command_failed(command, message);
                        Ok(())
                    }
                    Err(other) => Err(other),
                }
            }
            _ => {
                io.command_failed(command, "unknown command");
                Ok(())
            }
        }
    }

    fn interpret(
        &mut self,
        io: &mut BackendIo,
        frame: &[u8],
        _sent: Option<&[u8]>,
    ) -> Result<(), DeviceError> {
        let line = String::from_utf8_lossy(frame);
        let line = line.trim();
        if line.is_empty() || line == "OK" {
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("ERR") {
            return Err(DeviceError::Device(format!(
                "thermostat error:{rest}"
            )));
        }
        match line.as_bytes()[0] {
            b'T' => {
                let value: f64 = line[1..]
                    .trim()
                    .parse()
                    .map_err(|_| DeviceError::Device(format!("unparsable temperature: {line}")))?;
                io.update(&VarName::plain("temperature"), value);
                Ok(())
            }
            b'S' => {
                let value: f64 = line[1..]
                    .trim()
                    .parse()
                    .map_err(|_| DeviceError::Device(format!("unparsable setpoint: {line}")))?;
                io.update(&VarName::plain("setpoint"), value);
                Ok(())
            }
            b'O' => {
                io.update(&VarName::plain("running"), line[1..].trim() == "1");
                Ok(())
            }
            _ => Err(DeviceError::Device(format!(
                "unknown thermostat reply: {line}"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setpoint_write_format_is_sign_padded() {
        assert_eq!(format!("WS{:+07.2}", 25.0), "WS+025.00");
        assert_eq!(format!("WS{:+07.2}", -8.5), "WS-008.50");
    }
}
