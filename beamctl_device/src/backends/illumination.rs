//! Sample illumination source back-end (line-oriented TCP).
//!
//! One observable, the lamp brightness, plus a single command to set
//! it. Queries are `B?`, writes `B=<level>`, replies `B <level>` or
//! `OK`.

use std::time::Duration;

use beamctl_common::error::DeviceError;

use crate::backend::{BackendIo, DeviceProcedure};
use crate::transport::split_lines;
use crate::message::DeviceStatus;
use crate::variable::{VarSpec, VarValue};
use crate::varname::VarName;

/// Largest brightness level the lamp accepts.
pub const BRIGHTNESS_MAX: i64 = 255;

/// Schott-class LED illumination back-end.
pub struct IlluminationBackend;

impl IlluminationBackend {
    pub fn new() -> Self {
        Self
    }

    fn send_line(&self, io: &mut BackendIo, line: &str) -> Result<(), DeviceError> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\r');
        io.send_direct(bytes)
    }
}

impl Default for IlluminationBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProcedure for IlluminationBackend {
    fn device_type(&self) -> &'static str {
        "illumination"
    }

    fn variables(&self) -> Vec<VarSpec> {
        vec![
            VarSpec::new(VarName::plain("brightness"))
                .urgent()
                .timeout(Duration::from_secs(1)),
        ]
    }

    fn query(&mut self, io: &mut BackendIo, name: &VarName) -> Result<(), DeviceError> {
        match name.base() {
            "brightness" => self.send_line(io, "B?"),
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
            "brightness" => {
                let level = value
                    .as_i64()
                    .ok_or_else(|| DeviceError::Device("brightness must be an integer".into()))?;
                if !(0..=BRIGHTNESS_MAX).contains(&level) {
                    return Err(DeviceError::OutOfRange(format!(
                        "brightness {level} outside [0, {BRIGHTNESS_MAX}]"
                    )));
                }
                self.send_line(io, &format!("B={level:03}"))?;
                self.send_line(io, "B?")
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
            "set_brightness" => {
                let Some(level) = args.first().and_then(VarValue::as_i64) else {
                    io.command_failed(command, "brightness level required");
                    return Ok(());
                };
                if !(0..=BRIGHTNESS_MAX).contains(&level) {
                    io.command_failed(
                        command,
                        format!("brightness {level} outside [0, {BRIGHTNESS_MAX}]"),
                    );
                    return Ok(());
                }
                self.send_line(io, &format!("B={level:03}"))?;
                self.send_line(io, "B?")?;
                io.command_finished(command, format!("brightness {level}"));
                Ok(())
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
        if let Some(rest) = line.strip_prefix("B ") {
            let level: i64 = rest
                .trim()
                .parse()
                .map_err(|_| DeviceError::Device(format!("unparsable brightness: {line}")))?;
            io.update(&VarName::plain("brightness"), level);
            return Ok(());
        }
        Err(DeviceError::Device(format!(
            "unknown illumination reply: {line}"
        )))
    }

    fn split_frames(&self, buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
        split_lines(buffer, b'\r')
    }

    fn on_variables_ready(&mut self, io: &mut BackendIo) -> Result<(), DeviceError> {
        io.set_status(DeviceStatus::Idle);
        Ok(())
    }
}
