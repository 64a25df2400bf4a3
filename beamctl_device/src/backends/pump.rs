//! Peristaltic pump back-end (Modbus-TCP).
//!
//! Synchronous coil/register access on the back-end thread. Speeds,
//! dispense times and volumes are fixed-point registers; the control
//! mode selects what makes the rollers turn (internal start/stop, an
//! external signal, the foot switch input used for timed dispensing,
//! or one of the two logic-level modes).

use std::time::Duration;

use beamctl_common::error::DeviceError;

use crate::backend::{BackendIo, DeviceProcedure};
use crate::message::DeviceStatus;
use crate::modbus::ModbusClient;
use crate::variable::{VarSpec, VarValue};
use crate::varname::VarName;

pub mod coil {
    pub const RUNNING: u16 = 0;
    pub const CLOCKWISE: u16 = 1;
}

pub mod register {
    /// Rotation speed in 0.1 rpm.
    pub const SPEED: u16 = 0;
    /// Dispense time in 0.1 s.
    pub const DISPENSE_TIME: u16 = 1;
    /// Dispense volume in 0.01 ml.
    pub const DISPENSE_VOLUME: u16 = 2;
    /// Control mode code.
    pub const CONTROL_MODE: u16 = 3;
}

/// What drives the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Internal,
    External,
    FootSwitch,
    LogicLevel,
    LogicLevel2,
}

impl ControlMode {
    pub const fn code(self) -> u16 {
        match self {
            Self::Internal => 0,
            Self::External => 1,
            Self::FootSwitch => 2,
            Self::LogicLevel => 3,
            Self::LogicLevel2 => 4,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Internal),
            1 => Some(Self::External),
            2 => Some(Self::FootSwitch),
            3 => Some(Self::LogicLevel),
            4 => Some(Self::LogicLevel2),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
            Self::FootSwitch => "foot_switch",
            Self::LogicLevel => "logic_level",
            Self::LogicLevel2 => "logic_level_2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" => Some(Self::Internal),
            "external" => Some(Self::External),
            "foot_switch" => Some(Self::FootSwitch),
            "logic_level" => Some(Self::LogicLevel),
            "logic_level_2" => Some(Self::LogicLevel2),
            _ => None,
        }
    }
}

/// Largest programmable speed [rpm].
pub const SPEED_MAX: f64 = 100.0;

/// Lead-Fluid-class peristaltic pump back-end.
pub struct PumpBackend {
    client: ModbusClient,
}

impl PumpBackend {
    pub fn new(client: ModbusClient) -> Self {
        Self { client }
    }

    fn read_coils(&mut self, io: &mut BackendIo) -> Result<(), DeviceError> {
        let coils = self.client.read_coils(coil::RUNNING, 2)?;
        io.update(&VarName::plain("running"), coils[0]);
        io.update(&VarName::plain("clockwise"), coils[1]);
        io.set_auxstatus(if coils[0] { "running" } else { "stopped" });
        Ok(())
    }

    fn read_registers(&mut self, io: &mut BackendIo) -> Result<(), DeviceError> {
        let regs = self.client.read_holding_registers(register::SPEED, 4)?;
        io.update(&VarName::plain("rotating_speed"), f64::from(regs[0]) / 10.0);
        io.update(&VarName::plain("dispense_time"), f64::from(regs[1]) / 10.0);
        io.update(
            &VarName::plain("dispense_volume"),
            f64::from(regs[2]) / 100.0,
        );
        let mode = ControlMode::from_code(regs[3]).ok_or_else(|| {
            DeviceError::Device(format!("unknown control mode code {}", regs[3]))
        })?;
        io.update(&VarName::plain("control_mode"), mode.as_str());
        Ok(())
    }
}

impl DeviceProcedure for PumpBackend {
    fn device_type(&self) -> &'static str {
        "leadfluid_bt100s"
    }

    fn variables(&self) -> Vec<VarSpec> {
        let running = VarName::plain("running");
        let speed = VarName::plain("rotating_speed");
        vec![
            VarSpec::new(running.clone())
                .urgent()
                .timeout(Duration::from_millis(500)),
            VarSpec::new(VarName::plain("clockwise")).depends_on(running),
            VarSpec::new(speed.clone())
                .urgent()
                .timeout(Duration::from_secs(2)),
            VarSpec::new(VarName::plain("dispense_time")).depends_on(speed.clone()),
            VarSpec::new(VarName::plain("dispense_volume")).depends_on(speed.clone()),
            VarSpec::new(VarName::plain("control_mode")).depends_on(speed),
        ]
    }

    fn query(&mut self, io: &mut BackendIo, name: &VarName) -> Result<(), DeviceError> {
        match name.base() {
            "running" | "clockwise" => self.read_coils(io),
            "rotating_speed" | "dispense_time" | "dispense_volume" | "control_mode" => {
                self.read_registers(io)
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
        let arg_f64 = |idx: usize| {
            args.get(idx).and_then(VarValue::as_f64).ok_or_else(|| {
                DeviceError::Device(format!("{command}: argument #{idx} must be a number"))
            })
        };
        match command {
            "start" => {
                self.client.write_coil(coil::RUNNING, true)?;
                self.read_coils(io)?;
                io.command_finished(command, "pump started");
                Ok(())
            }
            "stop" => {
                self.client.write_coil(coil::RUNNING, false)?;
                self.read_coils(io)?;
                io.command_finished(command, "pump stopped");
                Ok(())
            }
            "set_direction" => {
                let clockwise = args
                    .first()
                    .and_then(VarValue::as_bool)
                    .ok_or_else(|| DeviceError::Device("set_direction: boolean required".into()))?;
                self.client.write_coil(coil::CLOCKWISE, clockwise)?;
                self.read_coils(io)?;
                io.command_finished(
                    command,
                    if clockwise { "clockwise" } else { "counterclockwise" },
                );
                Ok(())
            }
            "set_speed" => {
                let rpm = arg_f64(0)?;
                if !(0.1..=SPEED_MAX).contains(&rpm) {
                    io.command_failed(
                        command,
                        format!("speed {rpm} rpm outside [0.1, {SPEED_MAX}] rpm"),
                    );
                    return Ok(());
                }
                self.client
                    .write_register(register::SPEED, (rpm * 10.0).round() as u16)?;
                self.read_registers(io)?;
                io.command_finished(command, format!("speed {rpm:.1} rpm"));
                Ok(())
            }
            "set_dispense_time" => {
                let seconds = arg_f64(0)?;
                if !(0.0..=6553.5).contains(&seconds) {
                    io.command_failed(command, format!("dispense time {seconds} s out of range"));
                    return Ok(());
                }
                self.client
                    .write_register(register::DISPENSE_TIME, (seconds * 10.0).round() as u16)?;
                self.read_registers(io)?;
                io.command_finished(command, format!("dispense time {seconds:.1} s"));
                Ok(())
            }
            "set_dispense_volume" => {
                let ml = arg_f64(0)?;
                if !(0.0..=655.35).contains(&ml) {
                    io.command_failed(command, format!("dispense volume {ml} ml out of range"));
                    return Ok(());
                }
                self.client
                    .write_register(register::DISPENSE_VOLUME, (ml * 100.0).round() as u16)?;
                self.read_registers(io)?;
                io.command_finished(command, format!("dispense volume {ml:.2} ml"));
                Ok(())
            }
            "set_control_mode" => {
                let Some(mode) = args
                    .first()
                    .and_then(VarValue::as_str)
                    .and_then(ControlMode::parse)
                else {
                    io.command_failed(
                        command,
                        "control mode must be one of internal, external, foot_switch, logic_level, logic_level_2",
                    );
                    return Ok(());
                };
                self.client
                    .write_register(register::CONTROL_MODE, mode.code())?;
                self.read_registers(io)?;
                io.command_finished(command, mode.as_str());
                Ok(())
            }
            _ => {
                io.command_failed(command, "unknown command");
                Ok(())
            }
        }
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
    fn control_mode_codes_roundtrip() {
        for mode in [
            ControlMode::Internal,
            ControlMode::External,
            ControlMode::FootSwitch,
            ControlMode::LogicLevel,
            ControlMode::LogicLevel2,
        ] {
            assert_eq!(ControlMode::from_code(mode.code()), Some(mode));
            assert_eq!(ControlMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(ControlMode::from_code(9), None);
    }
}
