//! X-ray source back-end (Modbus-TCP).
//!
//! The generator is driven through coils and read through holding
//! registers; all I/O is synchronous request/response on the back-end
//! thread, so there is no communication worker and no pairing FIFO.
//! The tube power state (`off`, `standby`, `full`, `warmup`) is a
//! first-class variable; commands are accepted immediately and their
//! effect is observed through the polled variables.

use std::time::Duration;

use beamctl_common::error::DeviceError;

use crate::backend::{BackendIo, DeviceProcedure};
use crate::message::{BusyKind, DeviceStatus};
use crate::modbus::ModbusClient;
use crate::variable::{VarSpec, VarValue};
use crate::varname::VarName;

/// Coil layout of the generator controller.
pub mod coil {
    pub const XRAYS_ON: u16 = 0;
    pub const STANDBY: u16 = 1;
    pub const FULL_POWER: u16 = 2;
    pub const WARMUP: u16 = 3;
    pub const SHUTTER: u16 = 4;
    pub const INTERLOCK: u16 = 5;
    pub const REMOTE_MODE: u16 = 6;
}

/// Holding register layout.
pub mod register {
    /// Power state code: 0 off, 1 standby, 2 full power, 3 warming up.
    pub const POWER_STATE: u16 = 0;
    /// High tension in units of 0.01 kV.
    pub const HT: u16 = 1;
    /// Tube current in units of 0.01 mA.
    pub const CURRENT: u16 = 2;
}

/// Tube power states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    Standby,
    Full,
    Warmup,
}

impl PowerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Standby => "standby",
            Self::Full => "full",
            Self::Warmup => "warmup",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Off),
            1 => Some(Self::Standby),
            2 => Some(Self::Full),
            3 => Some(Self::Warmup),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "standby" => Some(Self::Standby),
            "full" => Some(Self::Full),
            "warmup" => Some(Self::Warmup),
            _ => None,
        }
    }
}

/// GeniX-class X-ray generator back-end.
pub struct GenixBackend {
    client: ModbusClient,
}

impl GenixBackend {
    pub fn new(client: ModbusClient) -> Self {
        Self { client }
    }

    fn current_power_state(&self, io: &BackendIo) -> Option<PowerState> {
        io.str_of(&VarName::plain("powerstate"))
            .and_then(PowerState::parse)
    }

    fn read_registers(&mut self, io: &mut BackendIo) -> Result<(), DeviceError> {
        let regs = self.client.read_holding_registers(register::POWER_STATE, 3)?;
        let state = PowerState::from_code(regs[0]).ok_or_else(|| {
            DeviceError::Device(format!("unknown power state code {}", regs[0]))
        })?;
        io.update(&VarName::plain("powerstate"), state.as_str());
        io.update(&VarName::plain("ht"), f64::from(regs[1]) / 100.0);
        io.update(&VarName::plain("current"), f64::from(regs[2]) / 100.0);
        io.update(
            &VarName::plain("power"),
            f64::from(regs[1]) / 100.0 * f64::from(regs[2]) / 100.0,
        );
        match state {
            PowerState::Warmup => io.set_status(DeviceStatus::Busy(BusyKind::WarmingUp)),
            _ => {
                if io.status() != DeviceStatus::Initializing {
                    io.set_status(DeviceStatus::Idle);
                }
            }
        }
        io.set_auxstatus(state.as_str());
        Ok(())
    }

    fn read_coils(&mut self, io: &mut BackendIo) -> Result<(), DeviceError> {
        let coils = self.client.read_coils(coil::XRAYS_ON, 7)?;
        io.update(&VarName::plain("xrays"), coils[coil::XRAYS_ON as usize]);
        io.update(&VarName::plain("shutter"), coils[coil::SHUTTER as usize]);
        io.update(&VarName::plain("interlock"), coils[coil::INTERLOCK as usize]);
        io.update(
            &VarName::plain("remote_mode"),
            coils[coil::REMOTE_MODE as usize],
        );
        Ok(())
    }
}

impl DeviceProcedure for GenixBackend {
    fn device_type(&self) -> &'static str {
        "genix"
    }

    fn variables(&self) -> Vec<VarSpec> {
        let powerstate = VarName::plain("powerstate");
        let xrays = VarName::plain("xrays");
        vec![
            VarSpec::new(powerstate.clone())
                .urgent()
                .timeout(Duration::from_millis(500)),
            VarSpec::new(VarName::plain("ht")).depends_on(powerstate.clone()),
            VarSpec::new(VarName::plain("current")).depends_on(powerstate.clone()),
            VarSpec::new(VarName::plain("power")).depends_on(powerstate),
            VarSpec::new(xrays.clone())
                .urgent()
                .timeout(Duration::from_millis(500)),
            VarSpec::new(VarName::plain("shutter")).depends_on(xrays.clone()),
            VarSpec::new(VarName::plain("interlock")).depends_on(xrays.clone()),
            VarSpec::new(VarName::plain("remote_mode")).depends_on(xrays),
        ]
    }

    fn query(&mut self, io: &mut BackendIo, name: &VarName) -> Result<(), DeviceError> {
        match name.base() {
            "powerstate" => self.read_registers(io),
            "xrays" => self.read_coils(io),
            "ht" | "current" | "power" => self.read_registers(io),
            "shutter" | "interlock" | "remote_mode" => self.read_coils(io),
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
            "xrays" => {
                let on = args
                    .first()
                    .and_then(VarValue::as_bool)
                    .ok_or_else(|| DeviceError::Device("xrays: boolean argument required".into()))?;
                self.client.write_coil(coil::XRAYS_ON, on)?;
                self.read_coils(io)?;
                io.command_finished(command, if on { "X-rays on" } else { "X-rays off" });
                Ok(())
            }
            "standby" => {
                if self.current_power_state(io) == Some(PowerState::Warmup) {
                    io.command_failed(command, "warm-up is running");
                    return Ok(());
                }
                self.client.write_coil(coil::STANDBY, true)?;
                self.read_registers(io)?;
                io.command_finished(command, "going to standby");
                Ok(())
            }
            "full_power" => {
                match self.current_power_state(io) {
                    Some(PowerState::Full) => {
                        io.command_failed(command, "already at full power");
                        return Ok(());
                    }
                    Some(PowerState::Warmup) => {
                        io.command_failed(command, "warm-up is running");
                        return Ok(());
                    }
                    _ => {}
                }
                self.client.write_coil(coil::FULL_POWER, true)?;
                self.read_registers(io)?;
                io.command_finished(command, "ramping to full power");
                Ok(())
            }
            "poweroff" => {
                self.client.write_coil(coil::FULL_POWER, false)?;
                self.client.write_coil(coil::STANDBY, false)?;
                self.read_registers(io)?;
                io.command_finished(command, "powering down");
                Ok(())
            }
            "start_warmup" => {
                match self.current_power_state(io) {
                    Some(PowerState::Off) | Some(PowerState::Standby) => {}
                    other => {
                        io.command_failed(
                            command,
                            format!(
                                "warm-up cannot start from state {}",
                                other.map_or("unknown", PowerState::as_str)
                            ),
                        );
                        return Ok(());
                    }
                }
                self.client.write_coil(coil::WARMUP, true)?;
                self.read_registers(io)?;
                io.command_finished(command, "warm-up started");
                Ok(())
            }
            "stop_warmup" => {
                if self.current_power_state(io) != Some(PowerState::Warmup) {
                    io.command_failed(command, "warm-up is not running");
                    return Ok(());
                }
                self.client.write_coil(coil::WARMUP, false)?;
                self.read_registers(io)?;
                io.command_finished(command, "warm-up stopped");
                Ok(())
            }
            "shutter" => {
                let open = args
                    .first()
                    .and_then(VarValue::as_bool)
                    .ok_or_else(|| DeviceError::Device("shutter: boolean argument required".into()))?;
                self.client.write_coil(coil::SHUTTER, open)?;
                self.read_coils(io)?;
                io.command_finished(
                    command,
                    if open { "shutter opening" } else { "shutter closing" },
                );
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
