//! Named motor façade.
//!
//! A motor binds a user-facing name to a `(controller, axis)` pair and
//! carries the privilege required to move it. The façade never does
//! I/O itself: reads come from the controller front-end's cache, moves
//! are queued commands, and motion progress is derived from the
//! controller's variable-change events.

use beamctl_common::accounting::Accounting;
use beamctl_common::error::CommandError;
use beamctl_common::privilege::Privilege;
use beamctl_device::frontend::DeviceFrontend;
use beamctl_device::message::DeviceEvent;
use beamctl_device::variable::VarValue;
use beamctl_device::varname::VarName;
use serde::Deserialize;

use crate::manager::DeviceManager;

/// Distinguished roles some motors play in the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorRole {
    SampleX,
    SampleY,
    BeamstopX,
    BeamstopY,
    PinholeX,
    PinholeY,
}

/// One named axis of a stepper controller.
#[derive(Debug, Clone)]
pub struct Motor {
    pub name: String,
    pub controller: String,
    pub axis: u8,
    pub required_privilege: Privilege,
    pub role: Option<MotorRole>,
}

impl Motor {
    pub fn new(
        name: impl Into<String>,
        controller: impl Into<String>,
        axis: u8,
    ) -> Self {
        Self {
            name: name.into(),
            controller: controller.into(),
            axis,
            required_privilege: Privilege::Layman,
            role: None,
        }
    }

    fn frontend<'a>(&self, devices: &'a DeviceManager) -> Result<&'a DeviceFrontend, CommandError> {
        devices
            .get(&self.controller)
            .ok_or_else(|| CommandError::Precondition(format!(
                "motor {}: controller {} is not connected",
                self.name, self.controller
            )))
    }

    fn axis_var(&self, base: &str) -> VarName {
        VarName::per_axis(base, self.axis)
    }

    /// Last known physical position.
    pub fn position(&self, devices: &DeviceManager) -> Result<f64, CommandError> {
        self.frontend(devices)?
            .get_f64(&self.axis_var("actualposition"))
            .ok_or_else(|| {
                CommandError::Precondition(format!(
                    "position of motor {} is not yet known",
                    self.name
                ))
            })
    }

    pub fn is_moving(&self, devices: &DeviceManager) -> bool {
        self.frontend(devices)
            .ok()
            .and_then(|f| f.get_bool(&self.axis_var("moving")))
            .unwrap_or(false)
    }

    /// Configured maximum positioning speed, if known.
    pub fn max_speed(&self, devices: &DeviceManager) -> Option<f64> {
        self.frontend(devices)
            .ok()?
            .get_f64(&self.axis_var("maxspeed"))
    }

    /// Soft limits as cached from the controller.
    pub fn soft_limits(&self, devices: &DeviceManager) -> Option<(f64, f64)> {
        let frontend = self.frontend(devices).ok()?;
        Some((
            frontend.get_f64(&self.axis_var("softleft"))?,
            frontend.get_f64(&self.axis_var("softright"))?,
        ))
    }

    fn check_target(&self, devices: &DeviceManager, target: f64) -> Result<(), CommandError> {
        if let Some((left, right)) = self.soft_limits(devices) {
            if target < left || target > right {
                return Err(CommandError::OutOfRange(format!(
                    "target {target} of motor {} outside soft limits ({left}, {right})",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Start an absolute move. The controller enforces soft limits
    /// again; checking here fails fast without queueing anything.
    pub fn move_to(
        &self,
        devices: &DeviceManager,
        accounting: &Accounting,
        target: f64,
    ) -> Result<(), CommandError> {
        accounting.require(self.required_privilege)?;
        self.check_target(devices, target)?;
        self.frontend(devices)?
            .issue_command(
                "moveto",
                vec![VarValue::Int(i64::from(self.axis)), VarValue::Float(target)],
            )
            .map_err(CommandError::from)
    }

    /// Start a relative move.
    pub fn move_rel(
        &self,
        devices: &DeviceManager,
        accounting: &Accounting,
        delta: f64,
    ) -> Result<(), CommandError> {
        accounting.require(self.required_privilege)?;
        if delta != 0.0 {
            let target = self.position(devices)? + delta;
            self.check_target(devices, target)?;
        }
        self.frontend(devices)?
            .issue_command(
                "moverel",
                vec![VarValue::Int(i64::from(self.axis)), VarValue::Float(delta)],
            )
            .map_err(CommandError::from)
    }

    /// Stop the axis. Idempotent: stopping a standing motor is fine.
    pub fn stop(&self, devices: &DeviceManager) -> Result<(), CommandError> {
        self.frontend(devices)?
            .issue_command("stop", vec![VarValue::Int(i64::from(self.axis))])
            .map_err(CommandError::from)
    }

    /// Rewrite the soft limits, persisted by the controller back-end.
    pub fn set_limits(
        &self,
        devices: &DeviceManager,
        accounting: &Accounting,
        left: f64,
        right: f64,
    ) -> Result<(), CommandError> {
        accounting.require(Privilege::ConfigureMotors)?;
        if left > right {
            return Err(CommandError::OutOfRange(format!(
                "left limit {left} exceeds right limit {right}"
            )));
        }
        self.frontend(devices)?
            .issue_command(
                "setlimits",
                vec![
                    VarValue::Int(i64::from(self.axis)),
                    VarValue::Float(left),
                    VarValue::Float(right),
                ],
            )
            .map_err(CommandError::from)
    }

    /// Recalibrate the current position.
    pub fn set_position(
        &self,
        devices: &DeviceManager,
        accounting: &Accounting,
        position: f64,
    ) -> Result<(), CommandError> {
        accounting.require(Privilege::CalibrateMotors)?;
        self.frontend(devices)?
            .issue_command(
                "setposition",
                vec![
                    VarValue::Int(i64::from(self.axis)),
                    VarValue::Float(position),
                ],
            )
            .map_err(CommandError::from)
    }
}

/// Motion signals derived from controller variable changes.
#[derive(Debug, Clone, PartialEq)]
pub struct MotorSignal {
    pub motor: String,
    pub kind: MotorSignalKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MotorSignalKind {
    /// The axis started moving from `start`.
    Started { start: f64 },
    /// Position report while in flight.
    Moving {
        position: f64,
        start: f64,
        target: f64,
    },
    /// The motion ended; `success` is false for end-switch or user
    /// stops.
    Stopped { success: bool, position: f64 },
    /// A position update outside a motion (e.g. after calibration).
    PositionChanged { position: f64 },
}

/// The registry of named motors.
#[derive(Debug, Default)]
pub struct MotorSet {
    motors: Vec<Motor>,
}

impl MotorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, motor: Motor) -> Result<(), beamctl_common::error::StoreError> {
        if self.get(&motor.name).is_some() {
            return Err(beamctl_common::error::StoreError::Duplicate(motor.name));
        }
        self.motors.push(motor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Motor> {
        self.motors.iter().find(|m| m.name == name)
    }

    pub fn by_role(&self, role: MotorRole) -> Option<&Motor> {
        self.motors.iter().find(|m| m.role == Some(role))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Motor> {
        self.motors.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.motors.iter().map(|m| m.name.as_str()).collect()
    }

    fn of_axis(&self, controller: &str, axis: u8) -> Option<&Motor> {
        self.motors
            .iter()
            .find(|m| m.controller == controller && m.axis == axis)
    }

    /// Derive a motion signal from a controller event, reading the
    /// auxiliary values from the already-updated front-end cache.
    pub fn translate(
        &self,
        controller: &str,
        frontend: &DeviceFrontend,
        event: &DeviceEvent,
    ) -> Option<MotorSignal> {
        let DeviceEvent::VariableChanged { name, value } = event else {
            return None;
        };
        let axis = name.axis()?;
        let motor = self.of_axis(controller, axis)?;
        let f64_of = |base: &str| frontend.get_f64(&VarName::per_axis(base, axis));
        match (name.base(), value) {
            ("moving", VarValue::Bool(true)) => Some(MotorSignal {
                motor: motor.name.clone(),
                kind: MotorSignalKind::Started {
                    start: f64_of("movestartposition").unwrap_or(0.0),
                },
            }),
            ("moving", VarValue::Bool(false)) => Some(MotorSignal {
                motor: motor.name.clone(),
                kind: MotorSignalKind::Stopped {
                    success: frontend
                        .get_bool(&VarName::per_axis("lastmovewassuccessful", axis))
                        .unwrap_or(false),
                    position: f64_of("actualposition").unwrap_or(0.0),
                },
            }),
            ("actualposition", VarValue::Float(position)) => {
                if frontend
                    .get_bool(&VarName::per_axis("moving", axis))
                    .unwrap_or(false)
                {
                    Some(MotorSignal {
                        motor: motor.name.clone(),
                        kind: MotorSignalKind::Moving {
                            position: *position,
                            start: f64_of("movestartposition").unwrap_or(*position),
                            target: f64_of("targetposition").unwrap_or(*position),
                        },
                    })
                } else {
                    Some(MotorSignal {
                        motor: motor.name.clone(),
                        kind: MotorSignalKind::PositionChanged {
                            position: *position,
                        },
                    })
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_motor_names_are_rejected() {
        let mut motors = MotorSet::new();
        motors.add(Motor::new("SampleX", "tmcm351", 0)).unwrap();
        assert!(motors.add(Motor::new("SampleX", "tmcm6110", 1)).is_err());
    }

    #[test]
    fn role_lookup_finds_the_bound_motor() {
        let mut motors = MotorSet::new();
        let mut motor = Motor::new("Sample_X", "tmcm351", 1);
        motor.role = Some(MotorRole::SampleX);
        motors.add(motor).unwrap();
        assert_eq!(
            motors.by_role(MotorRole::SampleX).map(|m| m.name.as_str()),
            Some("Sample_X")
        );
        assert!(motors.by_role(MotorRole::BeamstopX).is_none());
    }
}
