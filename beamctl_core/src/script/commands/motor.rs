//! Motor commands: `moveto`, `moverel` and `where`.

use std::time::{Duration, Instant};

use crate::motor::MotorSignalKind;
use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

/// Fixed slack added on top of the expected travel time.
const MOTION_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Drive one motor and wait for the motion to end.
#[derive(Debug)]
pub struct Move {
    relative: bool,
    motor: Option<String>,
    deadline: Option<Instant>,
}

impl Move {
    pub fn absolute() -> Self {
        Self {
            relative: false,
            motor: None,
            deadline: None,
        }
    }

    pub fn relative() -> Self {
        Self {
            relative: true,
            motor: None,
            deadline: None,
        }
    }
}

impl ScriptCommand for Move {
    fn name(&self) -> &'static str {
        if self.relative { "moverel" } else { "moveto" }
    }

    fn description(&self) -> &'static str {
        if self.relative {
            "Move a motor relative to its current position"
        } else {
            "Move a motor to an absolute position"
        }
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("motor", "name of the motor to move", ArgKind::Str),
            ArgSpec::required(
                "position",
                if self.relative { "relative displacement" } else { "target position" },
                ArgKind::Float,
            ),
        ]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let (Some(motorname), Some(position)) = (
            args.first().and_then(ScriptValue::as_str),
            args.get(1).and_then(ScriptValue::as_f64),
        ) else {
            return Outcome::Failed(format!("{}: motor name and position required", self.name()));
        };
        let Some(motor) = ctx.motors.get(motorname) else {
            return Outcome::Failed(format!("unknown motor: {motorname}"));
        };
        // Upper bound on the travel time from the distance and the
        // configured speed; generous, it only catches a dead axis.
        let travel = if self.relative {
            position.abs()
        } else {
            motor
                .position(ctx.devices)
                .map(|here| (position - here).abs())
                .unwrap_or(0.0)
        };
        let speed = motor.max_speed(ctx.devices).unwrap_or(1.0).max(1e-6);
        let expected = Duration::from_secs_f64((travel / speed).min(3600.0));
        let result = if self.relative {
            motor.move_rel(ctx.devices, ctx.accounting, position)
        } else {
            motor.move_to(ctx.devices, ctx.accounting, position)
        };
        if let Err(error) = result {
            return Outcome::Failed(error.to_string());
        }
        self.motor = Some(motorname.to_string());
        self.deadline = Some(Instant::now() + expected * 2 + MOTION_TIMEOUT_MARGIN);
        Outcome::Continue
    }

    fn tick(&mut self, ctx: &mut CommandCtx) -> Outcome {
        if self.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            if let Some(motor) = self.motor.as_deref().and_then(|m| ctx.motors.get(m)) {
                let _ = motor.stop(ctx.devices);
            }
            return Outcome::Failed(format!(
                "motion of motor {} timed out",
                self.motor.as_deref().unwrap_or("?")
            ));
        }
        Outcome::Continue
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Signal::Motor(motion) = signal else {
            return Outcome::Continue;
        };
        if Some(&motion.motor) != self.motor.as_ref() {
            return Outcome::Continue;
        }
        match &motion.kind {
            MotorSignalKind::Moving {
                position,
                start,
                target,
            } => {
                let span = target - start;
                let (current, total) = if span.abs() > f64::EPSILON {
                    ((1000.0 * (position - start) / span) as u64, 1000)
                } else {
                    (0, 0)
                };
                ctx.progress(
                    format!(
                        "Moving motor {}, currently at {position:.4}",
                        motion.motor
                    ),
                    current,
                    total,
                );
                Outcome::Continue
            }
            MotorSignalKind::Stopped { success, position } => {
                if *success {
                    Outcome::Finished(ScriptValue::Float(*position))
                } else {
                    Outcome::Failed(format!(
                        "motion of motor {} failed at {position:.4}",
                        motion.motor
                    ))
                }
            }
            _ => Outcome::Continue,
        }
    }

    fn stop(&mut self, ctx: &mut CommandCtx) -> Outcome {
        if let Some(motor) = self.motor.as_deref().and_then(|m| ctx.motors.get(m)) {
            let _ = motor.stop(ctx.devices);
        }
        Outcome::Failed("motor move stopped on user request".to_string())
    }
}

/// Read the current position of one motor, or of all of them.
#[derive(Debug, Default)]
pub struct Where;

impl ScriptCommand for Where {
    fn name(&self) -> &'static str {
        "where"
    }

    fn description(&self) -> &'static str {
        "Report current motor position(s)"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::optional(
            "motor",
            "motor name, or '*' for all",
            ArgKind::Str,
            ScriptValue::Str("*".to_string()),
        )]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let selector = args
            .first()
            .and_then(ScriptValue::as_str)
            .unwrap_or("*")
            .to_string();
        if selector == "*" {
            let mut rows = Vec::new();
            let namelen = ctx
                .motors
                .iter()
                .map(|m| m.name.len())
                .max()
                .unwrap_or(10)
                .max("Motor name".len());
            let mut table = format!("| {:^namelen$} |  Position  |\n", "Motor name");
            table.push_str(&format!("+-{:-^namelen$}-+------------+\n", ""));
            for motor in ctx.motors.iter() {
                match motor.position(ctx.devices) {
                    Ok(position) => {
                        table.push_str(&format!(
                            "| {:^namelen$} | {position:>10.3} |\n",
                            motor.name
                        ));
                        rows.push(ScriptValue::Tuple(vec![
                            ScriptValue::Str(motor.name.clone()),
                            ScriptValue::Float(position),
                        ]));
                    }
                    Err(_) => {
                        table.push_str(&format!(
                            "| {:^namelen$} | {:>10} |\n",
                            motor.name, "?"
                        ));
                    }
                }
            }
            ctx.message(table);
            Outcome::Finished(ScriptValue::Tuple(rows))
        } else {
            let Some(motor) = ctx.motors.get(&selector) else {
                return Outcome::Failed(format!("unknown motor: {selector}"));
            };
            match motor.position(ctx.devices) {
                Ok(position) => {
                    ctx.message(format!("{position:8.3}"));
                    Outcome::Finished(ScriptValue::Float(position))
                }
                Err(error) => Outcome::Failed(error.to_string()),
            }
        }
    }
}
