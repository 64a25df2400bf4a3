//! The `beamstop` command: drive the two beamstop axes in sequence to
//! their stored in/out positions.

use beamctl_common::ckey;

use crate::motor::{MotorRole, MotorSignalKind};
use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    X,
    Y,
}

/// Move the beamstop in (blocking the direct beam) or out.
#[derive(Debug, Default)]
pub struct Beamstop {
    want_in: bool,
    leg: Option<Leg>,
    moving_motor: Option<String>,
}

impl Beamstop {
    fn target(&self, ctx: &CommandCtx, leg: Leg) -> Option<f64> {
        let side = if self.want_in { "in" } else { "out" };
        let axis = match leg {
            Leg::X => "x",
            Leg::Y => "y",
        };
        ctx.config.get_f64(&ckey!["beamstop", side, axis])
    }

    fn start_leg(&mut self, ctx: &mut CommandCtx, leg: Leg) -> Outcome {
        let role = match leg {
            Leg::X => MotorRole::BeamstopX,
            Leg::Y => MotorRole::BeamstopY,
        };
        let Some(motor) = ctx.motors.by_role(role) else {
            return Outcome::Failed(format!("no motor bound to role {role:?}"));
        };
        let Some(target) = self.target(ctx, leg) else {
            return Outcome::Failed(format!(
                "no stored beamstop {} position for the {:?} axis",
                if self.want_in { "in" } else { "out" },
                leg
            ));
        };
        if let Err(error) = motor.move_to(ctx.devices, ctx.accounting, target) {
            return Outcome::Failed(error.to_string());
        }
        self.moving_motor = Some(motor.name.clone());
        self.leg = Some(leg);
        Outcome::Continue
    }
}

impl ScriptCommand for Beamstop {
    fn name(&self) -> &'static str {
        "beamstop"
    }

    fn description(&self) -> &'static str {
        "Move the beamstop in or out"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required(
            "state",
            "requested beamstop state",
            ArgKind::Choice(&["in", "out"]),
        )]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        self.want_in = args.first().and_then(ScriptValue::as_str) == Some("in");
        ctx.message(format!(
            "Moving beamstop {}",
            if self.want_in { "in" } else { "out" }
        ));
        self.start_leg(ctx, Leg::X)
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Signal::Motor(motion) = signal else {
            return Outcome::Continue;
        };
        if Some(&motion.motor) != self.moving_motor.as_ref() {
            return Outcome::Continue;
        }
        match &motion.kind {
            MotorSignalKind::Stopped { success: false, .. } => {
                Outcome::Failed(format!("beamstop motor {} failed", motion.motor))
            }
            MotorSignalKind::Stopped { success: true, .. } => match self.leg {
                Some(Leg::X) => self.start_leg(ctx, Leg::Y),
                Some(Leg::Y) => {
                    ctx.message(format!(
                        "Beamstop is now {}",
                        if self.want_in { "in" } else { "out" }
                    ));
                    Outcome::Finished(ScriptValue::Bool(self.want_in))
                }
                None => Outcome::Continue,
            },
            _ => Outcome::Continue,
        }
    }

    fn stop(&mut self, ctx: &mut CommandCtx) -> Outcome {
        for role in [MotorRole::BeamstopX, MotorRole::BeamstopY] {
            if let Some(motor) = ctx.motors.by_role(role) {
                let _ = motor.stop(ctx.devices);
            }
        }
        Outcome::Failed("beamstop move stopped on user request".to_string())
    }
}
