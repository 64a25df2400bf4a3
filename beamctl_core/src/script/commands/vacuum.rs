//! Vacuum commands: `vacuum` and `wait_vacuum`.

use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;

fn pressure(ctx: &CommandCtx) -> Option<f64> {
    ctx.devices.vacuum().ok()?.get_f64(&"pressure".into())
}

/// Read the chamber pressure.
#[derive(Debug, Default)]
pub struct Vacuum;

impl ScriptCommand for Vacuum {
    fn name(&self) -> &'static str {
        "vacuum"
    }

    fn description(&self) -> &'static str {
        "Read the vacuum pressure in mbar"
    }

    fn start(&mut self, ctx: &mut CommandCtx, _args: &[ScriptValue]) -> Outcome {
        match pressure(ctx) {
            Some(pressure) => {
                ctx.message(format!("Vacuum pressure is {pressure:.4} mbar"));
                Outcome::Finished(ScriptValue::Float(pressure))
            }
            None => Outcome::Failed("vacuum pressure is not known".to_string()),
        }
    }
}

/// Wait until the pressure drops below a threshold.
#[derive(Debug, Default)]
pub struct WaitVacuum {
    limit: f64,
}

impl ScriptCommand for WaitVacuum {
    fn name(&self) -> &'static str {
        "wait_vacuum"
    }

    fn description(&self) -> &'static str {
        "Wait until the pressure falls below a threshold"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required(
            "pressure_limit",
            "upper pressure limit in mbar (exclusive)",
            ArgKind::Float,
        )]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let Some(limit) = args.first().and_then(ScriptValue::as_f64) else {
            return Outcome::Failed("wait_vacuum: pressure limit required".to_string());
        };
        if limit <= 0.0 {
            return Outcome::Failed(format!("wait_vacuum: invalid limit {limit}"));
        }
        if ctx.devices.vacuum().is_err() {
            return Outcome::Failed("no vacuum gauge registered".to_string());
        }
        self.limit = limit;
        ctx.message(format!(
            "Waiting for vacuum pressure to go below {limit:.4} mbar"
        ));
        Outcome::Continue
    }

    fn tick(&mut self, ctx: &mut CommandCtx) -> Outcome {
        let Some(pressure) = pressure(ctx) else {
            return Outcome::Continue;
        };
        if pressure < self.limit {
            ctx.message(format!(
                "Vacuum pressure is {pressure:.4} mbar, below the threshold {:.4} mbar",
                self.limit
            ));
            Outcome::Finished(ScriptValue::Float(pressure))
        } else {
            ctx.progress(
                format!(
                    "Waiting for pressure below {:.4} mbar, now at {pressure:.4} mbar",
                    self.limit
                ),
                0,
                0,
            );
            Outcome::Continue
        }
    }
}
