//! Flow-control and bookkeeping commands: `sleep`, `comment`, `label`,
//! `end`, `goto`, `gosub`, `return` and `set`.

use std::time::Instant;

use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;

/// Timed wait with per-tick progress.
#[derive(Debug, Default)]
pub struct Sleep {
    duration: f64,
    started: Option<Instant>,
}

impl ScriptCommand for Sleep {
    fn name(&self) -> &'static str {
        "sleep"
    }

    fn description(&self) -> &'static str {
        "Wait for the given number of seconds"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("interval", "sleep time in seconds", ArgKind::Float)]
    }

    fn start(&mut self, _ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let Some(interval) = args.first().and_then(ScriptValue::as_f64) else {
            return Outcome::Failed("sleep: interval must be a number".to_string());
        };
        if interval < 0.0 {
            return Outcome::Failed(format!("sleep: negative interval {interval}"));
        }
        self.duration = interval;
        self.started = Some(Instant::now());
        Outcome::Continue
    }

    fn tick(&mut self, ctx: &mut CommandCtx) -> Outcome {
        let Some(started) = self.started else {
            return Outcome::Continue;
        };
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed >= self.duration {
            Outcome::Finished(ScriptValue::Float(elapsed))
        } else {
            let total = 1000u64;
            let current = ((elapsed / self.duration) * total as f64) as u64;
            ctx.progress(
                format!("Sleeping for {:.3} seconds", self.duration),
                current,
                total,
            );
            Outcome::Continue
        }
    }
}

/// Blank and `#`-only lines; completes immediately and preserves `_`.
#[derive(Debug, Default)]
pub struct Comment;

impl ScriptCommand for Comment {
    fn name(&self) -> &'static str {
        "comment"
    }

    fn start(&mut self, ctx: &mut CommandCtx, _args: &[ScriptValue]) -> Outcome {
        Outcome::Finished(ctx.namespace.result())
    }
}

/// A `@name` line; a jump target, otherwise a no-op.
#[derive(Debug, Default)]
pub struct Label;

impl ScriptCommand for Label {
    fn name(&self) -> &'static str {
        "label"
    }

    fn start(&mut self, ctx: &mut CommandCtx, _args: &[ScriptValue]) -> Outcome {
        Outcome::Finished(ctx.namespace.result())
    }
}

/// Terminates the script; intercepted by the interpreter before
/// execution ever reaches `start`.
#[derive(Debug, Default)]
pub struct End;

impl ScriptCommand for End {
    fn name(&self) -> &'static str {
        "end"
    }

    fn description(&self) -> &'static str {
        "Stop the script"
    }

    fn start(&mut self, ctx: &mut CommandCtx, _args: &[ScriptValue]) -> Outcome {
        Outcome::Finished(ctx.namespace.result())
    }
}

/// Unconditional jump to a label.
#[derive(Debug, Default)]
pub struct Goto;

impl ScriptCommand for Goto {
    fn name(&self) -> &'static str {
        "goto"
    }

    fn description(&self) -> &'static str {
        "Jump to a label"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("label", "name of the target label", ArgKind::Str)]
    }

    fn start(&mut self, _ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        match args.first().and_then(ScriptValue::as_str) {
            Some(label) => Outcome::Jump {
                label: label.to_string(),
                gosub: false,
            },
            None => Outcome::Failed("goto: label name required".to_string()),
        }
    }
}

/// Jump to a label, remembering where to return to.
#[derive(Debug, Default)]
pub struct Gosub;

impl ScriptCommand for Gosub {
    fn name(&self) -> &'static str {
        "gosub"
    }

    fn description(&self) -> &'static str {
        "Jump to a label; a later 'return' comes back"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("label", "name of the target label", ArgKind::Str)]
    }

    fn start(&mut self, _ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        match args.first().and_then(ScriptValue::as_str) {
            Some(label) => Outcome::Jump {
                label: label.to_string(),
                gosub: true,
            },
            None => Outcome::Failed("gosub: label name required".to_string()),
        }
    }
}

/// Return from a subroutine entered with `gosub`.
#[derive(Debug, Default)]
pub struct Return;

impl ScriptCommand for Return {
    fn name(&self) -> &'static str {
        "return"
    }

    fn description(&self) -> &'static str {
        "Return to the line after the matching gosub"
    }

    fn start(&mut self, _ctx: &mut CommandCtx, _args: &[ScriptValue]) -> Outcome {
        Outcome::Jump {
            label: String::new(),
            gosub: false,
        }
    }
}

/// Assign a namespace variable: `set('name', value)`.
#[derive(Debug, Default)]
pub struct SetVar;

impl ScriptCommand for SetVar {
    fn name(&self) -> &'static str {
        "set"
    }

    fn description(&self) -> &'static str {
        "Assign a variable in the script namespace"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("name", "variable name", ArgKind::Str),
            ArgSpec::required("value", "new value", ArgKind::Any),
        ]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let Some(name) = args.first().and_then(ScriptValue::as_str) else {
            return Outcome::Failed("set: variable name required".to_string());
        };
        let value = args.get(1).cloned().unwrap_or(ScriptValue::None);
        ctx.namespace.set(name, value.clone());
        Outcome::Finished(value)
    }
}
