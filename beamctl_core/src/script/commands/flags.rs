//! Flag commands: `newflag`, `setflag` and `clearflag`.

use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;

fn flag_arg(args: &[ScriptValue]) -> Result<&str, String> {
    args.first()
        .and_then(ScriptValue::as_str)
        .ok_or_else(|| "flag name required".to_string())
}

/// Declare a new flag, initially cleared.
#[derive(Debug, Default)]
pub struct NewFlag;

impl ScriptCommand for NewFlag {
    fn name(&self) -> &'static str {
        "newflag"
    }

    fn description(&self) -> &'static str {
        "Create a new flag"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("flag", "name of the flag", ArgKind::Str)]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        match flag_arg(args) {
            Ok(name) => {
                ctx.message(format!("Creating a new flag with name \"{name}\""));
                ctx.flags.add(name, false);
                Outcome::Finished(ScriptValue::Bool(false))
            }
            Err(error) => Outcome::Failed(format!("newflag: {error}")),
        }
    }
}

/// Raise a flag.
#[derive(Debug, Default)]
pub struct SetFlag;

impl ScriptCommand for SetFlag {
    fn name(&self) -> &'static str {
        "setflag"
    }

    fn description(&self) -> &'static str {
        "Set a flag to true"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("flag", "name of the flag", ArgKind::Str)]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        match flag_arg(args) {
            Ok(name) => {
                ctx.message(format!("Setting flag \"{name}\""));
                ctx.flags.set(name, true);
                Outcome::Finished(ScriptValue::Bool(true))
            }
            Err(error) => Outcome::Failed(format!("setflag: {error}")),
        }
    }
}

/// Clear a flag.
#[derive(Debug, Default)]
pub struct ClearFlag;

impl ScriptCommand for ClearFlag {
    fn name(&self) -> &'static str {
        "clearflag"
    }

    fn description(&self) -> &'static str {
        "Clear a flag (set it to false)"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("flag", "name of the flag", ArgKind::Str)]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        match flag_arg(args) {
            Ok(name) => {
                ctx.message(format!("Clearing flag \"{name}\""));
                ctx.flags.set(name, false);
                Outcome::Finished(ScriptValue::Bool(false))
            }
            Err(error) => Outcome::Failed(format!("clearflag: {error}")),
        }
    }
}
