//! Low-level device introspection commands: `getvar`, `listvars` and
//! `devcommand`.

use beamctl_device::message::DeviceEvent;
use beamctl_device::variable::VarValue;
use beamctl_device::varname::VarName;

use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::commands::script_value_of;
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

/// Read a cached device variable.
#[derive(Debug, Default)]
pub struct GetVar;

impl ScriptCommand for GetVar {
    fn name(&self) -> &'static str {
        "getvar"
    }

    fn description(&self) -> &'static str {
        "Read a device variable from the cache"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("device", "device name", ArgKind::Str),
            ArgSpec::required("variable", "variable name", ArgKind::Str),
        ]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let (Some(device), Some(variable)) = (
            args.first().and_then(ScriptValue::as_str),
            args.get(1).and_then(ScriptValue::as_str),
        ) else {
            return Outcome::Failed("getvar: device and variable required".to_string());
        };
        let Some(frontend) = ctx.devices.get(device) else {
            return Outcome::Failed(format!("no such device: {device}"));
        };
        let name: VarName = variable.into();
        match frontend.get(&name) {
            Some(value) => {
                let value = script_value_of(value);
                ctx.message(format!("{device}:{variable} = {value}"));
                Outcome::Finished(value)
            }
            None => Outcome::Failed(format!(
                "device {device} has no cached value for {variable}"
            )),
        }
    }
}

/// List the cached variables of a device.
#[derive(Debug, Default)]
pub struct ListVars;

impl ScriptCommand for ListVars {
    fn name(&self) -> &'static str {
        "listvars"
    }

    fn description(&self) -> &'static str {
        "List the variables of a device"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("device", "device name", ArgKind::Str)]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let Some(device) = args.first().and_then(ScriptValue::as_str) else {
            return Outcome::Failed("listvars: device name required".to_string());
        };
        let Some(frontend) = ctx.devices.get(device) else {
            return Outcome::Failed(format!("no such device: {device}"));
        };
        let keys = frontend.keys();
        let names: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let count = names.len() as i64;
        ctx.message(format!("Variables of {device}: {}", names.join(", ")));
        Outcome::Finished(ScriptValue::Int(count))
    }
}

/// Issue a raw device command and wait for its acknowledgement.
#[derive(Debug, Default)]
pub struct DevCommand {
    device: Option<String>,
    command: String,
}

impl ScriptCommand for DevCommand {
    fn name(&self) -> &'static str {
        "devcommand"
    }

    fn description(&self) -> &'static str {
        "Issue a low-level device command"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("device", "device name", ArgKind::Str),
            ArgSpec::required("command", "command name", ArgKind::Str),
            ArgSpec::optional(
                "args",
                "command arguments (value or tuple)",
                ArgKind::Any,
                ScriptValue::None,
            ),
        ]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let (Some(device), Some(command)) = (
            args.first().and_then(ScriptValue::as_str),
            args.get(1).and_then(ScriptValue::as_str),
        ) else {
            return Outcome::Failed("devcommand: device and command required".to_string());
        };
        let extra: Vec<ScriptValue> = match args.get(2) {
            None | Some(ScriptValue::None) => Vec::new(),
            Some(ScriptValue::Tuple(items)) => items.clone(),
            Some(single) => vec![single.clone()],
        };
        let mut device_args = Vec::with_capacity(extra.len());
        for value in &extra {
            device_args.push(match value {
                ScriptValue::Bool(b) => VarValue::Bool(*b),
                ScriptValue::Int(i) => VarValue::Int(*i),
                ScriptValue::Float(x) => VarValue::Float(*x),
                ScriptValue::Str(s) => VarValue::Str(s.clone()),
                ScriptValue::None => VarValue::None,
                ScriptValue::Tuple(_) => {
                    return Outcome::Failed(
                        "devcommand: nested tuples are not supported".to_string(),
                    );
                }
            });
        }
        let Some(frontend) = ctx.devices.get(device) else {
            return Outcome::Failed(format!("no such device: {device}"));
        };
        if let Err(error) = frontend.issue_command(command, device_args) {
            return Outcome::Failed(error.to_string());
        }
        self.device = Some(device.to_string());
        self.command = command.to_string();
        Outcome::Continue
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Signal::Device { device, event } = signal else {
            return Outcome::Continue;
        };
        if Some(device) != self.device.as_ref() {
            return Outcome::Continue;
        }
        match event {
            DeviceEvent::CommandResult {
                success,
                command,
                message,
            } if *command == self.command => {
                if *success {
                    ctx.message(message.clone());
                    Outcome::Finished(ScriptValue::Str(message.clone()))
                } else {
                    Outcome::Failed(message.clone())
                }
            }
            _ => Outcome::Continue,
        }
    }
}
