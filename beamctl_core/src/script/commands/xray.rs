//! X-ray source commands: `shutter`, `xrays`, `xray_power` and
//! `xray_warmup`.

use beamctl_device::message::DeviceEvent;
use beamctl_device::variable::VarValue;

use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

fn source_name(ctx: &CommandCtx) -> Result<String, String> {
    ctx.devices
        .source()
        .map(|f| f.name().to_string())
        .map_err(|e| e.to_string())
}

fn cached_bool(ctx: &CommandCtx, device: &str, var: &str) -> Option<bool> {
    ctx.devices.get(device)?.get_bool(&var.into())
}

fn cached_str(ctx: &CommandCtx, device: &str, var: &str) -> Option<String> {
    ctx.devices
        .get(device)?
        .get_str(&var.into())
        .map(ToString::to_string)
}

fn issue(
    ctx: &CommandCtx,
    device: &str,
    command: &str,
    args: Vec<VarValue>,
) -> Result<(), String> {
    ctx.devices
        .get(device)
        .ok_or_else(|| format!("device {device} is not connected"))?
        .issue_command(command, args)
        .map_err(|e| e.to_string())
}

/// Is this a change of variable `var` on device `device`?
fn var_change<'a>(
    signal: &'a Signal,
    device: &Option<String>,
    var: &str,
) -> Option<&'a VarValue> {
    let Signal::Device { device: from, event } = signal else {
        return None;
    };
    if Some(from) != device.as_ref() {
        return None;
    }
    match event {
        DeviceEvent::VariableChanged { name, value } if name.base() == var => Some(value),
        _ => None,
    }
}

/// Did a device command fail?
fn command_failure<'a>(
    signal: &'a Signal,
    device: &Option<String>,
    command: &str,
) -> Option<&'a str> {
    let Signal::Device { device: from, event } = signal else {
        return None;
    };
    if Some(from) != device.as_ref() {
        return None;
    }
    match event {
        DeviceEvent::CommandResult {
            success: false,
            command: name,
            message,
        } if name == command => Some(message),
        _ => None,
    }
}

/// Open or close the beam shutter.
#[derive(Debug, Default)]
pub struct Shutter {
    want_open: bool,
    source: Option<String>,
}

impl ScriptCommand for Shutter {
    fn name(&self) -> &'static str {
        "shutter"
    }

    fn description(&self) -> &'static str {
        "Open or close the beam shutter"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required(
            "state",
            "requested shutter state",
            ArgKind::Choice(&["open", "close"]),
        )]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        self.want_open = args.first().and_then(ScriptValue::as_str) == Some("open");
        let name = match source_name(ctx) {
            Ok(name) => name,
            Err(error) => return Outcome::Failed(error),
        };
        if cached_bool(ctx, &name, "shutter") == Some(self.want_open) {
            ctx.message(format!(
                "The shutter is already {}",
                if self.want_open { "open" } else { "closed" }
            ));
            return Outcome::Finished(ScriptValue::Bool(self.want_open));
        }
        ctx.message(format!(
            "{} beam shutter",
            if self.want_open { "Opening" } else { "Closing" }
        ));
        ctx.progress("Moving beam shutter", 0, 0);
        if let Err(error) = issue(ctx, &name, "shutter", vec![VarValue::Bool(self.want_open)]) {
            return Outcome::Failed(error);
        }
        self.source = Some(name);
        Outcome::Continue
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        if let Some(message) = command_failure(signal, &self.source, "shutter") {
            return Outcome::Failed(format!("shutter error: {message}"));
        }
        if let Some(value) = var_change(signal, &self.source, "shutter") {
            let open = value.as_bool().unwrap_or(!self.want_open);
            return if open == self.want_open {
                ctx.message(format!(
                    "The shutter is now {}",
                    if open { "open" } else { "closed" }
                ));
                Outcome::Finished(ScriptValue::Bool(open))
            } else {
                Outcome::Failed(format!(
                    "cannot {} the shutter",
                    if self.want_open { "open" } else { "close" }
                ))
            };
        }
        Outcome::Continue
    }
}

/// Enable or disable X-ray generation.
#[derive(Debug, Default)]
pub struct Xrays {
    want_on: bool,
    source: Option<String>,
}

impl ScriptCommand for Xrays {
    fn name(&self) -> &'static str {
        "xrays"
    }

    fn description(&self) -> &'static str {
        "Turn X-ray generation on or off"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required(
            "state",
            "requested generator state",
            ArgKind::Choice(&["on", "off"]),
        )]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        self.want_on = args.first().and_then(ScriptValue::as_str) == Some("on");
        let name = match source_name(ctx) {
            Ok(name) => name,
            Err(error) => return Outcome::Failed(error),
        };
        if cached_bool(ctx, &name, "xrays") == Some(self.want_on) {
            return Outcome::Finished(ScriptValue::Bool(self.want_on));
        }
        ctx.message(format!(
            "Turning X-ray generator {}",
            if self.want_on { "on" } else { "off" }
        ));
        if let Err(error) = issue(ctx, &name, "xrays", vec![VarValue::Bool(self.want_on)]) {
            return Outcome::Failed(error);
        }
        self.source = Some(name);
        Outcome::Continue
    }

    fn on_signal(&mut self, _ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        if let Some(message) = command_failure(signal, &self.source, "xrays") {
            return Outcome::Failed(format!("cannot switch X-rays: {message}"));
        }
        if let Some(value) = var_change(signal, &self.source, "xrays") {
            return if value.as_bool() == Some(self.want_on) {
                Outcome::Finished(ScriptValue::Bool(self.want_on))
            } else {
                Outcome::Failed(format!(
                    "cannot turn X-ray generator {}",
                    if self.want_on { "on" } else { "off" }
                ))
            };
        }
        Outcome::Continue
    }
}

/// Put the tube to off / standby / full power.
#[derive(Debug, Default)]
pub struct XrayPower {
    target: String,
    source: Option<String>,
}

impl ScriptCommand for XrayPower {
    fn name(&self) -> &'static str {
        "xray_power"
    }

    fn description(&self) -> &'static str {
        "Set the power state of the X-ray tube"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required(
            "state",
            "requested tube power",
            ArgKind::Choice(&["off", "standby", "full"]),
        )]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let Some(target) = args.first().and_then(ScriptValue::as_str) else {
            return Outcome::Failed("xray_power: state required".to_string());
        };
        self.target = target.to_string();
        let name = match source_name(ctx) {
            Ok(name) => name,
            Err(error) => return Outcome::Failed(error),
        };
        if cached_str(ctx, &name, "powerstate").as_deref() == Some(self.target.as_str()) {
            return Outcome::Finished(ScriptValue::Str(self.target.clone()));
        }
        let command = match self.target.as_str() {
            "off" => "poweroff",
            "standby" => "standby",
            "full" => "full_power",
            other => return Outcome::Failed(format!("xray_power: invalid state {other}")),
        };
        ctx.message(format!("Putting X-ray source to {} mode", self.target));
        ctx.progress(format!("Putting X-ray source to {} mode", self.target), 0, 0);
        if let Err(error) = issue(ctx, &name, command, Vec::new()) {
            return Outcome::Failed(error);
        }
        self.source = Some(name);
        Outcome::Continue
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        for command in ["poweroff", "standby", "full_power"] {
            if let Some(message) = command_failure(signal, &self.source, command) {
                return Outcome::Failed(format!(
                    "error while putting the X-ray source to {} mode: {message}",
                    self.target
                ));
            }
        }
        if let Some(value) = var_change(signal, &self.source, "powerstate") {
            if value.as_str() == Some(self.target.as_str()) {
                ctx.message(format!("X-ray generator is now in {} mode", self.target));
                return Outcome::Finished(ScriptValue::Str(self.target.clone()));
            }
        }
        Outcome::Continue
    }
}

/// Run the tube warm-up procedure to completion.
#[derive(Debug, Default)]
pub struct WarmUp {
    source: Option<String>,
    warming: bool,
}

impl ScriptCommand for WarmUp {
    fn name(&self) -> &'static str {
        "xray_warmup"
    }

    fn description(&self) -> &'static str {
        "Run the X-ray tube warm-up procedure"
    }

    fn start(&mut self, ctx: &mut CommandCtx, _args: &[ScriptValue]) -> Outcome {
        let name = match source_name(ctx) {
            Ok(name) => name,
            Err(error) => return Outcome::Failed(error),
        };
        ctx.message("Starting X-ray source warm-up");
        ctx.progress("X-ray source warm-up in progress", 0, 0);
        if let Err(error) = issue(ctx, &name, "start_warmup", Vec::new()) {
            return Outcome::Failed(error);
        }
        self.source = Some(name);
        self.warming = false;
        Outcome::Continue
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        if let Some(message) = command_failure(signal, &self.source, "start_warmup") {
            return Outcome::Failed(format!("cannot start warm-up: {message}"));
        }
        if let Some(value) = var_change(signal, &self.source, "powerstate") {
            match value.as_str() {
                Some("warmup") => {
                    self.warming = true;
                }
                Some("off") | Some("standby") if self.warming => {
                    ctx.message("X-ray source warm-up finished");
                    return Outcome::Finished(ScriptValue::Bool(true));
                }
                _ => {}
            }
        }
        Outcome::Continue
    }

    fn stop(&mut self, ctx: &mut CommandCtx) -> Outcome {
        if let Some(name) = self.source.clone() {
            let _ = issue(ctx, &name, "stop_warmup", Vec::new());
            let _ = issue(ctx, &name, "poweroff", Vec::new());
        }
        Outcome::Failed("warm-up stopped on user request".to_string())
    }
}
