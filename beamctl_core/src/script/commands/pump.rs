//! Peristaltic pump commands: `pp_start`, `pp_stop`,
//! `pp_dispense_wait` and `pp_dispense_start`.
//!
//! The pump needs several settings written in sequence before the
//! rollers may turn; each command chains the necessary device commands
//! and advances on their acknowledgements.

use std::time::Instant;

use beamctl_device::message::DeviceEvent;
use beamctl_device::variable::VarValue;

use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

fn pump_name(ctx: &CommandCtx) -> Result<String, String> {
    ctx.devices
        .peristaltic_pump()
        .map(|f| f.name().to_string())
        .map_err(|_| "no peristaltic pump found".to_string())
}

fn pump_f64(ctx: &CommandCtx, var: &str) -> Option<f64> {
    ctx.devices.peristaltic_pump().ok()?.get_f64(&var.into())
}

fn pump_bool(ctx: &CommandCtx, var: &str) -> Option<bool> {
    ctx.devices.peristaltic_pump().ok()?.get_bool(&var.into())
}

fn parse_direction(value: Option<&ScriptValue>) -> Result<Option<bool>, String> {
    match value {
        None | Some(ScriptValue::None) => Ok(None),
        Some(ScriptValue::Str(s)) => match s.to_ascii_lowercase().as_str() {
            "clockwise" => Ok(Some(true)),
            "counterclockwise" => Ok(Some(false)),
            other => Err(format!(
                "invalid direction '{other}': must be clockwise or counterclockwise"
            )),
        },
        Some(other) => Err(format!("invalid direction ({})", other.type_name())),
    }
}

/// What happens once the chained setup completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterChain {
    FinishImmediately,
    WaitForDispense,
}

/// A sequence of device commands driven by their acknowledgements.
#[derive(Debug)]
struct Chain {
    pump: String,
    steps: Vec<(&'static str, Vec<VarValue>)>,
    index: usize,
    after: AfterChain,
    dispense_started: Option<Instant>,
}

impl Chain {
    fn issue_current(&self, ctx: &CommandCtx) -> Result<(), String> {
        let (command, args) = &self.steps[self.index];
        ctx.devices
            .peristaltic_pump()
            .map_err(|e| e.to_string())?
            .issue_command(command, args.clone())
            .map_err(|e| e.to_string())
    }
}

/// Shared implementation of the four pump commands.
#[derive(Debug)]
pub struct PumpCommand {
    name: &'static str,
    chain: Option<Chain>,
}

impl PumpCommand {
    pub fn start_pump() -> Self {
        Self {
            name: "pp_start",
            chain: None,
        }
    }

    pub fn stop_pump() -> Self {
        Self {
            name: "pp_stop",
            chain: None,
        }
    }

    pub fn dispense_wait() -> Self {
        Self {
            name: "pp_dispense_wait",
            chain: None,
        }
    }

    pub fn dispense_start() -> Self {
        Self {
            name: "pp_dispense_start",
            chain: None,
        }
    }

    fn dispensing(&self) -> bool {
        matches!(self.name, "pp_dispense_wait" | "pp_dispense_start")
    }
}

impl ScriptCommand for PumpCommand {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        match self.name {
            "pp_start" => "Run the peristaltic pump until stopped",
            "pp_stop" => "Stop the peristaltic pump",
            "pp_dispense_wait" => "Dispense for a given time and wait for completion",
            _ => "Start a timed dispense and return immediately",
        }
    }

    fn args(&self) -> Vec<ArgSpec> {
        let mut specs = Vec::new();
        if self.dispensing() {
            specs.push(ArgSpec::required(
                "dispensetime",
                "dispense time in seconds",
                ArgKind::Float,
            ));
        }
        if self.name != "pp_stop" {
            specs.push(ArgSpec::optional(
                "direction",
                "clockwise or counterclockwise",
                ArgKind::Any,
                ScriptValue::None,
            ));
            specs.push(ArgSpec::optional(
                "speed",
                "rotation speed in rpm",
                ArgKind::Any,
                ScriptValue::None,
            ));
        }
        specs
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let pump = match pump_name(ctx) {
            Ok(pump) => pump,
            Err(error) => return Outcome::Failed(error),
        };
        if self.name == "pp_stop" {
            let mut chain = Chain {
                pump,
                steps: vec![("stop", Vec::new())],
                index: 0,
                after: AfterChain::FinishImmediately,
                dispense_started: None,
            };
            if let Err(error) = chain.issue_current(ctx) {
                return Outcome::Failed(error);
            }
            self.chain = Some(chain);
            return Outcome::Continue;
        }
        let mut steps: Vec<(&'static str, Vec<VarValue>)> = Vec::new();
        let arg_base = usize::from(self.dispensing());
        if self.dispensing() {
            let Some(dispensetime) = args.first().and_then(ScriptValue::as_f64) else {
                return Outcome::Failed(format!("{}: dispense time required", self.name));
            };
            if dispensetime.is_finite() {
                steps.push(("set_dispense_time", vec![VarValue::Float(dispensetime)]));
            }
        }
        let direction = match parse_direction(args.get(arg_base)) {
            Ok(direction) => direction,
            Err(error) => return Outcome::Failed(format!("{}: {error}", self.name)),
        };
        if let Some(clockwise) = direction {
            steps.push(("set_direction", vec![VarValue::Bool(clockwise)]));
        }
        match args.get(arg_base + 1) {
            None | Some(ScriptValue::None) => {}
            Some(value) => match value.as_f64() {
                Some(rpm) => steps.push(("set_speed", vec![VarValue::Float(rpm)])),
                None => {
                    return Outcome::Failed(format!("{}: speed must be a number", self.name));
                }
            },
        }
        // A finite dispense runs in foot-switch mode; continuous
        // operation uses the internal control mode.
        let mode = if self.dispensing() { "foot_switch" } else { "internal" };
        steps.push(("set_control_mode", vec![VarValue::Str(mode.to_string())]));
        steps.push(("start", Vec::new()));
        let after = if self.name == "pp_dispense_wait" {
            AfterChain::WaitForDispense
        } else {
            AfterChain::FinishImmediately
        };
        let chain = Chain {
            pump,
            steps,
            index: 0,
            after,
            dispense_started: None,
        };
        if let Err(error) = chain.issue_current(ctx) {
            return Outcome::Failed(error);
        }
        ctx.progress("Initializing peristaltic pump", 0, 0);
        self.chain = Some(chain);
        Outcome::Continue
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Some(chain) = &mut self.chain else {
            return Outcome::Continue;
        };
        let Signal::Device { device, event } = signal else {
            return Outcome::Continue;
        };
        if *device != chain.pump {
            return Outcome::Continue;
        }
        let DeviceEvent::CommandResult {
            success,
            command,
            message,
        } = event
        else {
            return Outcome::Continue;
        };
        if *command != chain.steps[chain.index].0 {
            return Outcome::Continue;
        }
        if !success {
            return Outcome::Failed(format!(
                "peristaltic pump command {command} failed: {message}"
            ));
        }
        chain.index += 1;
        if chain.index < chain.steps.len() {
            if let Err(error) = chain.issue_current(ctx) {
                return Outcome::Failed(error);
            }
            return Outcome::Continue;
        }
        match chain.after {
            AfterChain::FinishImmediately => {
                ctx.message("Peristaltic pump command complete");
                Outcome::Finished(ScriptValue::Bool(true))
            }
            AfterChain::WaitForDispense => {
                chain.dispense_started = Some(Instant::now());
                Outcome::Continue
            }
        }
    }

    fn tick(&mut self, ctx: &mut CommandCtx) -> Outcome {
        let Some(chain) = &self.chain else {
            return Outcome::Continue;
        };
        let Some(started) = chain.dispense_started else {
            return Outcome::Continue;
        };
        let dispense_time = pump_f64(ctx, "dispense_time").unwrap_or(0.0);
        let running = pump_bool(ctx, "running").unwrap_or(true);
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > dispense_time && !running {
            ctx.message("Dispense complete");
            return Outcome::Finished(ScriptValue::Bool(true));
        }
        if dispense_time > 0.0 {
            ctx.progress(
                format!(
                    "Dispensing for {dispense_time:.1} s, {:.1} s remaining",
                    (dispense_time - elapsed).max(0.0)
                ),
                (1000.0 * (elapsed / dispense_time).min(1.0)) as u64,
                1000,
            );
        }
        Outcome::Continue
    }

    fn stop(&mut self, ctx: &mut CommandCtx) -> Outcome {
        if let Ok(pump) = ctx.devices.peristaltic_pump() {
            let _ = pump.issue_command("stop", Vec::new());
        }
        Outcome::Failed("pump command stopped on user request".to_string())
    }
}
