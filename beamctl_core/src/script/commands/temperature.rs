//! Thermostat commands: `circulator`, `settemp`, `temperature` and
//! `wait_temp`.

use std::time::Instant;

use beamctl_device::message::DeviceEvent;
use beamctl_device::variable::VarValue;

use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

fn thermostat_name(ctx: &CommandCtx) -> Result<String, String> {
    ctx.devices
        .temperature()
        .map(|f| f.name().to_string())
        .map_err(|e| e.to_string())
}

fn thermostat_f64(ctx: &CommandCtx, var: &str) -> Option<f64> {
    ctx.devices.temperature().ok()?.get_f64(&var.into())
}

/// Start or stop the circulator.
#[derive(Debug, Default)]
pub struct Circulator {
    want_running: bool,
    thermostat: Option<String>,
}

impl ScriptCommand for Circulator {
    fn name(&self) -> &'static str {
        "circulator"
    }

    fn description(&self) -> &'static str {
        "Start or stop the thermostat circulator"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required(
            "state",
            "start or stop",
            ArgKind::Choice(&["start", "stop"]),
        )]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        self.want_running = args.first().and_then(ScriptValue::as_str) == Some("start");
        let name = match thermostat_name(ctx) {
            Ok(name) => name,
            Err(error) => return Outcome::Failed(error),
        };
        let running = ctx
            .devices
            .get(&name)
            .and_then(|f| f.get_bool(&"running".into()));
        if running == Some(self.want_running) {
            ctx.message(format!(
                "Thermostat already {}",
                if self.want_running { "running" } else { "stopped" }
            ));
            return Outcome::Finished(ScriptValue::Bool(self.want_running));
        }
        let command = if self.want_running { "start" } else { "stop" };
        ctx.message(format!("{command}ing thermostat circulator"));
        let issue = ctx
            .devices
            .get(&name)
            .map(|f| f.issue_command(command, Vec::new()));
        match issue {
            Some(Ok(())) => {
                self.thermostat = Some(name);
                Outcome::Continue
            }
            Some(Err(error)) => Outcome::Failed(error.to_string()),
            None => Outcome::Failed("thermostat is gone".to_string()),
        }
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Signal::Device { device, event } = signal else {
            return Outcome::Continue;
        };
        if Some(device) != self.thermostat.as_ref() {
            return Outcome::Continue;
        }
        match event {
            DeviceEvent::CommandResult {
                success: false,
                message,
                ..
            } => Outcome::Failed(format!("cannot start/stop thermostat: {message}")),
            DeviceEvent::VariableChanged { name, value } if name.base() == "running" => {
                if value.as_bool() == Some(self.want_running) {
                    ctx.message(format!(
                        "Thermostat {}",
                        if self.want_running { "started" } else { "stopped" }
                    ));
                    Outcome::Finished(ScriptValue::Bool(self.want_running))
                } else {
                    Outcome::Failed("thermostat reported the opposite state".to_string())
                }
            }
            _ => Outcome::Continue,
        }
    }
}

/// Change the setpoint.
#[derive(Debug, Default)]
pub struct SetTemp {
    target: f64,
    thermostat: Option<String>,
}

impl ScriptCommand for SetTemp {
    fn name(&self) -> &'static str {
        "settemp"
    }

    fn description(&self) -> &'static str {
        "Set the thermostat setpoint"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required("setpoint", "target temperature in °C", ArgKind::Float)]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let Some(target) = args.first().and_then(ScriptValue::as_f64) else {
            return Outcome::Failed("settemp: setpoint required".to_string());
        };
        self.target = target;
        let name = match thermostat_name(ctx) {
            Ok(name) => name,
            Err(error) => return Outcome::Failed(error),
        };
        ctx.message(format!("Setting thermostat setpoint to {target:.2} °C"));
        let issue = ctx
            .devices
            .get(&name)
            .map(|f| f.issue_command("setpoint", vec![VarValue::Float(target)]));
        match issue {
            Some(Ok(())) => {
                self.thermostat = Some(name);
                Outcome::Continue
            }
            Some(Err(error)) => Outcome::Failed(error.to_string()),
            None => Outcome::Failed("thermostat is gone".to_string()),
        }
    }

    fn on_signal(&mut self, _ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Signal::Device { device, event } = signal else {
            return Outcome::Continue;
        };
        if Some(device) != self.thermostat.as_ref() {
            return Outcome::Continue;
        }
        match event {
            DeviceEvent::CommandResult {
                success: false,
                message,
                ..
            } => Outcome::Failed(format!("cannot set setpoint: {message}")),
            DeviceEvent::VariableChanged { name, value } if name.base() == "setpoint" => {
                match value.as_f64() {
                    Some(v) if (v - self.target).abs() < 0.01 => {
                        Outcome::Finished(ScriptValue::Float(v))
                    }
                    _ => Outcome::Continue,
                }
            }
            _ => Outcome::Continue,
        }
    }
}

/// Read the bath temperature.
#[derive(Debug, Default)]
pub struct Temperature;

impl ScriptCommand for Temperature {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn description(&self) -> &'static str {
        "Read the bath temperature in °C"
    }

    fn start(&mut self, ctx: &mut CommandCtx, _args: &[ScriptValue]) -> Outcome {
        match thermostat_f64(ctx, "temperature") {
            Some(temperature) => {
                ctx.message(format!("Temperature is {temperature:.2} °C"));
                Outcome::Finished(ScriptValue::Float(temperature))
            }
            None => Outcome::Failed("bath temperature is not known".to_string()),
        }
    }
}

/// Wait until the bath stays within a tolerance band around the
/// setpoint for a given interval. The stability timer resets on a
/// setpoint change and on every excursion out of the band.
#[derive(Debug, Default)]
pub struct WaitTemp {
    tolerance: f64,
    delay: f64,
    stable_since: Option<Instant>,
    last_setpoint: Option<f64>,
}

impl ScriptCommand for WaitTemp {
    fn name(&self) -> &'static str {
        "wait_temp"
    }

    fn description(&self) -> &'static str {
        "Wait for the bath temperature to stabilize at the setpoint"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("tolerance", "allowed deviation in °C", ArgKind::Float),
            ArgSpec::required(
                "delay",
                "how long the bath must stay in band, in seconds",
                ArgKind::Float,
            ),
        ]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let (Some(tolerance), Some(delay)) = (
            args.first().and_then(ScriptValue::as_f64),
            args.get(1).and_then(ScriptValue::as_f64),
        ) else {
            return Outcome::Failed("wait_temp: tolerance and delay required".to_string());
        };
        if tolerance <= 0.0 || delay < 0.0 {
            return Outcome::Failed("wait_temp: invalid tolerance or delay".to_string());
        }
        if let Err(error) = thermostat_name(ctx) {
            return Outcome::Failed(error);
        }
        self.tolerance = tolerance;
        self.delay = delay;
        self.stable_since = None;
        self.last_setpoint = None;
        ctx.message(format!(
            "Waiting for the temperature to stay within ±{tolerance:.2} °C of the setpoint for {delay:.0} s"
        ));
        Outcome::Continue
    }

    fn tick(&mut self, ctx: &mut CommandCtx) -> Outcome {
        let (Some(temperature), Some(setpoint)) = (
            thermostat_f64(ctx, "temperature"),
            thermostat_f64(ctx, "setpoint"),
        ) else {
            return Outcome::Continue;
        };
        if self.last_setpoint.is_some_and(|sp| (sp - setpoint).abs() > 1e-9) {
            // Someone retargeted the bath; start over.
            self.stable_since = None;
        }
        self.last_setpoint = Some(setpoint);
        if (temperature - setpoint).abs() <= self.tolerance {
            let since = *self.stable_since.get_or_insert_with(Instant::now);
            let elapsed = since.elapsed().as_secs_f64();
            if elapsed >= self.delay {
                ctx.message(format!("Temperature stable at {temperature:.2} °C"));
                return Outcome::Finished(ScriptValue::Float(temperature));
            }
            ctx.progress(
                format!("Temperature in band at {temperature:.2} °C"),
                (1000.0 * elapsed / self.delay.max(f64::EPSILON)) as u64,
                1000,
            );
        } else {
            self.stable_since = None;
            ctx.progress(
                format!(
                    "Waiting for {setpoint:.2} °C, currently {temperature:.2} °C"
                ),
                0,
                0,
            );
        }
        Outcome::Continue
    }
}
