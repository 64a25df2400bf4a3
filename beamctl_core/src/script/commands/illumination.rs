//! The `set_illumination_brightness` command.

use beamctl_device::message::DeviceEvent;
use beamctl_device::variable::VarValue;

use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

/// Set the brightness of the sample illumination source.
#[derive(Debug, Default)]
pub struct SetIlluminationBrightness {
    device: Option<String>,
}

impl ScriptCommand for SetIlluminationBrightness {
    fn name(&self) -> &'static str {
        "set_illumination_brightness"
    }

    fn description(&self) -> &'static str {
        "Set the brightness of the sample illumination"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::required(
            "brightness",
            "brightness level of the source",
            ArgKind::Int,
        )]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let Some(level) = args.first().and_then(ScriptValue::as_i64) else {
            return Outcome::Failed("set_illumination_brightness: level required".to_string());
        };
        let name = match ctx.devices.illumination() {
            Ok(frontend) => frontend.name().to_string(),
            Err(_) => return Outcome::Failed("no illumination source found".to_string()),
        };
        let issue = ctx
            .devices
            .get(&name)
            .map(|f| f.issue_command("set_brightness", vec![VarValue::Int(level)]));
        match issue {
            Some(Ok(())) => {
                self.device = Some(name);
                Outcome::Continue
            }
            Some(Err(error)) => Outcome::Failed(error.to_string()),
            None => Outcome::Failed("illumination source is gone".to_string()),
        }
    }

    fn on_signal(&mut self, _ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
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
            } if command == "set_brightness" => {
                if *success {
                    Outcome::Finished(ScriptValue::Bool(true))
                } else {
                    Outcome::Failed(format!("cannot set illumination brightness: {message}"))
                }
            }
            _ => Outcome::Continue,
        }
    }
}
