//! The `trim` command: set the detector discriminator thresholds.

use beamctl_device::backends::pilatus::Gain;
use beamctl_device::message::{BusyKind, DeviceEvent, DeviceStatus};
use beamctl_device::variable::VarValue;

use crate::script::command::{ArgKind, ArgSpec, CommandCtx, Outcome, ScriptCommand};
use crate::script::expr::ScriptValue;
use crate::signal::Signal;

/// Trim the detector to a new threshold. Refused unless the detector
/// is idle; thresholds are range-checked per gain before anything is
/// sent.
#[derive(Debug, Default)]
pub struct Trim {
    detector: Option<String>,
    accepted: bool,
    threshold: i64,
}

impl ScriptCommand for Trim {
    fn name(&self) -> &'static str {
        "trim"
    }

    fn description(&self) -> &'static str {
        "Set the detector threshold"
    }

    fn args(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("threshold", "threshold in eV", ArgKind::Int),
            ArgSpec::required(
                "gain",
                "discriminator gain",
                ArgKind::Choice(&["low", "mid", "high"]),
            ),
        ]
    }

    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome {
        let (Some(threshold), Some(gain)) = (
            args.first().and_then(ScriptValue::as_i64),
            args.get(1).and_then(ScriptValue::as_str).and_then(Gain::parse),
        ) else {
            return Outcome::Failed("trim: threshold and gain required".to_string());
        };
        let (min, max) = gain.threshold_limits();
        if threshold < min || threshold > max {
            return Outcome::Failed(format!(
                "threshold {threshold} eV outside [{min}, {max}] eV for {} gain",
                gain.as_str()
            ));
        }
        let name = match ctx.devices.detector() {
            Ok(frontend) => {
                if frontend.status() != DeviceStatus::Idle {
                    return Outcome::Failed("detector is not idle".to_string());
                }
                frontend.name().to_string()
            }
            Err(error) => return Outcome::Failed(error.to_string()),
        };
        self.threshold = threshold;
        self.accepted = false;
        ctx.message(format!(
            "Trimming detector to {threshold} eV at {} gain",
            gain.as_str()
        ));
        ctx.progress("Trimming detector", 0, 0);
        let issue = ctx
            .devices
            .get(&name)
            .map(|f| {
                f.issue_command(
                    "trim",
                    vec![
                        VarValue::Int(threshold),
                        VarValue::Str(gain.as_str().to_string()),
                    ],
                )
            })
            .unwrap_or(Err(beamctl_common::error::DeviceError::NotConnected));
        if let Err(error) = issue {
            return Outcome::Failed(error.to_string());
        }
        self.detector = Some(name);
        Outcome::Continue
    }

    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let Signal::Device { device, event } = signal else {
            return Outcome::Continue;
        };
        if Some(device) != self.detector.as_ref() {
            return Outcome::Continue;
        }
        match event {
            DeviceEvent::CommandResult {
                success: false,
                command,
                message,
            } if command == "trim" => Outcome::Failed(format!("trim refused: {message}")),
            DeviceEvent::CommandResult {
                success: true,
                command,
                ..
            } if command == "trim" => {
                self.accepted = true;
                Outcome::Continue
            }
            DeviceEvent::VariableChanged { name, value }
                if name.base() == "__status__" && self.accepted =>
            {
                let status = value.as_str().map(DeviceStatus::parse);
                match status {
                    Some(DeviceStatus::Idle) => {
                        ctx.message(format!("Detector trimmed to {} eV", self.threshold));
                        Outcome::Finished(ScriptValue::Int(self.threshold))
                    }
                    Some(DeviceStatus::Busy(BusyKind::Trimming)) | None => Outcome::Continue,
                    Some(other) => Outcome::Failed(format!(
                        "unexpected detector state while trimming: {}",
                        other.as_str()
                    )),
                }
            }
            _ => Outcome::Continue,
        }
    }
}
