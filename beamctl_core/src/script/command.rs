//! The command abstraction of the scripting layer.
//!
//! A command declares its arguments, starts, receives periodic ticks
//! and event-thread signals, and terminates through exactly one
//! structured outcome: finish with a value, fail with a message, or
//! request a jump. Commands never block; anything long-running is
//! driven by signals and ticks.

use beamctl_common::accounting::Accounting;
use beamctl_common::config::Config;
use beamctl_common::error::CommandError;

use crate::calibrants::CalibrantStore;
use crate::exposer::Exposer;
use crate::manager::DeviceManager;
use crate::motor::MotorSet;
use crate::orchestrator::scan::ScanRequest;
use crate::samples::SampleStore;
use crate::script::expr::{Namespace, ScriptValue};
use crate::script::flags::FlagStore;
use crate::signal::Signal;

/// Terminal (or non-terminal) result of a command step.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Keep running; wait for ticks and signals.
    Continue,
    /// Successful completion with the command's return value.
    Finished(ScriptValue),
    /// Failure; terminates the script.
    Failed(String),
    /// Jump to a label (`gosub` pushes a return address). The empty
    /// label means "return from subroutine".
    Jump { label: String, gosub: bool },
}

impl Outcome {
    /// Lift a fallible start into an outcome.
    pub fn from_result(result: Result<Outcome, CommandError>) -> Outcome {
        match result {
            Ok(outcome) => outcome,
            Err(error) => Outcome::Failed(error.to_string()),
        }
    }
}

/// Coercion rule of one declared argument.
#[derive(Debug, Clone)]
pub enum ArgKind {
    Any,
    Str,
    Float,
    Int,
    Bool,
    /// One of a fixed set of keywords (case-insensitive).
    Choice(&'static [&'static str]),
}

/// One declared argument of a command.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ArgKind,
    /// Missing trailing arguments take their declared default.
    pub default: Option<ScriptValue>,
}

impl ArgSpec {
    pub fn required(name: &'static str, description: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            description,
            kind,
            default: None,
        }
    }

    pub fn optional(
        name: &'static str,
        description: &'static str,
        kind: ArgKind,
        default: ScriptValue,
    ) -> Self {
        Self {
            name,
            description,
            kind,
            default: Some(default),
        }
    }

    /// Check and coerce one value against this spec.
    pub fn coerce(&self, value: ScriptValue) -> Result<ScriptValue, String> {
        match (&self.kind, value) {
            (ArgKind::Any, v) => Ok(v),
            (ArgKind::Str, ScriptValue::Str(s)) => Ok(ScriptValue::Str(s)),
            (ArgKind::Float, ScriptValue::Float(x)) => Ok(ScriptValue::Float(x)),
            (ArgKind::Float, ScriptValue::Int(i)) => Ok(ScriptValue::Float(i as f64)),
            (ArgKind::Int, ScriptValue::Int(i)) => Ok(ScriptValue::Int(i)),
            (ArgKind::Bool, ScriptValue::Bool(b)) => Ok(ScriptValue::Bool(b)),
            (ArgKind::Choice(choices), ScriptValue::Str(s)) => {
                let lowered = s.to_ascii_lowercase();
                if choices.iter().any(|c| *c == lowered) {
                    Ok(ScriptValue::Str(lowered))
                } else {
                    Err(format!(
                        "argument '{}' must be one of {}",
                        self.name,
                        choices.join(", ")
                    ))
                }
            }
            // None stands for "use the device default" in optional slots.
            (_, ScriptValue::None) if self.default.is_some() => Ok(ScriptValue::None),
            (_, v) => Err(format!(
                "argument '{}' has the wrong type ({})",
                self.name,
                v.type_name()
            )),
        }
    }
}

/// Apply declared defaults and coercions to a parsed argument list.
pub fn bind_args(
    command: &str,
    specs: &[ArgSpec],
    mut values: Vec<ScriptValue>,
) -> Result<Vec<ScriptValue>, CommandError> {
    if values.len() > specs.len() {
        return Err(CommandError::InvalidArgument {
            command: command.to_string(),
            message: format!(
                "too many arguments: got {}, expected at most {}",
                values.len(),
                specs.len()
            ),
        });
    }
    for spec in specs.iter().skip(values.len()) {
        match &spec.default {
            Some(default) => values.push(default.clone()),
            None => {
                return Err(CommandError::InvalidArgument {
                    command: command.to_string(),
                    message: format!("missing required argument '{}'", spec.name),
                });
            }
        }
    }
    specs
        .iter()
        .zip(values)
        .map(|(spec, value)| {
            spec.coerce(value).map_err(|message| CommandError::InvalidArgument {
                command: command.to_string(),
                message,
            })
        })
        .collect()
}

/// User-visible notes a command emits while running.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandNote {
    Message(String),
    Progress {
        message: String,
        current: u64,
        total: u64,
    },
}

/// Everything a command may touch while it runs. All references point
/// into state owned by the event thread.
pub struct CommandCtx<'a> {
    pub devices: &'a mut DeviceManager,
    pub motors: &'a mut MotorSet,
    pub samples: &'a mut SampleStore,
    pub calibrants: &'a mut CalibrantStore,
    pub exposer: &'a mut Exposer,
    pub accounting: &'a mut Accounting,
    pub config: &'a mut Config,
    pub flags: &'a mut FlagStore,
    pub namespace: &'a mut Namespace,
    pub notes: &'a mut Vec<CommandNote>,
    pub scan_request: &'a mut Option<ScanRequest>,
}

impl CommandCtx<'_> {
    /// Emit a status-bar message.
    pub fn message(&mut self, message: impl Into<String>) {
        self.notes.push(CommandNote::Message(message.into()));
    }

    /// Emit a progress report; `(0, 0)` means indefinite.
    pub fn progress(&mut self, message: impl Into<String>, current: u64, total: u64) {
        self.notes.push(CommandNote::Progress {
            message: message.into(),
            current,
            total,
        });
    }
}

/// A script command. One instance exists per script line and is
/// re-executed on every pass over that line.
pub trait ScriptCommand: Send {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Declared argument list (names, coercions, defaults).
    fn args(&self) -> Vec<ArgSpec> {
        Vec::new()
    }

    /// Begin execution with the bound arguments.
    fn start(&mut self, ctx: &mut CommandCtx, args: &[ScriptValue]) -> Outcome;

    /// Periodic tick while running.
    fn tick(&mut self, ctx: &mut CommandCtx) -> Outcome {
        let _ = ctx;
        Outcome::Continue
    }

    /// A signal dispatched on the event thread while running.
    fn on_signal(&mut self, ctx: &mut CommandCtx, signal: &Signal) -> Outcome {
        let _ = (ctx, signal);
        Outcome::Continue
    }

    /// Cancel the command. The default fails it; commands owning
    /// sub-operations cancel those first.
    fn stop(&mut self, ctx: &mut CommandCtx) -> Outcome {
        let _ = ctx;
        Outcome::Failed("stopped on user request".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("exptime", "exposure time", ArgKind::Float),
            ArgSpec::optional(
                "prefix",
                "exposure prefix",
                ArgKind::Str,
                ScriptValue::Str("crd".to_string()),
            ),
        ]
    }

    #[test]
    fn missing_trailing_arguments_take_defaults() {
        let bound = bind_args("expose", &specs(), vec![ScriptValue::Int(10)]).unwrap();
        assert_eq!(
            bound,
            vec![
                ScriptValue::Float(10.0),
                ScriptValue::Str("crd".to_string())
            ]
        );
    }

    #[test]
    fn missing_required_arguments_are_an_error() {
        assert!(matches!(
            bind_args("expose", &specs(), Vec::new()),
            Err(CommandError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn excess_arguments_are_an_error() {
        let too_many = vec![
            ScriptValue::Int(1),
            ScriptValue::Str("crd".to_string()),
            ScriptValue::Int(3),
        ];
        assert!(bind_args("expose", &specs(), too_many).is_err());
    }

    #[test]
    fn choices_are_case_insensitive_and_checked() {
        let spec = ArgSpec::required("state", "", ArgKind::Choice(&["open", "close"]));
        assert_eq!(
            spec.coerce(ScriptValue::Str("OPEN".to_string())).unwrap(),
            ScriptValue::Str("open".to_string())
        );
        assert!(spec.coerce(ScriptValue::Str("ajar".to_string())).is_err());
    }
}
