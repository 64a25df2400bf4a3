//! The script interpreter.
//!
//! Scripts are parsed line by line into command objects. Execution is
//! single-stepping: a pointer walks the script, a call stack records
//! return addresses for `gosub`, and a flag map is shared between the
//! commands. Instant commands are driven back to back within one tick
//! (bounded, so a tight `goto` loop cannot starve the event thread);
//! long-running commands advance on signals and ticks.

use regex::Regex;

use beamctl_common::error::ScriptError;

use crate::instrument::InstrumentCtx;
use crate::script::command::{CommandCtx, CommandNote, Outcome, ScriptCommand, bind_args};
use crate::script::expr::{self, Namespace, ScriptValue};
use crate::script::flags::FlagStore;
use crate::script::registry::command_by_name;
use crate::signal::Signal;

/// How many instant commands may run back to back in one drive pass.
const MAX_STEPS_PER_DRIVE: usize = 128;

/// Events the interpreter reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpreterEvent {
    Started,
    /// The script terminated; on failure the message says why.
    Finished { success: bool, message: String },
    /// Execution advanced to this (zero-based) line.
    Advance(usize),
    Message(String),
    Progress {
        message: String,
        current: u64,
        total: u64,
    },
}

struct ScriptLine {
    command: Box<dyn ScriptCommand>,
    argstring: String,
}

/// The single-stepping script driver.
pub struct Interpreter {
    script: Vec<ScriptLine>,
    pointer: Option<usize>,
    current_started: bool,
    callstack: Vec<usize>,
    pub flags: FlagStore,
    namespace: Namespace,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            pointer: None,
            current_started: false,
            callstack: Vec::new(),
            flags: FlagStore::new(),
            namespace: Namespace::new(),
        }
    }

    /// Parse a script. Lines are comments (empty or `#`), labels
    /// (`@name`) or `command(arguments)`; the argument substring is
    /// stored verbatim and evaluated at each execution.
    pub fn parse(&mut self, text: &str) -> Result<(), ScriptError> {
        if self.is_running() {
            return Err(ScriptError::AlreadyRunning);
        }
        let line_re = Regex::new(r"^(?P<command>\w+)(\((?P<arguments>.*)\))?$")
            .expect("the line pattern is valid");
        let mut script = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let code = raw.split('#').next().unwrap_or("").trim();
            let (name, argstring) = if code.is_empty() {
                ("comment".to_string(), String::new())
            } else if let Some(label) = code.strip_prefix('@') {
                ("label".to_string(), label.trim().to_string())
            } else {
                let Some(caps) = line_re.captures(code) else {
                    return Err(ScriptError::Parse {
                        line: lineno + 1,
                        message: format!("cannot parse '{code}'"),
                    });
                };
                (
                    caps["command"].to_string(),
                    caps.name("arguments")
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                )
            };
            let Some(command) = command_by_name(&name) else {
                return Err(ScriptError::UnknownCommand {
                    line: lineno + 1,
                    name,
                });
            };
            script.push(ScriptLine { command, argstring });
        }
        self.script = script;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.pointer.is_some()
    }

    /// Zero-based line the interpreter is at, if running.
    pub fn current_line(&self) -> Option<usize> {
        self.pointer
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Reset state and begin execution at the first line. The script
    /// actually advances on the next `tick`.
    pub fn start(&mut self) -> Result<Vec<InterpreterEvent>, ScriptError> {
        if self.is_running() {
            return Err(ScriptError::AlreadyRunning);
        }
        self.namespace.clear();
        self.flags.reset();
        self.callstack.clear();
        self.pointer = Some(0);
        self.current_started = false;
        tracing::debug!(lines = self.script.len(), "script started");
        Ok(vec![InterpreterEvent::Started])
    }

    /// Periodic drive: starts the current line if needed, ticks a
    /// running command, and advances across instant commands.
    pub fn tick(&mut self, ix: &mut InstrumentCtx) -> Vec<InterpreterEvent> {
        self.drive(ix, None)
    }

    /// Dispatch one event-thread signal to the running command.
    pub fn on_signal(&mut self, ix: &mut InstrumentCtx, signal: &Signal) -> Vec<InterpreterEvent> {
        if !self.is_running() || !self.current_started {
            return Vec::new();
        }
        let mut notes = Vec::new();
        let outcome = {
            let Some(p) = self.pointer else {
                return Vec::new();
            };
            let line = &mut self.script[p];
            let mut ctx = make_ctx(ix, &mut self.flags, &mut self.namespace, &mut notes);
            line.command.on_signal(&mut ctx, signal)
        };
        let mut events = Vec::new();
        drain_notes(&mut notes, &mut events);
        self.continue_with(ix, outcome, events)
    }

    /// Cancel the script: forwarded to the running command.
    pub fn stop(&mut self, ix: &mut InstrumentCtx) -> Result<Vec<InterpreterEvent>, ScriptError> {
        if !self.is_running() {
            return Err(ScriptError::NotRunning);
        }
        if !self.current_started {
            self.pointer = None;
            return Ok(vec![InterpreterEvent::Finished {
                success: false,
                message: "stopped on user request".to_string(),
            }]);
        }
        let mut notes = Vec::new();
        let outcome = {
            let p = self.pointer.ok_or(ScriptError::NotRunning)?;
            let line = &mut self.script[p];
            let mut ctx = make_ctx(ix, &mut self.flags, &mut self.namespace, &mut notes);
            line.command.stop(&mut ctx)
        };
        let mut events = Vec::new();
        drain_notes(&mut notes, &mut events);
        Ok(self.continue_with(ix, outcome, events))
    }

    fn continue_with(
        &mut self,
        ix: &mut InstrumentCtx,
        outcome: Outcome,
        mut events: Vec<InterpreterEvent>,
    ) -> Vec<InterpreterEvent> {
        events.extend(self.drive(ix, Some(outcome)));
        events
    }

    /// The central stepping loop.
    fn drive(&mut self, ix: &mut InstrumentCtx, first: Option<Outcome>) -> Vec<InterpreterEvent> {
        let mut events = Vec::new();
        let mut notes: Vec<CommandNote> = Vec::new();
        let mut pending = first;
        for _ in 0..MAX_STEPS_PER_DRIVE {
            let Some(p) = self.pointer else { break };
            let outcome = if let Some(outcome) = pending.take() {
                outcome
            } else if !self.current_started {
                // Start the line the pointer rests on.
                if p >= self.script.len() || self.script[p].command.name() == "end" {
                    self.pointer = None;
                    events.push(InterpreterEvent::Finished {
                        success: true,
                        message: String::new(),
                    });
                    break;
                }
                events.push(InterpreterEvent::Advance(p));
                let args = match self.bind_line_args(p) {
                    Ok(args) => args,
                    Err(message) => {
                        self.pointer = None;
                        events.push(InterpreterEvent::Finished {
                            success: false,
                            message,
                        });
                        break;
                    }
                };
                self.current_started = true;
                let line = &mut self.script[p];
                let mut ctx =
                    make_ctx(ix, &mut self.flags, &mut self.namespace, &mut notes);
                line.command.start(&mut ctx, &args)
            } else {
                // A command is running: give it one tick.
                let line = &mut self.script[p];
                let mut ctx =
                    make_ctx(ix, &mut self.flags, &mut self.namespace, &mut notes);
                line.command.tick(&mut ctx)
            };
            drain_notes(&mut notes, &mut events);
            match outcome {
                Outcome::Continue => break,
                Outcome::Finished(value) => {
                    self.namespace.set_result(value);
                    self.pointer = Some(p + 1);
                    self.current_started = false;
                }
                Outcome::Failed(message) => {
                    self.pointer = None;
                    events.push(InterpreterEvent::Finished {
                        success: false,
                        message,
                    });
                    break;
                }
                Outcome::Jump { label, gosub } => {
                    if let Err(message) = self.jump(p, &label, gosub) {
                        self.pointer = None;
                        events.push(InterpreterEvent::Finished {
                            success: false,
                            message,
                        });
                        break;
                    }
                    self.current_started = false;
                }
            }
        }
        events
    }

    /// Resolve a jump target. The empty label pops the call stack;
    /// otherwise exactly one matching label must exist.
    fn jump(&mut self, from: usize, label: &str, gosub: bool) -> Result<(), String> {
        if label.is_empty() {
            let Some(ret) = self.callstack.pop() else {
                return Err("call stack is empty, nowhere to return".to_string());
            };
            self.pointer = Some(ret + 1);
            return Ok(());
        }
        let matches: Vec<usize> = self
            .script
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                line.command.name() == "label" && line.argstring.trim() == label
            })
            .map(|(idx, _)| idx)
            .collect();
        match matches.as_slice() {
            [target] => {
                if gosub {
                    self.callstack.push(from);
                }
                self.pointer = Some(*target);
                Ok(())
            }
            [] => Err(format!("label \"{label}\" does not exist")),
            _ => Err(format!("more than one label exists with name \"{label}\"")),
        }
    }

    /// Evaluate and bind the argument string of one line. Labels and
    /// comments carry their text verbatim rather than as expressions.
    fn bind_line_args(&self, p: usize) -> Result<Vec<ScriptValue>, String> {
        let line = &self.script[p];
        if matches!(line.command.name(), "label" | "comment") {
            return Ok(vec![ScriptValue::Str(line.argstring.clone())]);
        }
        let values = expr::parse_args(&line.argstring, &self.namespace)
            .map_err(|e| format!("line {}: {e}", p + 1))?;
        bind_args(line.command.name(), &line.command.args(), values)
            .map_err(|e| format!("line {}: {e}", p + 1))
    }
}

fn make_ctx<'a>(
    ix: &'a mut InstrumentCtx<'_>,
    flags: &'a mut FlagStore,
    namespace: &'a mut Namespace,
    notes: &'a mut Vec<CommandNote>,
) -> CommandCtx<'a> {
    CommandCtx {
        devices: &mut *ix.devices,
        motors: &mut *ix.motors,
        samples: &mut *ix.samples,
        calibrants: &mut *ix.calibrants,
        exposer: &mut *ix.exposer,
        accounting: &mut *ix.accounting,
        config: &mut *ix.config,
        flags,
        namespace,
        notes,
        scan_request: &mut *ix.scan_request,
    }
}

fn drain_notes(notes: &mut Vec<CommandNote>, events: &mut Vec<InterpreterEvent>) {
    for note in notes.drain(..) {
        events.push(match note {
            CommandNote::Message(message) => InterpreterEvent::Message(message),
            CommandNote::Progress {
                message,
                current,
                total,
            } => InterpreterEvent::Progress {
                message,
                current,
                total,
            },
        });
    }
}
