//! The scripting layer: command objects, the expression evaluator for
//! their argument strings, and the single-stepping interpreter.

pub mod command;
pub mod commands;
pub mod expr;
pub mod flags;
pub mod interpreter;
pub mod registry;

pub use command::{ArgKind, ArgSpec, CommandCtx, Outcome};
pub use expr::{Namespace, ScriptValue};
pub use flags::FlagStore;
pub use interpreter::{Interpreter, InterpreterEvent};
