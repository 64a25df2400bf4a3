//! Error taxonomy shared across the workspace.
//!
//! Communication errors always escalate to a disconnect of the affected
//! device; device errors are reported per-variable and leave the
//! connection up; command and script errors never touch device state.

use thiserror::Error;

/// Errors raised by device back-ends and transports.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    /// Framing/checksum mismatch, transport reset or close.
    #[error("communication error: {0}")]
    Communication(String),

    /// The device reported an error status or an unsupported request.
    #[error("device error: {0}")]
    Device(String),

    /// A variable name the back-end does not know.
    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    /// The device is not connected.
    #[error("device not connected")]
    NotConnected,

    /// No registered device under this name.
    #[error("no such device: {0}")]
    NoSuchDevice(String),

    /// No message received from the device within the watchdog timeout.
    #[error("watchdog timeout: device silent for {0:.1} s")]
    WatchdogTimeout(f64),

    /// The back-end worker terminated unexpectedly.
    #[error("backend died: {0}")]
    BackendDied(String),

    /// A value outside the representable or permitted range.
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

/// Errors failing a single script command without touching device state.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    /// Bad argument count or type for a command invocation.
    #[error("invalid argument for {command}: {message}")]
    InvalidArgument { command: String, message: String },

    /// A precondition of the command is not met.
    #[error("{0}")]
    Precondition(String),

    /// A requested target lies outside its permitted range.
    #[error("{0}")]
    OutOfRange(String),

    /// The operation requires a higher privilege level.
    #[error(transparent)]
    Privilege(#[from] crate::privilege::PrivilegeError),

    /// A device the command needs is missing or unusable.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Errors preventing a script from being parsed or executed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScriptError {
    /// A line could not be parsed.
    #[error("cannot parse line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A command name no registered command matches.
    #[error("unknown command on line {line}: {name}")]
    UnknownCommand { line: usize, name: String },

    /// A script is already being executed.
    #[error("a script is already running")]
    AlreadyRunning,

    /// No script is being executed.
    #[error("no script is running")]
    NotRunning,
}

/// Errors from the sample, calibrant and accounting registries.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// No entry under this key.
    #[error("no such entry: {0}")]
    NotFound(String),

    /// An entry with this unique key already exists.
    #[error("duplicate entry: {0}")]
    Duplicate(String),

    /// The attribute is locked against modification.
    #[error("attribute {attribute} of {entry} is locked")]
    Locked { entry: String, attribute: String },

    /// Type mismatch when assigning an attribute.
    #[error("wrong value type for attribute {0}")]
    WrongType(String),

    /// Persistence failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The store is busy with a conflicting operation.
    #[error("{0}")]
    Busy(String),
}
