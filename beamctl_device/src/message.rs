//! Message types of the front-end ↔ back-end queues.

use std::time::Duration;

use beamctl_common::config::{ConfigKey, ConfigValue};
use beamctl_common::error::DeviceError;

use crate::variable::VarValue;
use crate::varname::VarName;

/// What a busy device is busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusyKind {
    Moving,
    Exposing,
    Trimming,
    Stopping,
    WarmingUp,
    Dispensing,
}

impl BusyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Moving => "Moving",
            Self::Exposing => "Exposing",
            Self::Trimming => "Trimming",
            Self::Stopping => "Stopping",
            Self::WarmingUp => "Warming up",
            Self::Dispensing => "Dispensing",
        }
    }
}

/// Coarse device state, exposed through the `__status__` variable so
/// observers see state transitions through the same channel as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceStatus {
    #[default]
    Disconnected,
    Initializing,
    Idle,
    Busy(BusyKind),
    Error,
}

impl DeviceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Initializing => "Initializing",
            Self::Idle => "Idle",
            Self::Busy(kind) => kind.as_str(),
            Self::Error => "Error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Disconnected" => Self::Disconnected,
            "Initializing" => Self::Initializing,
            "Idle" => Self::Idle,
            "Moving" => Self::Busy(BusyKind::Moving),
            "Exposing" => Self::Busy(BusyKind::Exposing),
            "Trimming" => Self::Busy(BusyKind::Trimming),
            "Stopping" => Self::Busy(BusyKind::Stopping),
            "Warming up" => Self::Busy(BusyKind::WarmingUp),
            "Dispensing" => Self::Busy(BusyKind::Dispensing),
            _ => Self::Error,
        }
    }

    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Target of a query request.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTarget {
    /// Every variable currently due for refresh.
    All,
    One(VarName),
}

/// Messages sent from the front-end (and the communication worker) to
/// the back-end.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Query {
        target: QueryTarget,
        /// Emit a change event even if the value turns out unchanged.
        signal_needed: bool,
    },
    Set {
        name: VarName,
        value: VarValue,
    },
    Execute {
        command: String,
        args: Vec<VarValue>,
    },
    /// A configuration snapshot taken on the event thread.
    Config(Vec<(ConfigKey, ConfigValue)>),
    Telemetry,
    Exit,
    /// Raw bytes read from the device by the communication worker.
    Incoming(Vec<u8>),
    /// The communication worker lost the connection.
    CommError(String),
}

/// Resource statistics of a back-end worker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Telemetry {
    pub uptime: Duration,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub queries: u64,
    pub outstanding_sent: usize,
    pub last_inbound_age: Option<Duration>,
}

/// Events pushed from the back-end to the front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    VariableChanged {
        name: VarName,
        value: VarValue,
    },
    VariableError {
        name: VarName,
        error: DeviceError,
    },
    CommandResult {
        success: bool,
        command: String,
        message: String,
    },
    /// A log record from the back-end worker.
    Log {
        message: String,
    },
    Telemetry(Telemetry),
    /// All urgent variables have valid values.
    StartupDone,
    WatchdogTimeout(DeviceError),
    BackendDied(DeviceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in [
            DeviceStatus::Disconnected,
            DeviceStatus::Initializing,
            DeviceStatus::Idle,
            DeviceStatus::Busy(BusyKind::Moving),
            DeviceStatus::Busy(BusyKind::Exposing),
            DeviceStatus::Busy(BusyKind::Trimming),
            DeviceStatus::Busy(BusyKind::Stopping),
            DeviceStatus::Busy(BusyKind::WarmingUp),
            DeviceStatus::Busy(BusyKind::Dispensing),
            DeviceStatus::Error,
        ] {
            assert_eq!(DeviceStatus::parse(status.as_str()), status);
        }
    }
}
