//! Device driver runtime and concrete back-ends.
//!
//! Every device is driven by a front-end/back-end pair. The back-end
//! owns all device I/O state and runs on its own worker thread; TCP
//! devices additionally own a communication worker handling the raw
//! socket. Front-end and back-end talk through two bounded queues; the
//! communication worker feeds inbound bytes into the back-end queue.
//!
//! The front-end never blocks: reads come from a variable cache kept
//! up to date by `poll()`, writes and commands are queued messages.

pub mod backend;
pub mod backends;
pub mod conversion;
pub mod frontend;
pub mod hid;
pub mod message;
pub mod modbus;
pub mod tmcl;
pub mod transport;
pub mod variable;
pub mod varname;

pub use backend::{BackendIo, BackendOptions, DeviceProcedure, spawn_backend};
pub use frontend::DeviceFrontend;
pub use message::{BusyKind, DeviceEvent, DeviceStatus, QueryTarget, Request, Telemetry};
pub use variable::{VarSpec, VarValue, Variable};
pub use varname::VarName;
