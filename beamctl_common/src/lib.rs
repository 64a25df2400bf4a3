//! Shared leaf types for the beamctl workspace.
//!
//! Everything here is device-agnostic: the hierarchical configuration
//! store, the error taxonomy, privilege levels and the user/project
//! registry, and the sample/calibrant dataclasses. The device runtime
//! and the instrument core build on these.

pub mod accounting;
pub mod calibrant;
pub mod config;
pub mod error;
pub mod privilege;
pub mod sample;

pub use config::{Config, ConfigError, ConfigKey, ConfigStep, ConfigValue};
pub use error::{CommandError, DeviceError, ScriptError, StoreError};
pub use privilege::{Privilege, PrivilegeError};
