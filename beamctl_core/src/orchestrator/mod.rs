//! Long-running measurement sequencers built on top of the devices:
//! the motor scan and the transmission measurement.

pub mod scan;
pub mod transmission;
