//! High-level signals dispatched synchronously on the event thread.

use beamctl_device::message::DeviceEvent;

use crate::exposer::ExposureSignal;
use crate::motor::MotorSignal;
use crate::orchestrator::scan::ScanSignal;
use crate::orchestrator::transmission::TransmissionSignal;
use crate::samples::SampleSignal;

/// One event as seen by commands and orchestrators.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A raw device event, tagged with the device name.
    Device { device: String, event: DeviceEvent },
    Motor(MotorSignal),
    Exposure(ExposureSignal),
    Sample(SampleSignal),
    Scan(ScanSignal),
    Transmission(TransmissionSignal),
}
