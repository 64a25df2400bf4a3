//! The transmission measurement orchestrator.
//!
//! For a list of samples the sequencer measures the direct-beam
//! intensity through each of them relative to an empty-beam reference:
//! beamstop out, dark measurement with the shutter closed, empty-beam
//! measurement, then one measurement per sample, shutter closed again
//! and beamstop back in. The transmission is
//! `T = (I_sample − I_dark) / (I_empty − I_dark)` with the configured
//! error propagation, written back into the sample store.

use beamctl_common::ckey;
use beamctl_common::error::CommandError;
use beamctl_common::sample::{Measured, SampleAttr, SampleValue};
use beamctl_device::message::DeviceEvent;
use beamctl_device::variable::VarValue;

use crate::exposer::ExposureSignal;
use crate::instrument::InstrumentCtx;
use crate::motor::{MotorRole, MotorSignalKind};
use crate::samples::{MoveDirection, SampleSignal};
use crate::signal::Signal;

/// Prefix used for transmission exposures.
const TRANSMISSION_PREFIX: &str = "tra";

/// How the per-image counts are condensed into a value ± error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPropagation {
    /// Counting statistics: err = sqrt(sum) / n.
    Poisson,
    /// Sample standard deviation of the images.
    StdDev,
}

impl ErrorPropagation {
    fn from_config(ix: &InstrumentCtx) -> Self {
        match ix
            .config
            .get_str(&ckey!["transmission", "errorpropagation"])
        {
            Some("stddev") => Self::StdDev,
            _ => Self::Poisson,
        }
    }

    fn condense(self, counts: &[f64]) -> Measured {
        let n = counts.len().max(1) as f64;
        let mean = counts.iter().sum::<f64>() / n;
        let err = match self {
            Self::Poisson => counts.iter().sum::<f64>().max(0.0).sqrt() / n,
            Self::StdDev => {
                if counts.len() < 2 {
                    0.0
                } else {
                    let var = counts
                        .iter()
                        .map(|c| (c - mean).powi(2))
                        .sum::<f64>()
                        / (n - 1.0);
                    (var / n).sqrt()
                }
            }
        };
        Measured::new(mean, err)
    }
}

/// How the sample list is traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOrdering {
    /// Alphabetically by title.
    Title,
    /// Nearest-neighbour tour over the stage positions, seeded at the
    /// empty-beam position.
    Distance,
}

/// Parameters of one transmission run.
#[derive(Debug, Clone)]
pub struct TransmissionRequest {
    pub samples: Vec<String>,
    pub empty_sample: String,
    pub exptime: f64,
    pub nimages: u64,
    pub delay: f64,
    /// Skip samples that already have a measured transmission.
    pub lazy: bool,
    pub ordering: SampleOrdering,
}

/// Progress events of a transmission run.
#[derive(Debug, Clone, PartialEq)]
pub enum TransmissionSignal {
    Started,
    SampleStarted {
        sample: String,
        index: usize,
        total: usize,
    },
    Progress {
        start: f64,
        end: f64,
        current: f64,
        message: String,
    },
    Finished {
        success: bool,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BeamstopLeg {
    X,
    Y,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    BeamstopOut(BeamstopLeg),
    ExposeDark,
    MoveToEmpty,
    OpenShutterForEmpty,
    ExposeEmpty,
    CloseShutterAfterEmpty,
    MoveToSample,
    OpenShutter,
    ExposeSample,
    CloseShutter,
    BeamstopIn(BeamstopLeg),
    Done,
}

/// A running transmission measurement.
#[derive(Debug)]
pub struct TransmissionTask {
    order: Vec<String>,
    empty_sample: String,
    exptime: f64,
    nimages: u64,
    delay: f64,
    lazy: bool,
    error_propagation: ErrorPropagation,
    phase: Phase,
    sample_idx: usize,
    dark: Option<Measured>,
    empty: Option<Measured>,
    counts: Vec<f64>,
    source: String,
    failures: Vec<String>,
}

impl TransmissionTask {
    /// Validate the request and start the sequence (beamstop out).
    pub fn start(
        ix: &mut InstrumentCtx,
        request: TransmissionRequest,
    ) -> Result<(Self, Vec<TransmissionSignal>), CommandError> {
        if request.samples.is_empty() {
            return Err(CommandError::Precondition(
                "no samples to measure".to_string(),
            ));
        }
        if ix.samples.get(&request.empty_sample).is_none() {
            return Err(CommandError::Precondition(format!(
                "unknown empty-beam sample \"{}\"",
                request.empty_sample
            )));
        }
        for title in &request.samples {
            if ix.samples.get(title).is_none() {
                return Err(CommandError::Precondition(format!(
                    "unknown sample \"{title}\""
                )));
            }
        }
        let source = ix.devices.source()?.name().to_string();
        let order = match request.ordering {
            SampleOrdering::Title => {
                let mut order = request.samples.clone();
                order.sort();
                order
            }
            SampleOrdering::Distance => nearest_neighbour_order(ix, &request),
        };
        let mut task = Self {
            order,
            empty_sample: request.empty_sample,
            exptime: request.exptime,
            nimages: request.nimages.max(1),
            delay: request.delay,
            lazy: request.lazy,
            error_propagation: ErrorPropagation::from_config(ix),
            phase: Phase::BeamstopOut(BeamstopLeg::X),
            sample_idx: 0,
            dark: None,
            empty: None,
            counts: Vec::new(),
            source,
            failures: Vec::new(),
        };
        let mut signals = vec![TransmissionSignal::Started];
        signals.extend(task.enter_phase(ix)?);
        Ok((task, signals))
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn beamstop_target(
        &self,
        ix: &InstrumentCtx,
        leg: BeamstopLeg,
        out: bool,
    ) -> Result<(crate::motor::Motor, f64), CommandError> {
        let role = match leg {
            BeamstopLeg::X => MotorRole::BeamstopX,
            BeamstopLeg::Y => MotorRole::BeamstopY,
        };
        let motor = ix
            .motors
            .by_role(role)
            .cloned()
            .ok_or_else(|| CommandError::Precondition(format!("no motor for {role:?}")))?;
        let side = if out { "out" } else { "in" };
        let axis = match leg {
            BeamstopLeg::X => "x",
            BeamstopLeg::Y => "y",
        };
        let target = ix
            .config
            .get_f64(&ckey!["beamstop", side, axis])
            .ok_or_else(|| {
                CommandError::Precondition(format!(
                    "no stored beamstop {side} position for the {axis} axis"
                ))
            })?;
        Ok((motor, target))
    }

    fn set_shutter(&self, ix: &InstrumentCtx, open: bool) -> Result<bool, CommandError> {
        let frontend = ix
            .devices
            .get(&self.source)
            .ok_or(beamctl_common::error::DeviceError::NotConnected)?;
        if frontend.get_bool(&"shutter".into()) == Some(open) {
            return Ok(true); // already there
        }
        frontend.issue_command("shutter", vec![VarValue::Bool(open)])?;
        Ok(false)
    }

    /// Perform the entry action of the current phase. Phases whose
    /// precondition already holds advance immediately.
    fn enter_phase(&mut self, ix: &mut InstrumentCtx) -> Result<Vec<TransmissionSignal>, CommandError> {
        loop {
            match self.phase {
                Phase::BeamstopOut(leg) => {
                    let (motor, target) = self.beamstop_target(ix, leg, true)?;
                    motor.move_to(ix.devices, ix.accounting, target)?;
                    return Ok(Vec::new());
                }
                Phase::ExposeDark | Phase::ExposeEmpty | Phase::ExposeSample => {
                    self.counts.clear();
                    ix.exposer.start(
                        ix.devices,
                        TRANSMISSION_PREFIX,
                        self.exptime,
                        self.nimages,
                        self.delay,
                    )?;
                    return Ok(Vec::new());
                }
                Phase::MoveToEmpty => {
                    let empty = self.empty_sample.clone();
                    ix.samples.move_to_sample(
                        ix.devices,
                        ix.motors,
                        ix.accounting,
                        ix.config,
                        &empty,
                        MoveDirection::Both,
                    )?;
                    return Ok(Vec::new());
                }
                Phase::MoveToSample => {
                    // Lazy mode: skip samples that already carry a
                    // measured transmission.
                    while self.sample_idx < self.order.len() {
                        let title = &self.order[self.sample_idx];
                        let measured = ix
                            .samples
                            .get(title)
                            .map(|s| s.transmission.err > 0.0 && s.transmission.val > 0.0)
                            .unwrap_or(false);
                        if self.lazy && measured {
                            self.sample_idx += 1;
                        } else {
                            break;
                        }
                    }
                    if self.sample_idx >= self.order.len() {
                        self.phase = Phase::BeamstopIn(BeamstopLeg::X);
                        continue;
                    }
                    let title = self.order[self.sample_idx].clone();
                    let signals = vec![TransmissionSignal::SampleStarted {
                        sample: title.clone(),
                        index: self.sample_idx + 1,
                        total: self.order.len(),
                    }];
                    ix.samples.move_to_sample(
                        ix.devices,
                        ix.motors,
                        ix.accounting,
                        ix.config,
                        &title,
                        MoveDirection::Both,
                    )?;
                    return Ok(signals);
                }
                Phase::OpenShutterForEmpty | Phase::OpenShutter => {
                    if self.set_shutter(ix, true)? {
                        self.phase = self.after_shutter(true);
                        continue;
                    }
                    return Ok(Vec::new());
                }
                Phase::CloseShutterAfterEmpty | Phase::CloseShutter => {
                    if self.set_shutter(ix, false)? {
                        self.phase = self.after_shutter(false);
                        continue;
                    }
                    return Ok(Vec::new());
                }
                Phase::BeamstopIn(leg) => {
                    let (motor, target) = self.beamstop_target(ix, leg, false)?;
                    motor.move_to(ix.devices, ix.accounting, target)?;
                    return Ok(Vec::new());
                }
                Phase::Done => return Ok(Vec::new()),
            }
        }
    }

    /// The phase following a completed shutter move.
    fn after_shutter(&self, opened: bool) -> Phase {
        match (self.phase, opened) {
            (Phase::OpenShutterForEmpty, true) => Phase::ExposeEmpty,
            (Phase::OpenShutter, true) => Phase::ExposeSample,
            (Phase::CloseShutterAfterEmpty, false) => Phase::MoveToSample,
            (Phase::CloseShutter, false) => Phase::MoveToSample,
            (phase, _) => phase,
        }
    }

    fn advance_to(&mut self, ix: &mut InstrumentCtx, phase: Phase) -> Vec<TransmissionSignal> {
        self.phase = phase;
        match self.enter_phase(ix) {
            Ok(signals) => signals,
            Err(error) => self.abort(ix, error.to_string()),
        }
    }

    fn abort(&mut self, ix: &mut InstrumentCtx, message: String) -> Vec<TransmissionSignal> {
        tracing::error!(%message, "transmission measurement failed");
        self.phase = Phase::Done;
        ix.exposer.stop(ix.devices);
        ix.samples.stop(ix.devices, ix.motors);
        let _ = self.set_shutter(ix, false);
        vec![TransmissionSignal::Finished {
            success: false,
            message,
        }]
    }

    /// Abort on user request: motors and shutter back to a safe state.
    pub fn stop(&mut self, ix: &mut InstrumentCtx) -> Vec<TransmissionSignal> {
        if self.phase == Phase::Done {
            return Vec::new();
        }
        self.abort(ix, "transmission measurement stopped".to_string())
    }

    /// Feed one event-thread signal through the sequencer.
    pub fn on_signal(&mut self, ix: &mut InstrumentCtx, signal: &Signal) -> Vec<TransmissionSignal> {
        match (self.phase, signal) {
            // Beamstop legs advance X → Y → next stage.
            (Phase::BeamstopOut(leg) | Phase::BeamstopIn(leg), Signal::Motor(motion)) => {
                let role = match leg {
                    BeamstopLeg::X => MotorRole::BeamstopX,
                    BeamstopLeg::Y => MotorRole::BeamstopY,
                };
                let ours = ix
                    .motors
                    .by_role(role)
                    .is_some_and(|m| m.name == motion.motor);
                if !ours {
                    return Vec::new();
                }
                match &motion.kind {
                    MotorSignalKind::Stopped { success: true, .. } => {
                        match self.phase {
                            Phase::BeamstopOut(BeamstopLeg::X) => {
                                self.advance_to(ix, Phase::BeamstopOut(BeamstopLeg::Y))
                            }
                            Phase::BeamstopOut(BeamstopLeg::Y) => {
                                self.advance_to(ix, Phase::ExposeDark)
                            }
                            Phase::BeamstopIn(BeamstopLeg::X) => {
                                self.advance_to(ix, Phase::BeamstopIn(BeamstopLeg::Y))
                            }
                            _ => {
                                // Last leg of the final beamstop move.
                                self.phase = Phase::Done;
                                let failed = self.failures.len();
                                vec![TransmissionSignal::Finished {
                                    success: failed == 0,
                                    message: if failed == 0 {
                                        "transmission measurement complete".to_string()
                                    } else {
                                        format!(
                                            "transmission finished with {failed} failed sample(s): {}",
                                            self.failures.join(", ")
                                        )
                                    },
                                }]
                            }
                        }
                    }
                    MotorSignalKind::Stopped { success: false, .. } => {
                        self.abort(ix, format!("beamstop motor {} failed", motion.motor))
                    }
                    _ => Vec::new(),
                }
            }
            // Stage moves are delegated to the sample store.
            (Phase::MoveToEmpty, Signal::Sample(SampleSignal::MovingFinished { success, .. })) => {
                if *success {
                    self.advance_to(ix, Phase::OpenShutterForEmpty)
                } else {
                    self.abort(ix, "cannot move to the empty-beam position".to_string())
                }
            }
            (Phase::MoveToSample, Signal::Sample(SampleSignal::MovingFinished { success, sample })) => {
                if *success {
                    self.advance_to(ix, Phase::OpenShutter)
                } else {
                    self.abort(ix, format!("cannot move to sample {sample}"))
                }
            }
            // Shutter phases wait for the source's shutter variable.
            (
                Phase::OpenShutterForEmpty
                | Phase::OpenShutter
                | Phase::CloseShutterAfterEmpty
                | Phase::CloseShutter,
                Signal::Device { device, event },
            ) if *device == self.source => {
                let DeviceEvent::VariableChanged { name, value } = event else {
                    return Vec::new();
                };
                if name.base() != "shutter" {
                    return Vec::new();
                }
                let opening = matches!(
                    self.phase,
                    Phase::OpenShutterForEmpty | Phase::OpenShutter
                );
                if value.as_bool() == Some(opening) {
                    let next = self.after_shutter(opening);
                    self.advance_to(ix, next)
                } else {
                    self.abort(ix, "shutter did not reach the requested state".to_string())
                }
            }
            // Exposure phases accumulate counts.
            (
                Phase::ExposeDark | Phase::ExposeEmpty | Phase::ExposeSample,
                Signal::Exposure(exposure),
            ) => match exposure {
                ExposureSignal::ImageReceived { counts, .. } => {
                    self.counts.push(*counts);
                    Vec::new()
                }
                ExposureSignal::Progress { elapsed, total, .. } => {
                    vec![TransmissionSignal::Progress {
                        start: 0.0,
                        end: *total,
                        current: *elapsed,
                        message: format!(
                            "Counting ({})",
                            match self.phase {
                                Phase::ExposeDark => "dark".to_string(),
                                Phase::ExposeEmpty => "empty beam".to_string(),
                                _ => self
                                    .order
                                    .get(self.sample_idx)
                                    .cloned()
                                    .unwrap_or_default(),
                            }
                        ),
                    }]
                }
                ExposureSignal::Finished { success: false, message } => {
                    self.abort(ix, message.clone())
                }
                ExposureSignal::Finished { success: true, .. } => {
                    let measured = self.error_propagation.condense(&self.counts);
                    match self.phase {
                        Phase::ExposeDark => {
                            self.dark = Some(measured);
                            self.advance_to(ix, Phase::MoveToEmpty)
                        }
                        Phase::ExposeEmpty => {
                            self.empty = Some(measured);
                            self.advance_to(ix, Phase::CloseShutterAfterEmpty)
                        }
                        _ => {
                            let signals = self.store_transmission(ix, measured);
                            self.sample_idx += 1;
                            let mut out = signals;
                            out.extend(self.advance_to(ix, Phase::CloseShutter));
                            out
                        }
                    }
                }
            },
            _ => Vec::new(),
        }
    }

    /// Compute and persist the transmission of the current sample.
    fn store_transmission(
        &mut self,
        ix: &mut InstrumentCtx,
        sample_counts: Measured,
    ) -> Vec<TransmissionSignal> {
        let title = match self.order.get(self.sample_idx) {
            Some(title) => title.clone(),
            None => return Vec::new(),
        };
        let (Some(dark), Some(empty)) = (self.dark, self.empty) else {
            self.failures.push(title);
            return Vec::new();
        };
        let numerator = sample_counts.val - dark.val;
        let denominator = empty.val - dark.val;
        if denominator.abs() < f64::EPSILON {
            tracing::warn!(sample = %title, "empty-beam intensity equals dark, no transmission");
            self.failures.push(title);
            return Vec::new();
        }
        let value = numerator / denominator;
        let num_err = (sample_counts.err.powi(2) + dark.err.powi(2)).sqrt();
        let den_err = (empty.err.powi(2) + dark.err.powi(2)).sqrt();
        let rel_err = ((num_err / numerator.abs().max(f64::EPSILON)).powi(2)
            + (den_err / denominator.abs()).powi(2))
        .sqrt();
        let transmission = Measured::new(value, value.abs() * rel_err);
        let stored = ix.samples.update_sample(
            &title,
            SampleAttr::Transmission,
            SampleValue::Measured(transmission),
            ix.config,
        );
        if let Err(error) = stored {
            tracing::warn!(sample = %title, %error, "cannot store the transmission");
            self.failures.push(title.clone());
        }
        vec![TransmissionSignal::Progress {
            start: 0.0,
            end: 1.0,
            current: transmission.val.clamp(0.0, 1.0),
            message: format!(
                "Transmission of {title}: {:.4} ± {:.4}",
                transmission.val, transmission.err
            ),
        }]
    }
}

/// Order the samples by a nearest-neighbour walk over their stage
/// positions, starting from the empty-beam position.
fn nearest_neighbour_order(ix: &InstrumentCtx, request: &TransmissionRequest) -> Vec<String> {
    let position = |title: &str| -> (f64, f64) {
        ix.samples
            .get(title)
            .map(|s| (s.positionx.val, s.positiony.val))
            .unwrap_or((0.0, 0.0))
    };
    let mut here = position(&request.empty_sample);
    let mut remaining: Vec<String> = request.samples.clone();
    let mut order = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let (idx, _) = remaining
            .iter()
            .enumerate()
            .map(|(i, title)| {
                let (x, y) = position(title);
                let d = (x - here.0).powi(2) + (y - here.1).powi(2);
                (i, d)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((0, 0.0));
        let next = remaining.remove(idx);
        here = position(&next);
        order.push(next);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poisson_condensation_uses_counting_statistics() {
        let measured = ErrorPropagation::Poisson.condense(&[100.0, 100.0]);
        assert!((measured.val - 100.0).abs() < 1e-12);
        // err = sqrt(200) / 2
        assert!((measured.err - 200f64.sqrt() / 2.0).abs() < 1e-12);
    }

    #[test]
    fn stddev_condensation_spreads_over_the_images() {
        let measured = ErrorPropagation::StdDev.condense(&[90.0, 110.0]);
        assert!((measured.val - 100.0).abs() < 1e-12);
        // sample std = sqrt(200), err of mean = sqrt(200/2)
        assert!((measured.err - (200f64 / 2.0).sqrt()).abs() < 1e-9);
    }
}
