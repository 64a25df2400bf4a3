//! The scan orchestrator: move a motor across an interval, exposing at
//! every point, and write a scan record file.
//!
//! Scan records live under the scan directory as numbered text files;
//! the highest existing index plus one is the next scan number. Every
//! point records the motor position plus the readings of the counters
//! available at the time (image counts, vacuum pressure, bath
//! temperature).

use std::path::{Path, PathBuf};

use chrono::Local;

use beamctl_common::error::CommandError;

use crate::exposer::ExposureSignal;
use crate::instrument::InstrumentCtx;
use crate::motor::MotorSignalKind;
use crate::signal::Signal;

/// Prefix used for scan exposures.
const SCAN_PREFIX: &str = "scn";

/// Parameters of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanParams {
    pub motor: String,
    pub start: f64,
    pub end: f64,
    pub steps: u32,
    pub exptime: f64,
    pub comment: String,
    /// Interpret `start`/`end` relative to the current position.
    pub relative: bool,
}

/// Requests from the scan commands to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanRequest {
    Start(ScanParams),
    Stop,
}

/// Progress events of a running scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanSignal {
    Started {
        index: u64,
        steps: u32,
    },
    Progress {
        start: f64,
        end: f64,
        current: f64,
        message: String,
    },
    Finished {
        success: bool,
        index: u64,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Moving,
    Exposing,
    Done,
}

/// One point of the scan record.
#[derive(Debug, Clone)]
struct ScanPoint {
    position: f64,
    readings: Vec<f64>,
}

/// A running scan.
#[derive(Debug)]
pub struct ScanTask {
    index: u64,
    motor: String,
    start: f64,
    step_size: f64,
    steps: u32,
    exptime: f64,
    comment: String,
    command_line: String,
    date: String,
    scan_dir: PathBuf,
    phase: Phase,
    current_step: u32,
    columns: Vec<String>,
    points: Vec<ScanPoint>,
    pending_counts: Option<f64>,
}

impl ScanTask {
    /// Begin a scan: resolve the interval, move to the first point.
    pub fn start(
        ix: &mut InstrumentCtx,
        scan_dir: impl Into<PathBuf>,
        params: ScanParams,
    ) -> Result<(Self, Vec<ScanSignal>), CommandError> {
        if params.steps < 2 {
            return Err(CommandError::Precondition(
                "a scan needs at least two points".to_string(),
            ));
        }
        if params.exptime <= 0.0 {
            return Err(CommandError::OutOfRange(format!(
                "invalid counting time {}",
                params.exptime
            )));
        }
        let motor = ix
            .motors
            .get(&params.motor)
            .ok_or_else(|| {
                CommandError::Precondition(format!("unknown motor: {}", params.motor))
            })?
            .clone();
        let (start, end) = if params.relative {
            let here = motor.position(ix.devices)?;
            (here + params.start, here + params.end)
        } else {
            (params.start, params.end)
        };
        let scan_dir = scan_dir.into();
        std::fs::create_dir_all(&scan_dir).map_err(|e| {
            CommandError::Precondition(format!("cannot create the scan directory: {e}"))
        })?;
        let index = next_scan_index(&scan_dir);
        let mut columns = vec![params.motor.clone(), "counts".to_string()];
        if ix.devices.vacuum().is_ok() {
            columns.push("pressure".to_string());
        }
        if ix.devices.temperature().is_ok() {
            columns.push("temperature".to_string());
        }
        motor.move_to(ix.devices, ix.accounting, start)?;
        let command_line = format!(
            "scan(\"{}\", {start}, {end}, {}, {}, \"{}\")",
            params.motor, params.steps, params.exptime, params.comment
        );
        let task = Self {
            index,
            motor: params.motor,
            start,
            step_size: (end - start) / f64::from(params.steps - 1),
            steps: params.steps,
            exptime: params.exptime,
            comment: params.comment,
            command_line,
            date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            scan_dir,
            phase: Phase::Moving,
            current_step: 0,
            columns,
            points: Vec::new(),
            pending_counts: None,
        };
        let signals = vec![ScanSignal::Started {
            index,
            steps: task.steps,
        }];
        Ok((task, signals))
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn end(&self) -> f64 {
        self.start + self.step_size * f64::from(self.steps - 1)
    }

    fn finish(&mut self, success: bool, message: impl Into<String>) -> Vec<ScanSignal> {
        self.phase = Phase::Done;
        let mut message = message.into();
        if success {
            if let Err(error) = self.write_record() {
                success_note(&mut message, &error);
            }
        }
        vec![ScanSignal::Finished {
            success,
            index: self.index,
            message,
        }]
    }

    /// Feed one event-thread signal through the scan state machine.
    pub fn on_signal(&mut self, ix: &mut InstrumentCtx, signal: &Signal) -> Vec<ScanSignal> {
        match (self.phase, signal) {
            (Phase::Moving, Signal::Motor(motion)) if motion.motor == self.motor => {
                match &motion.kind {
                    MotorSignalKind::Stopped { success: true, position } => {
                        // In position: count.
                        self.pending_counts = None;
                        let started = ix.exposer.start(
                            ix.devices,
                            SCAN_PREFIX,
                            self.exptime,
                            1,
                            0.003,
                        );
                        match started {
                            Ok(_) => {
                                self.phase = Phase::Exposing;
                                vec![ScanSignal::Progress {
                                    start: self.start,
                                    end: self.end(),
                                    current: *position,
                                    message: format!(
                                        "Exposing at point {}/{}",
                                        self.current_step + 1,
                                        self.steps
                                    ),
                                }]
                            }
                            Err(error) => self.finish(false, error.to_string()),
                        }
                    }
                    MotorSignalKind::Stopped { success: false, .. } => {
                        self.finish(false, format!("motor {} failed", self.motor))
                    }
                    MotorSignalKind::Moving { position, .. } => {
                        vec![ScanSignal::Progress {
                            start: self.start,
                            end: self.end(),
                            current: *position,
                            message: format!(
                                "Moving {} to point {}/{}",
                                self.motor,
                                self.current_step + 1,
                                self.steps
                            ),
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            (Phase::Exposing, Signal::Exposure(exposure)) => match exposure {
                ExposureSignal::ImageReceived { counts, .. } => {
                    self.pending_counts = Some(*counts);
                    Vec::new()
                }
                ExposureSignal::Finished { success: true, .. } => {
                    self.record_point(ix);
                    self.current_step += 1;
                    if self.current_step >= self.steps {
                        return self.finish(true, format!("{} points recorded", self.steps));
                    }
                    let target =
                        self.start + self.step_size * f64::from(self.current_step);
                    let moved = ix
                        .motors
                        .get(&self.motor)
                        .ok_or_else(|| {
                            CommandError::Precondition(format!(
                                "motor {} disappeared",
                                self.motor
                            ))
                        })
                        .and_then(|m| m.move_to(ix.devices, ix.accounting, target));
                    match moved {
                        Ok(()) => {
                            self.phase = Phase::Moving;
                            Vec::new()
                        }
                        Err(error) => self.finish(false, error.to_string()),
                    }
                }
                ExposureSignal::Finished {
                    success: false,
                    message,
                } => self.finish(false, message.clone()),
                ExposureSignal::Progress { .. } => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Abort the scan, stopping whatever is in flight.
    pub fn stop(&mut self, ix: &mut InstrumentCtx) -> Vec<ScanSignal> {
        if self.phase == Phase::Done {
            return Vec::new();
        }
        if let Some(motor) = ix.motors.get(&self.motor) {
            let _ = motor.stop(ix.devices);
        }
        ix.exposer.stop(ix.devices);
        self.finish(false, "scan stopped on user request")
    }

    fn record_point(&mut self, ix: &InstrumentCtx) {
        let position = ix
            .motors
            .get(&self.motor)
            .and_then(|m| m.position(ix.devices).ok())
            .unwrap_or(self.start + self.step_size * f64::from(self.current_step));
        let mut readings = vec![self.pending_counts.take().unwrap_or(0.0)];
        if let Ok(vacuum) = ix.devices.vacuum() {
            readings.push(vacuum.get_f64(&"pressure".into()).unwrap_or(f64::NAN));
        }
        if let Ok(thermostat) = ix.devices.temperature() {
            readings.push(
                thermostat
                    .get_f64(&"temperature".into())
                    .unwrap_or(f64::NAN),
            );
        }
        self.points.push(ScanPoint { position, readings });
    }

    /// Write the scan record file.
    fn write_record(&self) -> Result<(), String> {
        let mut out = String::new();
        out.push_str(&format!("# Scan {}\n", self.index));
        out.push_str(&format!("# Command: {}\n", self.command_line));
        out.push_str(&format!("# Date: {}\n", self.date));
        out.push_str(&format!("# Comment: {}\n", self.comment));
        out.push_str(&format!("# Counting time: {:.6}\n", self.exptime));
        out.push_str(&format!("# Columns: {}\n", self.columns.join("\t")));
        for point in &self.points {
            out.push_str(&format!("{:.6}", point.position));
            for reading in &point.readings {
                out.push_str(&format!("\t{reading:.6}"));
            }
            out.push('\n');
        }
        let path = self.scan_dir.join(format!("scan_{:05}.txt", self.index));
        std::fs::write(&path, out).map_err(|e| format!("cannot write {}: {e}", path.display()))
    }
}

fn success_note(message: &mut String, error: &str) {
    if message.is_empty() {
        *message = format!("scan record not written: {error}");
    } else {
        message.push_str(&format!(" (scan record not written: {error})"));
    }
}

/// Highest scan index on disk plus one.
pub fn next_scan_index(scan_dir: &Path) -> u64 {
    let Ok(pattern) = regex::Regex::new(r"^scan_(\d+)\.txt$") else {
        return 0;
    };
    let Ok(entries) = std::fs::read_dir(scan_dir) else {
        return 0;
    };
    let mut highest = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if let Some(caps) = pattern.captures(&name.to_string_lossy()) {
            if let Ok(index) = caps[1].parse::<u64>() {
                highest = Some(highest.map_or(index, |h: u64| h.max(index)));
            }
        }
    }
    highest.map_or(0, |h| h + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_indices_come_from_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_scan_index(dir.path()), 0);
        std::fs::write(dir.path().join("scan_00000.txt"), "").unwrap();
        std::fs::write(dir.path().join("scan_00007.txt"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert_eq!(next_scan_index(dir.path()), 8);
    }

    #[test]
    fn record_file_carries_header_and_points() {
        let dir = tempfile::tempdir().unwrap();
        let task = ScanTask {
            index: 3,
            motor: "PH1_X".to_string(),
            start: -1.0,
            step_size: 0.5,
            steps: 5,
            exptime: 0.1,
            comment: "pinhole alignment".to_string(),
            command_line: "scan(\"PH1_X\", -1, 1, 5, 0.1, \"pinhole alignment\")"
                .to_string(),
            date: "2026-03-02 10:00:00".to_string(),
            scan_dir: dir.path().to_path_buf(),
            phase: Phase::Done,
            current_step: 5,
            columns: vec!["PH1_X".to_string(), "counts".to_string()],
            points: vec![
                ScanPoint {
                    position: -1.0,
                    readings: vec![120.0],
                },
                ScanPoint {
                    position: -0.5,
                    readings: vec![480.0],
                },
            ],
            pending_counts: None,
        };
        task.write_record().unwrap();
        let content =
            std::fs::read_to_string(dir.path().join("scan_00003.txt")).unwrap();
        assert!(content.contains("# Scan 3"));
        assert!(content.contains("# Comment: pinhole alignment"));
        assert!(content.contains("# Columns: PH1_X\tcounts"));
        assert!(content.lines().count() >= 8);
        assert!(content.contains("-0.500000\t480.000000"));
    }
}
