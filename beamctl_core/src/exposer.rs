//! Exposure sequencing and file-sequence-number bookkeeping.
//!
//! File sequence numbers are monotonically increasing per prefix and
//! the filesystem is the source of truth: the next FSN is one past the
//! highest one found on disk. The exposer submits exposures to the
//! detector, matches per-image notifications back to the running
//! exposure and reports progress upward.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use beamctl_common::error::CommandError;
use beamctl_device::message::{DeviceEvent, DeviceStatus};
use beamctl_device::variable::VarValue;
use beamctl_device::varname::VarName;

use crate::manager::DeviceManager;

/// Extra wall-clock allowance beyond the programmed exposure series.
const EXPOSURE_MARGIN: Duration = Duration::from_secs(5);

/// Signals of a running exposure.
#[derive(Debug, Clone, PartialEq)]
pub enum ExposureSignal {
    Progress {
        prefix: String,
        fsn: u64,
        elapsed: f64,
        total: f64,
    },
    ImageReceived {
        prefix: String,
        fsn: u64,
        path: String,
        counts: f64,
    },
    Finished {
        success: bool,
        message: String,
    },
}

#[derive(Debug)]
struct ActiveExposure {
    prefix: String,
    first_fsn: u64,
    count: u64,
    period: f64,
    received: u64,
    started: Instant,
    stopping: bool,
    last_image: Option<String>,
}

/// How often a running exposure reports progress.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// The exposure sequencer.
#[derive(Debug)]
pub struct Exposer {
    images_root: PathBuf,
    fsndigits: usize,
    active: Option<ActiveExposure>,
    last_progress: Option<Instant>,
}

impl Exposer {
    pub fn new(images_root: impl Into<PathBuf>, fsndigits: usize) -> Self {
        Self {
            images_root: images_root.into(),
            fsndigits: fsndigits.clamp(1, 12),
            active: None,
            last_progress: None,
        }
    }

    pub fn is_exposing(&self) -> bool {
        self.active.is_some()
    }

    pub fn fsndigits(&self) -> usize {
        self.fsndigits
    }

    /// Directory where images of one prefix land.
    pub fn prefix_dir(&self, prefix: &str) -> PathBuf {
        self.images_root.join(prefix)
    }

    /// File name of one exposure.
    pub fn image_filename(&self, prefix: &str, fsn: u64) -> String {
        format!("{prefix}_{fsn:0width$}.cbf", width = self.fsndigits)
    }

    /// Next free FSN of a prefix: highest on disk plus one.
    pub fn next_fsn(&self, prefix: &str) -> u64 {
        highest_fsn(&self.prefix_dir(prefix), prefix).map_or(0, |n| n + 1)
    }

    /// Submit an exposure series to the detector; returns the first
    /// FSN of the series.
    pub fn start(
        &mut self,
        devices: &DeviceManager,
        prefix: &str,
        exptime: f64,
        nimages: u64,
        delay: f64,
    ) -> Result<u64, CommandError> {
        if self.active.is_some() {
            return Err(CommandError::Precondition(
                "an exposure is already running".to_string(),
            ));
        }
        if exptime <= 0.0 || nimages == 0 {
            return Err(CommandError::OutOfRange(format!(
                "invalid exposure parameters: {exptime} s × {nimages}"
            )));
        }
        let detector = devices.detector()?;
        if detector.status() != DeviceStatus::Idle {
            return Err(CommandError::Precondition(
                "detector is not idle".to_string(),
            ));
        }
        std::fs::create_dir_all(self.prefix_dir(prefix)).map_err(|e| {
            CommandError::Precondition(format!("cannot create the image directory: {e}"))
        })?;
        let fsn = self.next_fsn(prefix);
        let filename = format!("{prefix}/{}", self.image_filename(prefix, fsn));
        let period = exptime + delay;
        detector.issue_command(
            "expose",
            vec![
                VarValue::Str(filename),
                VarValue::Float(exptime),
                VarValue::Int(nimages as i64),
                VarValue::Float(period),
            ],
        )?;
        self.active = Some(ActiveExposure {
            prefix: prefix.to_string(),
            first_fsn: fsn,
            count: nimages,
            period,
            received: 0,
            started: Instant::now(),
            stopping: false,
            last_image: None,
        });
        tracing::info!(prefix, fsn, nimages, exptime, "exposure started");
        Ok(fsn)
    }

    /// Abort the running exposure.
    pub fn stop(&mut self, devices: &DeviceManager) {
        if let Some(active) = &mut self.active {
            active.stopping = true;
            if let Ok(detector) = devices.detector() {
                let _ = detector.issue_command("stopexposure", Vec::new());
            }
        }
    }

    /// Feed one detector event through the exposure bookkeeping.
    pub fn on_detector_event(&mut self, event: &DeviceEvent) -> Vec<ExposureSignal> {
        let Some(active) = &mut self.active else {
            return Vec::new();
        };
        let mut signals = Vec::new();
        let mut done = false;
        match event {
            DeviceEvent::VariableChanged { name, value } => match (name.base(), value) {
                ("lastimagefile", VarValue::Str(path)) => {
                    active.last_image = Some(path.clone());
                }
                ("lastimagecounts", VarValue::Int(counts)) => {
                    let fsn = active.first_fsn + active.received;
                    active.received += 1;
                    signals.push(ExposureSignal::ImageReceived {
                        prefix: active.prefix.clone(),
                        fsn,
                        path: active.last_image.take().unwrap_or_default(),
                        counts: *counts as f64,
                    });
                    if active.received >= active.count {
                        signals.push(ExposureSignal::Finished {
                            success: true,
                            message: format!(
                                "exposure series {} complete",
                                active.prefix
                            ),
                        });
                        done = true;
                    }
                }
                ("__status__", VarValue::Str(status)) => {
                    let became_idle = DeviceStatus::parse(status) == DeviceStatus::Idle;
                    if became_idle && (active.stopping || active.received < active.count) {
                        signals.push(ExposureSignal::Finished {
                            success: false,
                            message: if active.stopping {
                                "exposure stopped".to_string()
                            } else {
                                "detector went idle before all images arrived".to_string()
                            },
                        });
                        done = true;
                    }
                }
                _ => {}
            },
            DeviceEvent::CommandResult {
                success: false,
                command,
                message,
            } if command == "expose" => {
                signals.push(ExposureSignal::Finished {
                    success: false,
                    message: format!("exposure rejected: {message}"),
                });
                done = true;
            }
            _ => {}
        }
        if done {
            self.active = None;
        }
        signals
    }

    /// Periodic progress reporting and the exposure timeout.
    pub fn tick(&mut self) -> Vec<ExposureSignal> {
        let Some(active) = &self.active else {
            return Vec::new();
        };
        let elapsed = active.started.elapsed();
        let total = active.period * active.count as f64;
        if elapsed > Duration::from_secs_f64(total) + EXPOSURE_MARGIN {
            let prefix = active.prefix.clone();
            self.active = None;
            return vec![ExposureSignal::Finished {
                success: false,
                message: format!("exposure of prefix {prefix} timed out"),
            }];
        }
        let due = self
            .last_progress
            .is_none_or(|at| at.elapsed() >= PROGRESS_INTERVAL);
        if !due {
            return Vec::new();
        }
        self.last_progress = Some(Instant::now());
        vec![ExposureSignal::Progress {
            prefix: active.prefix.clone(),
            fsn: active.first_fsn + active.received,
            elapsed: elapsed.as_secs_f64(),
            total,
        }]
    }
}

/// Highest FSN among `<prefix>_<digits>.cbf` files in a directory.
fn highest_fsn(dir: &Path, prefix: &str) -> Option<u64> {
    let pattern = regex::Regex::new(&format!(
        "^{}_(\\d+)\\.cbf$",
        regex::escape(prefix)
    ))
    .ok()?;
    let entries = std::fs::read_dir(dir).ok()?;
    let mut highest = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name_lossy = name.to_string_lossy();
        let Some(caps) = pattern.captures(&name_lossy) else {
            continue;
        };
        if let Ok(fsn) = caps[1].parse::<u64>() {
            highest = Some(highest.map_or(fsn, |h: u64| h.max(fsn)));
        }
    }
    highest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_filesystem_is_the_fsn_source_of_truth() {
        let dir = tempfile::tempdir().unwrap();
        let exposer = Exposer::new(dir.path(), 5);
        assert_eq!(exposer.next_fsn("crd"), 0, "empty directory starts at zero");
        let crd = dir.path().join("crd");
        std::fs::create_dir_all(&crd).unwrap();
        for fsn in [0, 3, 17] {
            std::fs::write(crd.join(format!("crd_{fsn:05}.cbf")), b"").unwrap();
        }
        // Foreign files are ignored.
        std::fs::write(crd.join("scn_00042.cbf"), b"").unwrap();
        std::fs::write(crd.join("crd_badname.cbf"), b"").unwrap();
        assert_eq!(exposer.next_fsn("crd"), 18);
        assert_eq!(exposer.next_fsn("scn"), 0, "per-prefix numbering");
    }

    #[test]
    fn filenames_are_zero_padded_to_fsndigits() {
        let exposer = Exposer::new("/tmp/images", 5);
        assert_eq!(exposer.image_filename("crd", 7), "crd_00007.cbf");
        assert_eq!(exposer.image_filename("tra", 12345), "tra_12345.cbf");
    }

    #[test]
    fn image_events_are_matched_in_order() {
        let mut exposer = Exposer::new("/tmp/images", 5);
        exposer.active = Some(ActiveExposure {
            prefix: "crd".to_string(),
            first_fsn: 10,
            count: 2,
            period: 1.0,
            received: 0,
            started: Instant::now(),
            stopping: false,
            last_image: None,
        });
        let file_event = DeviceEvent::VariableChanged {
            name: VarName::plain("lastimagefile"),
            value: VarValue::Str("crd/crd_00010.cbf".to_string()),
        };
        let counts_event = DeviceEvent::VariableChanged {
            name: VarName::plain("lastimagecounts"),
            value: VarValue::Int(4242),
        };
        assert!(exposer.on_detector_event(&file_event).is_empty());
        let signals = exposer.on_detector_event(&counts_event);
        assert_eq!(
            signals,
            vec![ExposureSignal::ImageReceived {
                prefix: "crd".to_string(),
                fsn: 10,
                path: "crd/crd_00010.cbf".to_string(),
                counts: 4242.0,
            }]
        );
        // Second (final) image finishes the series.
        exposer.on_detector_event(&file_event);
        let signals = exposer.on_detector_event(&counts_event);
        assert_eq!(signals.len(), 2);
        assert!(matches!(
            signals[1],
            ExposureSignal::Finished { success: true, .. }
        ));
        assert!(!exposer.is_exposing());
    }
}
