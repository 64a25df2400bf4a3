//! Bootstrap configuration and instrument wiring.
//!
//! The static setup of an installation — which devices exist, where
//! they listen, which motors are bound to which axes — is a TOML file
//! loaded once at startup. The dynamic state (samples, calibrants,
//! soft limits, current selections) lives in the runtime config tree
//! and the per-controller position files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use beamctl_common::accounting::Accounting;
use beamctl_common::config::Config;
use beamctl_common::privilege::Privilege;

use crate::calibrants::CalibrantStore;
use crate::exposer::Exposer;
use crate::instrument::Instrument;
use crate::manager::{DeviceManager, DeviceSpec};
use crate::motor::{Motor, MotorRole, MotorSet};
use crate::samples::SampleStore;

/// Errors while reading or applying the bootstrap file.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse bootstrap file: {0}")]
    ParseError(String),

    #[error("bootstrap validation failed: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Config(#[from] beamctl_common::config::ConfigError),

    #[error(transparent)]
    Store(#[from] beamctl_common::error::StoreError),

    #[error(transparent)]
    Device(#[from] beamctl_common::error::DeviceError),
}

fn default_fsndigits() -> usize {
    5
}
fn default_userdb() -> String {
    "userdb.json".to_string()
}
fn default_autosave_s() -> f64 {
    0.5
}

/// `[paths]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Root of the data tree; the other directories are relative to it.
    pub root: PathBuf,
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,
    #[serde(default = "default_scan_dir")]
    pub scan_dir: PathBuf,
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}
fn default_images_dir() -> PathBuf {
    PathBuf::from("images")
}
fn default_scan_dir() -> PathBuf {
    PathBuf::from("scan")
}

impl PathsConfig {
    pub fn config_dir(&self) -> PathBuf {
        self.root.join(&self.config_dir)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(&self.images_dir)
    }

    pub fn scan_dir(&self) -> PathBuf {
        self.root.join(&self.scan_dir)
    }
}

/// `[instrument]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentConfig {
    /// Zero-padding width of file sequence numbers (1..=12).
    #[serde(default = "default_fsndigits")]
    pub fsndigits: usize,
    /// User database file, relative to the config directory.
    #[serde(default = "default_userdb")]
    pub userdb: String,
    /// Config autosave quiescence in seconds (0.0..=60.0).
    #[serde(default = "default_autosave_s")]
    pub autosave_quiescence_s: f64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            fsndigits: default_fsndigits(),
            userdb: default_userdb(),
            autosave_quiescence_s: default_autosave_s(),
        }
    }
}

/// One `[[motor]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotorConfig {
    pub name: String,
    pub controller: String,
    pub axis: u8,
    #[serde(default)]
    pub role: Option<MotorRole>,
    /// Privilege name required to move this motor.
    #[serde(default)]
    pub privilege: Option<String>,
}

/// The whole bootstrap file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bootstrap {
    pub paths: PathsConfig,
    #[serde(default)]
    pub instrument: InstrumentConfig,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceSpec>,
    #[serde(default, rename = "motor")]
    pub motors: Vec<MotorConfig>,
}

impl Bootstrap {
    /// Load and validate a bootstrap file.
    pub fn load(path: &Path) -> Result<Self, BootstrapError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BootstrapError::FileNotFound(path.display().to_string())
            } else {
                BootstrapError::ParseError(e.to_string())
            }
        })?;
        let bootstrap: Bootstrap =
            toml::from_str(&content).map_err(|e| BootstrapError::ParseError(e.to_string()))?;
        bootstrap.validate()?;
        Ok(bootstrap)
    }

    /// Validate field bounds and cross-references.
    pub fn validate(&self) -> Result<(), BootstrapError> {
        if !(1..=12).contains(&self.instrument.fsndigits) {
            return Err(BootstrapError::ValidationError(format!(
                "instrument.fsndigits={} out of range [1, 12]",
                self.instrument.fsndigits
            )));
        }
        if !(0.0..=60.0).contains(&self.instrument.autosave_quiescence_s) {
            return Err(BootstrapError::ValidationError(format!(
                "instrument.autosave_quiescence_s={} out of range [0, 60]",
                self.instrument.autosave_quiescence_s
            )));
        }
        for (i, spec) in self.devices.iter().enumerate() {
            if self.devices[..i].iter().any(|d| d.name == spec.name) {
                return Err(BootstrapError::ValidationError(format!(
                    "duplicate device name: {}",
                    spec.name
                )));
            }
        }
        for motor in &self.motors {
            let Some(spec) = self.devices.iter().find(|d| d.name == motor.controller)
            else {
                return Err(BootstrapError::ValidationError(format!(
                    "motor {} references unknown controller {}",
                    motor.name, motor.controller
                )));
            };
            let Some(axes) = spec.kind.axes() else {
                return Err(BootstrapError::ValidationError(format!(
                    "motor {} is bound to {}, which is not a motor controller",
                    motor.name, motor.controller
                )));
            };
            if motor.axis >= axes {
                return Err(BootstrapError::ValidationError(format!(
                    "motor {}: axis {} out of range for {} ({} axes)",
                    motor.name,
                    motor.axis,
                    motor.controller,
                    axes
                )));
            }
            if let Some(privilege) = &motor.privilege {
                if Privilege::from_name(privilege).is_none() {
                    return Err(BootstrapError::ValidationError(format!(
                        "motor {}: unknown privilege '{privilege}'",
                        motor.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the motor registry.
    pub fn motor_set(&self) -> Result<MotorSet, BootstrapError> {
        let mut motors = MotorSet::new();
        for entry in &self.motors {
            let mut motor = Motor::new(&entry.name, &entry.controller, entry.axis);
            motor.role = entry.role;
            if let Some(privilege) = &entry.privilege {
                motor.required_privilege = Privilege::from_name(privilege)
                    .unwrap_or(Privilege::Layman);
            }
            motors.add(motor)?;
        }
        Ok(motors)
    }

    /// Construct the instrument: open the runtime config, the user
    /// database, launch every device and load the stores.
    pub fn build(&self) -> Result<Instrument, BootstrapError> {
        let config_dir = self.paths.config_dir();
        std::fs::create_dir_all(&config_dir)
            .map_err(|e| BootstrapError::ValidationError(e.to_string()))?;
        let config = Config::open(
            config_dir.join("config.json"),
            Some(Duration::from_secs_f64(self.instrument.autosave_quiescence_s)),
        )?;
        let accounting = Accounting::open(&config_dir, &self.instrument.userdb)?;
        let mut devices = DeviceManager::new();
        for spec in &self.devices {
            devices.add(spec.clone())?;
        }
        devices.broadcast_config(&config);
        let motors = self.motor_set()?;
        let mut samples = SampleStore::new();
        samples.load_from_config(&config);
        let mut calibrants = CalibrantStore::new();
        calibrants.load_from_config(&config);
        let exposer = Exposer::new(self.paths.images_dir(), self.instrument.fsndigits);
        Ok(Instrument::new(
            config,
            accounting,
            devices,
            motors,
            samples,
            calibrants,
            exposer,
            self.paths.scan_dir(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[paths]
root = "/data/beamline"

[instrument]
fsndigits = 5

[[device]]
name = "tmcm351"
kind = "tmcm351"
host = "192.168.1.10"
port = 2001
position_file = "/data/beamline/config/tmcm351.motorpos"

[[device]]
name = "pilatus"
kind = "pilatus"
host = "192.168.1.20"
port = 41234

[[motor]]
name = "Sample_X"
controller = "tmcm351"
axis = 0
role = "sample_x"

[[motor]]
name = "BeamStop_X"
controller = "tmcm351"
axis = 1
role = "beamstop_x"
privilege = "beamstop"
"#;

    #[test]
    fn minimal_bootstrap_parses_and_validates() {
        let bootstrap: Bootstrap = toml::from_str(MINIMAL).unwrap();
        bootstrap.validate().unwrap();
        assert_eq!(bootstrap.devices.len(), 2);
        let motors = bootstrap.motor_set().unwrap();
        assert_eq!(
            motors
                .by_role(MotorRole::BeamstopX)
                .map(|m| m.required_privilege),
            Some(Privilege::Beamstop)
        );
    }

    #[test]
    fn out_of_range_axis_is_rejected() {
        let text = MINIMAL.replace("axis = 1", "axis = 5");
        let bootstrap: Bootstrap = toml::from_str(&text).unwrap();
        assert!(matches!(
            bootstrap.validate(),
            Err(BootstrapError::ValidationError(_))
        ));
    }

    #[test]
    fn unknown_controller_is_rejected() {
        let text = MINIMAL.replace("controller = \"tmcm351\"\naxis = 0", "controller = \"nope\"\naxis = 0");
        let bootstrap: Bootstrap = toml::from_str(&text).unwrap();
        assert!(bootstrap.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = format!("{MINIMAL}\n[extra]\nfoo = 1\n");
        assert!(toml::from_str::<Bootstrap>(&text).is_err());
    }
}
