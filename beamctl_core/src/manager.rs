//! Device registry and lifecycle.
//!
//! Maps instance names to device front-ends, constructs and launches
//! the worker threads for every supported device kind, replays saved
//! connection parameters on reconnect and provides the fleet-level
//! operations (poll, telemetry sweep, panic stop).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use serde::Deserialize;

use beamctl_common::config::{Config, ConfigKey};
use beamctl_common::error::DeviceError;
use beamctl_device::backend::{BackendOptions, DeviceProcedure, spawn_backend};
use beamctl_device::backends::genix::GenixBackend;
use beamctl_device::backends::illumination::IlluminationBackend;
use beamctl_device::backends::pilatus::PilatusBackend;
use beamctl_device::backends::pump::PumpBackend;
use beamctl_device::backends::thermostat::ThermostatBackend;
use beamctl_device::backends::trinamic::{TMCM351, TMCM6110, TrinamicBackend};
use beamctl_device::backends::vacuum::VacuumGaugeBackend;
use beamctl_device::frontend::DeviceFrontend;
use beamctl_device::message::DeviceEvent;
use beamctl_device::modbus::ModbusClient;
use beamctl_device::transport::{TcpTransport, Transport, spawn_comm_worker};
use beamctl_device::variable::VarValue;

/// Supported device kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Tmcm351,
    Tmcm6110,
    Pilatus,
    Genix,
    VacuumGauge,
    Thermostat,
    PeristalticPump,
    Illumination,
}

impl DeviceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tmcm351 => "tmcm351",
            Self::Tmcm6110 => "tmcm6110",
            Self::Pilatus => "pilatus",
            Self::Genix => "genix",
            Self::VacuumGauge => "vacuumgauge",
            Self::Thermostat => "thermostat",
            Self::PeristalticPump => "peristalticpump",
            Self::Illumination => "illumination",
        }
    }

    /// Axis count for motor controllers.
    pub const fn axes(self) -> Option<u8> {
        match self {
            Self::Tmcm351 => Some(3),
            Self::Tmcm6110 => Some(6),
            _ => None,
        }
    }

    /// Kinds talking Modbus rather than a framed byte stream.
    const fn is_modbus(self) -> bool {
        matches!(self, Self::Genix | Self::PeristalticPump)
    }
}

/// Saved connection parameters of one device; replayed on reconnect.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub host: String,
    pub port: u16,
    /// Motor position file (motor controllers only).
    #[serde(default)]
    pub position_file: Option<PathBuf>,
    /// Value log template, written by the back-end once per poll.
    #[serde(default)]
    pub log_format: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// The device registry.
#[derive(Debug, Default)]
pub struct DeviceManager {
    devices: HashMap<String, DeviceFrontend>,
    specs: HashMap<String, DeviceSpec>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct, connect and launch a device from its spec.
    pub fn add(&mut self, spec: DeviceSpec) -> Result<(), DeviceError> {
        let transport = TcpTransport::connect(
            &spec.host,
            spec.port,
            Duration::from_secs(3),
        )?;
        self.add_with_transport(spec, Box::new(transport))
    }

    /// As [`add`](Self::add) with an externally supplied transport
    /// (simulators, tests).
    pub fn add_with_transport(
        &mut self,
        spec: DeviceSpec,
        transport: Box<dyn Transport>,
    ) -> Result<(), DeviceError> {
        if self.devices.contains_key(&spec.name) {
            return Err(DeviceError::Device(format!(
                "device {} already registered",
                spec.name
            )));
        }
        let options = BackendOptions {
            log_file: spec.log_file.clone(),
            log_format: spec.log_format.clone(),
            ..BackendOptions::default()
        };
        let frontend = match spec.kind {
            DeviceKind::Tmcm351 | DeviceKind::Tmcm6110 => {
                let model = if spec.kind == DeviceKind::Tmcm351 {
                    TMCM351
                } else {
                    TMCM6110
                };
                let position_file = spec.position_file.clone().ok_or_else(|| {
                    DeviceError::Device(format!(
                        "device {}: motor controllers need a position_file",
                        spec.name
                    ))
                })?;
                let backend = TrinamicBackend::new(model, position_file)?;
                launch_framed(&spec.name, backend, transport, options)
            }
            DeviceKind::Pilatus => {
                launch_framed(&spec.name, PilatusBackend::new(), transport, options)
            }
            DeviceKind::VacuumGauge => {
                launch_framed(&spec.name, VacuumGaugeBackend::new(), transport, options)
            }
            DeviceKind::Thermostat => {
                launch_framed(&spec.name, ThermostatBackend::new(), transport, options)
            }
            DeviceKind::Illumination => {
                launch_framed(&spec.name, IlluminationBackend::new(), transport, options)
            }
            DeviceKind::Genix => {
                let client = ModbusClient::new(transport, 1, Duration::from_secs(1));
                launch_direct(&spec.name, GenixBackend::new(client), options)
            }
            DeviceKind::PeristalticPump => {
                let client = ModbusClient::new(transport, 1, Duration::from_secs(1));
                launch_direct(&spec.name, PumpBackend::new(client), options)
            }
        };
        tracing::info!(device = %spec.name, kind = spec.kind.as_str(), "device launched");
        self.devices.insert(spec.name.clone(), frontend);
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Stop the workers and forget the device (the spec is kept so a
    /// later `add` with the same name is a fresh connect).
    pub fn remove(&mut self, name: &str) -> Result<(), DeviceError> {
        let mut frontend = self
            .devices
            .remove(name)
            .ok_or_else(|| DeviceError::NoSuchDevice(name.to_string()))?;
        frontend.shutdown();
        self.specs.remove(name);
        Ok(())
    }

    /// Tear the device down and replay its saved connection
    /// parameters. Idempotent on repeated failures: the spec survives.
    pub fn reconnect(&mut self, name: &str) -> Result<(), DeviceError> {
        let spec = self
            .specs
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::NoSuchDevice(name.to_string()))?;
        if let Some(mut frontend) = self.devices.remove(name) {
            frontend.shutdown();
        }
        self.specs.remove(name);
        self.add(spec)
    }

    pub fn get(&self, name: &str) -> Option<&DeviceFrontend> {
        self.devices.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DeviceFrontend> {
        self.devices.get_mut(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.devices.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn spec(&self, name: &str) -> Option<&DeviceSpec> {
        self.specs.get(name)
    }

    fn unique_of_kinds(&self, kinds: &[DeviceKind], what: &str) -> Result<&DeviceFrontend, DeviceError> {
        let mut found: Vec<&str> = Vec::new();
        for (name, spec) in &self.specs {
            if kinds.contains(&spec.kind) {
                found.push(name);
            }
        }
        match found.as_slice() {
            [name] => self
                .devices
                .get(*name)
                .ok_or_else(|| DeviceError::NoSuchDevice((*name).to_string())),
            [] => Err(DeviceError::NoSuchDevice(format!("no {what} registered"))),
            _ => Err(DeviceError::Device(format!(
                "more than one {what} registered"
            ))),
        }
    }

    /// The unique X-ray source.
    pub fn source(&self) -> Result<&DeviceFrontend, DeviceError> {
        self.unique_of_kinds(&[DeviceKind::Genix], "X-ray source")
    }

    /// The unique detector.
    pub fn detector(&self) -> Result<&DeviceFrontend, DeviceError> {
        self.unique_of_kinds(&[DeviceKind::Pilatus], "detector")
    }

    /// The unique vacuum gauge.
    pub fn vacuum(&self) -> Result<&DeviceFrontend, DeviceError> {
        self.unique_of_kinds(&[DeviceKind::VacuumGauge], "vacuum gauge")
    }

    /// The unique thermostat.
    pub fn temperature(&self) -> Result<&DeviceFrontend, DeviceError> {
        self.unique_of_kinds(&[DeviceKind::Thermostat], "thermostat")
    }

    /// The unique peristaltic pump.
    pub fn peristaltic_pump(&self) -> Result<&DeviceFrontend, DeviceError> {
        self.unique_of_kinds(&[DeviceKind::PeristalticPump], "peristaltic pump")
    }

    /// The unique illumination source.
    pub fn illumination(&self) -> Result<&DeviceFrontend, DeviceError> {
        self.unique_of_kinds(&[DeviceKind::Illumination], "illumination source")
    }

    /// Drain every device's event queue. Event order per device is the
    /// order the back-end pushed them.
    pub fn poll_all(&mut self) -> Vec<(String, DeviceEvent)> {
        let mut out = Vec::new();
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort_unstable();
        for name in names {
            if let Some(frontend) = self.devices.get_mut(&name) {
                for event in frontend.poll() {
                    out.push((name.clone(), event));
                }
            }
        }
        out
    }

    /// Ask every back-end for its resource statistics.
    pub fn request_telemetry(&self) {
        for frontend in self.devices.values() {
            let _ = frontend.request_telemetry();
        }
    }

    /// Push the current configuration snapshot to every back-end.
    pub fn broadcast_config(&self, config: &Config) {
        let snapshot = config.items_under(&ConfigKey::root());
        for frontend in self.devices.values() {
            let _ = frontend.send_config(snapshot.clone());
        }
    }

    /// Fleet-wide emergency stop: stop every motor axis and close the
    /// shutter. Devices stay connected.
    pub fn panic_stop(&self) {
        for (name, spec) in &self.specs {
            if let Some(axes) = spec.kind.axes() {
                if let Some(frontend) = self.devices.get(name) {
                    for axis in 0..axes {
                        let _ = frontend
                            .issue_command("stop", vec![VarValue::Int(i64::from(axis))]);
                    }
                }
            }
        }
        if let Ok(source) = self.source() {
            let _ = source.issue_command("shutter", vec![VarValue::Bool(false)]);
        }
        tracing::warn!("panic: all motors stopped, shutter closed");
    }

    /// Wait (polling) until every registered device reports
    /// StartupDone. Events drained while waiting are discarded; callers
    /// attach observers afterwards.
    pub fn wait_all_ready(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll_all();
            let pending: Vec<&str> = self
                .devices
                .iter()
                .filter(|(_, f)| !f.is_ready())
                .map(|(n, _)| n.as_str())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Device(format!(
                    "devices not ready: {}",
                    pending.join(", ")
                )));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Orderly shutdown of every device.
    pub fn shutdown_all(&mut self) {
        for (_, frontend) in self.devices.iter_mut() {
            frontend.shutdown();
        }
        self.devices.clear();
    }
}

fn launch_framed<P: DeviceProcedure>(
    name: &str,
    procedure: P,
    transport: Box<dyn Transport>,
    options: BackendOptions,
) -> DeviceFrontend {
    let device_type = procedure.device_type();
    let (to_back_tx, to_back_rx) = unbounded();
    let (to_front_tx, to_front_rx) = unbounded();
    let (wire_tx, wire_rx) = unbounded();
    let comm = spawn_comm_worker(
        name,
        transport,
        wire_rx,
        to_back_tx.clone(),
        Duration::from_millis(20),
    );
    let backend = spawn_backend(name, procedure, Some(wire_tx), to_back_rx, to_front_tx, options);
    DeviceFrontend::new(name, device_type, to_back_tx, to_front_rx, backend, Some(comm))
}

fn launch_direct<P: DeviceProcedure>(
    name: &str,
    procedure: P,
    options: BackendOptions,
) -> DeviceFrontend {
    let device_type = procedure.device_type();
    let (to_back_tx, to_back_rx) = unbounded();
    let (to_front_tx, to_front_rx) = unbounded();
    let backend = spawn_backend(name, procedure, None, to_back_rx, to_front_tx, options);
    DeviceFrontend::new(name, device_type, to_back_tx, to_front_rx, backend, None)
}
