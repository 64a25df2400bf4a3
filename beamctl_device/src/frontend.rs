//! Device front-end handle.
//!
//! Lives on the event thread. Reads never block and never do I/O: they
//! come from a cache maintained by [`DeviceFrontend::poll`], which
//! drains the back-end's event queue. Writes and commands are enqueued
//! messages.

use std::collections::HashMap;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use beamctl_common::config::{ConfigKey, ConfigValue};
use beamctl_common::error::DeviceError;

use crate::message::{DeviceEvent, DeviceStatus, QueryTarget, Request};
use crate::variable::VarValue;
use crate::varname::VarName;

/// Front-end handle of one device.
pub struct DeviceFrontend {
    name: String,
    device_type: &'static str,
    to_back: Sender<Request>,
    from_back: Receiver<DeviceEvent>,
    cache: HashMap<VarName, VarValue>,
    status: DeviceStatus,
    connected: bool,
    ready: bool,
    last_error: Option<DeviceError>,
    backend: Option<JoinHandle<()>>,
    comm: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DeviceFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFrontend")
            .field("name", &self.name)
            .field("device_type", &self.device_type)
            .field("status", &self.status)
            .field("connected", &self.connected)
            .field("ready", &self.ready)
            .finish()
    }
}

impl DeviceFrontend {
    /// Wrap the queues and worker handles of a freshly launched device.
    pub fn new(
        name: impl Into<String>,
        device_type: &'static str,
        to_back: Sender<Request>,
        from_back: Receiver<DeviceEvent>,
        backend: JoinHandle<()>,
        comm: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            name: name.into(),
            device_type,
            to_back,
            from_back,
            cache: HashMap::new(),
            status: DeviceStatus::Initializing,
            connected: true,
            ready: false,
            last_error: None,
            backend: Some(backend),
            comm: Some(comm).flatten(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> &'static str {
        self.device_type
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether startup completed (all urgent variables valid).
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.last_error.as_ref()
    }

    // ─── Cache reads (never block, never do I/O) ───────────────────

    pub fn get(&self, name: &VarName) -> Option<&VarValue> {
        self.cache.get(name)
    }

    pub fn get_f64(&self, name: &VarName) -> Option<f64> {
        self.get(name).and_then(VarValue::as_f64)
    }

    pub fn get_i64(&self, name: &VarName) -> Option<i64> {
        self.get(name).and_then(VarValue::as_i64)
    }

    pub fn get_bool(&self, name: &VarName) -> Option<bool> {
        self.get(name).and_then(VarValue::as_bool)
    }

    pub fn get_str(&self, name: &VarName) -> Option<&str> {
        self.get(name).and_then(VarValue::as_str)
    }

    /// Names of every variable seen so far.
    pub fn keys(&self) -> Vec<&VarName> {
        let mut keys: Vec<&VarName> = self.cache.keys().collect();
        keys.sort();
        keys
    }

    // ─── Queued writes ─────────────────────────────────────────────

    fn send(&self, request: Request) -> Result<(), DeviceError> {
        self.to_back
            .send(request)
            .map_err(|_| DeviceError::NotConnected)
    }

    /// Write a variable; the confirmation arrives as a later
    /// `VariableChanged` triggered by the follow-up query.
    pub fn set(&self, name: VarName, value: VarValue) -> Result<(), DeviceError> {
        self.send(Request::Set {
            name: name.clone(),
            value,
        })?;
        self.send(Request::Query {
            target: QueryTarget::One(name),
            signal_needed: true,
        })
    }

    /// Request a refresh of one variable.
    pub fn refresh(&self, name: VarName, signal_needed: bool) -> Result<(), DeviceError> {
        self.send(Request::Query {
            target: QueryTarget::One(name),
            signal_needed,
        })
    }

    /// Refresh every variable due for an update.
    pub fn refresh_all(&self) -> Result<(), DeviceError> {
        self.send(Request::Query {
            target: QueryTarget::All,
            signal_needed: false,
        })
    }

    /// Execute a device command; the reply arrives as a
    /// [`DeviceEvent::CommandResult`].
    pub fn issue_command(
        &self,
        command: &str,
        args: Vec<VarValue>,
    ) -> Result<(), DeviceError> {
        self.send(Request::Execute {
            command: command.to_string(),
            args,
        })
    }

    /// Push a configuration snapshot to the back-end.
    pub fn send_config(
        &self,
        snapshot: Vec<(ConfigKey, ConfigValue)>,
    ) -> Result<(), DeviceError> {
        self.send(Request::Config(snapshot))
    }

    pub fn request_telemetry(&self) -> Result<(), DeviceError> {
        self.send(Request::Telemetry)
    }

    // ─── Event pump ────────────────────────────────────────────────

    /// Drain the back-end queue, apply cache updates and return the
    /// events for dispatch to observers. Called periodically on the
    /// event thread; events arrive in the order the back-end pushed
    /// them.
    pub fn poll(&mut self) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.from_back.try_recv() {
            match &event {
                DeviceEvent::VariableChanged { name, value } => {
                    if name.base() == "__status__" {
                        if let Some(s) = value.as_str() {
                            self.status = DeviceStatus::parse(s);
                        }
                    }
                    self.cache.insert(name.clone(), value.clone());
                }
                DeviceEvent::StartupDone => {
                    self.ready = true;
                }
                DeviceEvent::WatchdogTimeout(error) | DeviceEvent::BackendDied(error) => {
                    self.last_error = Some(error.clone());
                    self.mark_disconnected();
                }
                DeviceEvent::Log { message } => {
                    tracing::info!(device = %self.name, "{message}");
                }
                _ => {}
            }
            events.push(event);
        }
        events
    }

    /// Drop every cached value and declare the device disconnected.
    fn mark_disconnected(&mut self) {
        self.cache.clear();
        self.connected = false;
        self.ready = false;
        self.status = DeviceStatus::Disconnected;
        self.cache.insert(
            VarName::plain("__status__"),
            VarValue::Str(DeviceStatus::Disconnected.as_str().to_string()),
        );
    }

    /// Orderly shutdown: ask the back-end to exit and join the workers.
    pub fn shutdown(&mut self) {
        let _ = self.to_back.send(Request::Exit);
        if let Some(handle) = self.backend.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.comm.take() {
            let _ = handle.join();
        }
        self.mark_disconnected();
    }
}

impl Drop for DeviceFrontend {
    fn drop(&mut self) {
        let _ = self.to_back.send(Request::Exit);
    }
}
