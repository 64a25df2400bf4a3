//! Generic device back-end worker.
//!
//! The back-end owns the variable table and all protocol state. Its
//! main loop receives requests with a poll-interval timeout; an empty
//! timeout triggers the periodic work: startup-done detection, the
//! watchdog check, automatic queries of due variables and the optional
//! value log line.
//!
//! Device specifics live behind [`DeviceProcedure`]; the runner is the
//! same for every device.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use beamctl_common::config::{ConfigKey, ConfigValue};
use beamctl_common::error::DeviceError;

use crate::message::{DeviceEvent, DeviceStatus, QueryTarget, Request, Telemetry};
use crate::variable::{VarSpec, VarValue, Variable};
use crate::varname::VarName;

/// Device-specific half of a back-end.
///
/// Implementations translate between the uniform variable/command model
/// and the device's wire protocol. All hooks run on the back-end worker
/// thread and may do blocking I/O.
pub trait DeviceProcedure: Send + 'static {
    /// Short type tag, e.g. `"tmcm351"`.
    fn device_type(&self) -> &'static str;

    /// The full variable table of the device.
    fn variables(&self) -> Vec<VarSpec>;

    /// Initiate a (possibly asynchronous) refresh of one variable.
    fn query(&mut self, io: &mut BackendIo, name: &VarName) -> Result<(), DeviceError>;

    /// Write one variable on the device.
    fn set(
        &mut self,
        io: &mut BackendIo,
        name: &VarName,
        value: &VarValue,
    ) -> Result<(), DeviceError> {
        let _ = (io, value);
        Err(DeviceError::UnknownVariable(name.to_string()))
    }

    /// Execute a device command. Completion is reported through
    /// [`BackendIo::command_finished`] / [`BackendIo::command_failed`].
    fn execute(
        &mut self,
        io: &mut BackendIo,
        command: &str,
        args: &[VarValue],
    ) -> Result<(), DeviceError>;

    /// Interpret one inbound frame. For paired protocols `sent` is the
    /// outbound message this frame answers.
    fn interpret(
        &mut self,
        io: &mut BackendIo,
        frame: &[u8],
        sent: Option<&[u8]>,
    ) -> Result<(), DeviceError> {
        let _ = (io, frame, sent);
        Ok(())
    }

    /// Cut complete frames off the receive buffer. The default treats
    /// every chunk as one frame.
    fn split_frames(&self, buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
        if buffer.is_empty() {
            Vec::new()
        } else {
            vec![std::mem::take(buffer)]
        }
    }

    /// Called once when every urgent variable has a valid value.
    fn on_variables_ready(&mut self, io: &mut BackendIo) -> Result<(), DeviceError> {
        let _ = io;
        Ok(())
    }
}

/// Tunables of the back-end worker.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Queue receive timeout; the period of the idle work.
    pub poll_interval: Duration,
    /// Declare the device lost after this much inbound silence.
    pub watchdog_timeout: Duration,
    /// Optional value log file.
    pub log_file: Option<PathBuf>,
    /// Log line template with `{variable}` placeholders.
    pub log_format: Option<String>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            watchdog_timeout: Duration::from_secs(10),
            log_file: None,
            log_format: None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    queries: u64,
    sent: u64,
    received: u64,
}

/// The back-end's handle on its own state, passed to every procedure
/// hook. Owns the variable table, the send FIFO and the event queue.
pub struct BackendIo {
    name: String,
    vars: HashMap<VarName, Variable>,
    to_front: Sender<DeviceEvent>,
    wire: Option<Sender<Vec<u8>>>,
    sent_fifo: VecDeque<Vec<u8>>,
    status: DeviceStatus,
    watchdog_alive: bool,
    last_inbound: Instant,
    started_at: Instant,
    startup_done: bool,
    counters: Counters,
    config: Vec<(ConfigKey, ConfigValue)>,
    front_gone: bool,
}

impl BackendIo {
    fn new(
        name: &str,
        specs: Vec<VarSpec>,
        to_front: Sender<DeviceEvent>,
        wire: Option<Sender<Vec<u8>>>,
    ) -> Self {
        let mut vars = HashMap::new();
        for spec in specs {
            vars.insert(spec.name.clone(), Variable::new(spec));
        }
        for builtin in ["__status__", "__auxstatus__"] {
            let name = VarName::plain(builtin);
            vars.entry(name.clone())
                .or_insert_with(|| Variable::new(VarSpec::new(name)));
        }
        Self {
            name: name.to_string(),
            vars,
            to_front,
            wire,
            sent_fifo: VecDeque::new(),
            status: DeviceStatus::Initializing,
            watchdog_alive: true,
            last_inbound: Instant::now(),
            started_at: Instant::now(),
            startup_done: false,
            counters: Counters::default(),
            config: Vec::new(),
            front_gone: false,
        }
    }

    /// Instance name of the device.
    pub fn device_name(&self) -> &str {
        &self.name
    }

    fn emit(&mut self, event: DeviceEvent) {
        if self.to_front.send(event).is_err() {
            self.front_gone = true;
        }
    }

    // ─── Variable table ────────────────────────────────────────────

    pub fn var(&self, name: &VarName) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn value(&self, name: &VarName) -> Option<&VarValue> {
        self.vars.get(name).and_then(Variable::value)
    }

    pub fn f64_of(&self, name: &VarName) -> Option<f64> {
        self.value(name).and_then(VarValue::as_f64)
    }

    pub fn i64_of(&self, name: &VarName) -> Option<i64> {
        self.value(name).and_then(VarValue::as_i64)
    }

    pub fn bool_of(&self, name: &VarName) -> Option<bool> {
        self.value(name).and_then(VarValue::as_bool)
    }

    pub fn str_of(&self, name: &VarName) -> Option<&str> {
        self.value(name).and_then(VarValue::as_str)
    }

    pub fn var_names(&self) -> impl Iterator<Item = &VarName> {
        self.vars.keys()
    }

    /// The only way the cache is mutated: always advances the
    /// timestamp, emits a change event unless the value is unchanged
    /// with no signal outstanding.
    pub fn update(&mut self, name: &VarName, value: impl Into<VarValue>) -> bool {
        self.update_inner(name, value.into(), false)
    }

    /// As [`update`](Self::update) but always emits.
    pub fn update_forced(&mut self, name: &VarName, value: impl Into<VarValue>) -> bool {
        self.update_inner(name, value.into(), true)
    }

    fn update_inner(&mut self, name: &VarName, value: VarValue, force: bool) -> bool {
        // Any observed life sign also feeds the watchdog; Modbus-style
        // synchronous back-ends have no Incoming messages.
        self.last_inbound = Instant::now();
        let Some(var) = self.vars.get_mut(name) else {
            tracing::warn!(device = %self.name, variable = %name, "update of unknown variable");
            return false;
        };
        let emit = var.apply_update(value.clone(), force, Instant::now());
        if emit {
            self.emit(DeviceEvent::VariableChanged {
                name: name.clone(),
                value,
            });
        }
        emit
    }

    /// Report a per-variable failure without disconnecting.
    pub fn variable_error(&mut self, name: &VarName, error: DeviceError) {
        self.emit(DeviceEvent::VariableError {
            name: name.clone(),
            error,
        });
    }

    /// Raise the automatic query rate of one variable.
    pub fn boost_query_interval(&mut self, name: &VarName, interval: Duration) {
        if let Some(var) = self.vars.get_mut(name) {
            var.boost_timeout(interval);
        }
    }

    /// Restore the declared automatic query rate of one variable.
    pub fn reset_query_interval(&mut self, name: &VarName) {
        if let Some(var) = self.vars.get_mut(name) {
            var.reset_timeout();
        }
    }

    // ─── Status ────────────────────────────────────────────────────

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
        let name = VarName::plain("__status__");
        self.update(&name, status.as_str());
    }

    pub fn set_auxstatus(&mut self, auxstatus: impl Into<String>) {
        let name = VarName::plain("__auxstatus__");
        self.update(&name, auxstatus.into());
    }

    // ─── Outbound wire ─────────────────────────────────────────────

    /// Queue a message on the one-in-flight FIFO; it is physically sent
    /// once every earlier message has been answered.
    pub fn send_paired(&mut self, message: Vec<u8>) -> Result<(), DeviceError> {
        self.sent_fifo.push_back(message);
        if self.sent_fifo.len() == 1 {
            let head = self.sent_fifo.front().cloned().unwrap_or_default();
            self.send_wire(head)?;
        }
        Ok(())
    }

    /// Send immediately, bypassing the pairing FIFO (protocols that do
    /// not need request/reply matching).
    pub fn send_direct(&mut self, message: Vec<u8>) -> Result<(), DeviceError> {
        self.send_wire(message)
    }

    fn send_wire(&mut self, message: Vec<u8>) -> Result<(), DeviceError> {
        let Some(wire) = self.wire.as_ref() else {
            return Err(DeviceError::Communication(
                "device has no outbound transport".to_string(),
            ));
        };
        wire.send(message).map_err(|_| {
            DeviceError::Communication("communication worker is gone".to_string())
        })?;
        self.counters.sent += 1;
        Ok(())
    }

    /// The outbound message the next inbound frame answers.
    pub fn pending_sent(&self) -> Option<&[u8]> {
        self.sent_fifo.front().map(Vec::as_slice)
    }

    /// Declare the pending request answered: dequeue it and physically
    /// send the next queued message, keeping the wire one-in-flight.
    ///
    /// Procedures call this from `interpret` for every frame that
    /// answers the pending request; unsolicited frames (asynchronous
    /// notifications) leave the FIFO alone.
    pub fn complete_pending_sent(&mut self) -> Result<(), DeviceError> {
        self.sent_fifo.pop_front();
        if let Some(next) = self.sent_fifo.front().cloned() {
            self.send_wire(next)?;
        }
        Ok(())
    }

    // ─── Command results, watchdog, logging ────────────────────────

    pub fn command_finished(&mut self, command: &str, message: impl Into<String>) {
        self.emit(DeviceEvent::CommandResult {
            success: true,
            command: command.to_string(),
            message: message.into(),
        });
    }

    pub fn command_failed(&mut self, command: &str, message: impl Into<String>) {
        self.emit(DeviceEvent::CommandResult {
            success: false,
            command: command.to_string(),
            message: message.into(),
        });
    }

    /// Pause inactivity checking, e.g. during a long exposure when the
    /// device is legitimately silent.
    pub fn suppress_watchdog(&mut self) {
        self.watchdog_alive = false;
    }

    /// Resume inactivity checking.
    pub fn release_watchdog(&mut self) {
        self.last_inbound = Instant::now();
        self.watchdog_alive = true;
    }

    /// Forward a log line to the front-end observers.
    pub fn log(&mut self, message: impl Into<String>) {
        self.emit(DeviceEvent::Log {
            message: message.into(),
        });
    }

    // ─── Configuration snapshot ────────────────────────────────────

    pub fn config_value(&self, key: &ConfigKey) -> Option<&ConfigValue> {
        self.config
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn telemetry(&self) -> Telemetry {
        Telemetry {
            uptime: self.started_at.elapsed(),
            messages_sent: self.counters.sent,
            messages_received: self.counters.received,
            queries: self.counters.queries,
            outstanding_sent: self.sent_fifo.len(),
            last_inbound_age: Some(self.last_inbound.elapsed()),
        }
    }
}

/// Spawn the back-end worker thread for a device.
///
/// `wire` is the outbound byte sink towards the communication worker;
/// procedures owning their transport (Modbus) pass `None`.
pub fn spawn_backend<P: DeviceProcedure>(
    name: &str,
    procedure: P,
    wire: Option<Sender<Vec<u8>>>,
    requests: Receiver<Request>,
    events: Sender<DeviceEvent>,
    options: BackendOptions,
) -> std::thread::JoinHandle<()> {
    let thread_name = format!("backend-{name}");
    let name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_backend(&name, procedure, wire, requests, events, options))
        .expect("spawning a backend thread cannot fail")
}

fn run_backend<P: DeviceProcedure>(
    name: &str,
    mut proc: P,
    wire: Option<Sender<Vec<u8>>>,
    requests: Receiver<Request>,
    events: Sender<DeviceEvent>,
    options: BackendOptions,
) {
    let mut io = BackendIo::new(name, proc.variables(), events, wire);
    io.set_status(DeviceStatus::Initializing);
    let mut rx_buffer: Vec<u8> = Vec::new();
    tracing::debug!(device = name, kind = proc.device_type(), "backend started");

    loop {
        if io.front_gone {
            break;
        }
        let request = match requests.recv_timeout(options.poll_interval) {
            Ok(request) => Some(request),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let outcome = match request {
            None => on_idle(&mut proc, &mut io, &options),
            Some(request) => on_request(&mut proc, &mut io, &options, &mut rx_buffer, request),
        };
        match outcome {
            Flow::Continue => {}
            Flow::Exit => break,
            Flow::Fatal(error) => {
                tracing::error!(device = name, %error, "backend lost the device");
                io.emit(DeviceEvent::BackendDied(error));
                break;
            }
        }
    }
    tracing::debug!(
        device = name,
        sent = io.counters.sent,
        received = io.counters.received,
        "backend worker ending"
    );
}

enum Flow {
    Continue,
    Exit,
    Fatal(DeviceError),
}

/// Classify a procedure error: communication failures are fatal,
/// everything else is reported per-variable.
fn soft_or_fatal(io: &mut BackendIo, name: &VarName, error: DeviceError) -> Flow {
    match error {
        DeviceError::Communication(_) => Flow::Fatal(error),
        other => {
            io.variable_error(name, other);
            Flow::Continue
        }
    }
}

fn on_idle<P: DeviceProcedure>(
    proc: &mut P,
    io: &mut BackendIo,
    options: &BackendOptions,
) -> Flow {
    // 1. Startup detection over the urgent set.
    if !io.startup_done {
        let ready = io
            .vars
            .values()
            .filter(|v| v.spec().urgent)
            .all(Variable::has_valid_value);
        if ready {
            io.startup_done = true;
            if let Err(error) = proc.on_variables_ready(io) {
                return soft_or_fatal(io, &VarName::plain("__status__"), error);
            }
            io.emit(DeviceEvent::StartupDone);
        }
    }

    // 2. Watchdog.
    if io.watchdog_alive && io.last_inbound.elapsed() > options.watchdog_timeout {
        let error = DeviceError::WatchdogTimeout(io.last_inbound.elapsed().as_secs_f64());
        tracing::error!(device = %io.name, %error, "watchdog fired");
        io.emit(DeviceEvent::WatchdogTimeout(error));
        return Flow::Exit;
    }

    // 3. Automatic queries of due variables, urgent first.
    if let Flow::Fatal(error) = query_due(proc, io) {
        return Flow::Fatal(error);
    }

    // 4. Value log line.
    if let (Some(path), Some(format)) = (&options.log_file, &options.log_format) {
        write_log_line(io, path, format);
    }

    Flow::Continue
}

fn query_due<P: DeviceProcedure>(proc: &mut P, io: &mut BackendIo) -> Flow {
    let now = Instant::now();
    let mut due: Vec<(bool, VarName)> = io
        .vars
        .values()
        .filter(|v| v.is_due(now))
        .map(|v| (v.spec().urgent, v.name().clone()))
        .collect();
    due.sort_by_key(|(urgent, name)| (!urgent, name.clone()));
    for (_, name) in due {
        if let Some(var) = io.vars.get_mut(&name) {
            var.mark_queried(now);
        }
        io.counters.queries += 1;
        if let Err(error) = proc.query(io, &name) {
            if let Flow::Fatal(error) = soft_or_fatal(io, &name, error) {
                return Flow::Fatal(error);
            }
        }
    }
    Flow::Continue
}

fn on_request<P: DeviceProcedure>(
    proc: &mut P,
    io: &mut BackendIo,
    options: &BackendOptions,
    rx_buffer: &mut Vec<u8>,
    request: Request,
) -> Flow {
    match request {
        Request::Query {
            target: QueryTarget::One(name),
            signal_needed,
        } => {
            if signal_needed {
                if let Some(var) = io.vars.get_mut(&name) {
                    var.add_pending_signal();
                }
            }
            if let Some(var) = io.vars.get_mut(&name) {
                var.mark_queried(Instant::now());
            }
            io.counters.queries += 1;
            match proc.query(io, &name) {
                Ok(()) => Flow::Continue,
                Err(error) => soft_or_fatal(io, &name, error),
            }
        }
        Request::Query {
            target: QueryTarget::All,
            ..
        } => query_due(proc, io),
        Request::Set { name, value } => match proc.set(io, &name, &value) {
            Ok(()) => Flow::Continue,
            Err(error) => soft_or_fatal(io, &name, error),
        },
        Request::Execute { command, args } => match proc.execute(io, &command, &args) {
            Ok(()) => Flow::Continue,
            Err(DeviceError::Communication(message)) => {
                Flow::Fatal(DeviceError::Communication(message))
            }
            Err(error) => {
                io.command_failed(&command, error.to_string());
                Flow::Continue
            }
        },
        Request::Config(snapshot) => {
            io.config = snapshot;
            // Configuration changes may unblock the idle work.
            on_idle(proc, io, options)
        }
        Request::Telemetry => {
            let telemetry = io.telemetry();
            io.emit(DeviceEvent::Telemetry(telemetry));
            Flow::Continue
        }
        Request::Exit => Flow::Exit,
        Request::Incoming(bytes) => {
            io.counters.received += 1;
            io.last_inbound = Instant::now();
            rx_buffer.extend_from_slice(&bytes);
            for frame in proc.split_frames(rx_buffer) {
                let sent = io.pending_sent().map(<[u8]>::to_vec);
                if let Err(error) = proc.interpret(io, &frame, sent.as_deref()) {
                    if let Flow::Fatal(error) =
                        soft_or_fatal(io, &VarName::plain("__status__"), error)
                    {
                        return Flow::Fatal(error);
                    }
                }
            }
            Flow::Continue
        }
        Request::CommError(message) => Flow::Fatal(DeviceError::Communication(message)),
    }
}

/// Render the value log template and append one line to the log file.
fn write_log_line(io: &BackendIo, path: &std::path::Path, format: &str) {
    let mut line = String::new();
    let mut rest = format;
    while let Some(open) = rest.find('{') {
        line.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            rest = &rest[open..];
            break;
        };
        let name: VarName = rest[open + 1..open + close].into();
        match io.value(&name) {
            Some(value) => line.push_str(&value.to_string()),
            None => line.push('?'),
        }
        rest = &rest[open + close + 1..];
    }
    line.push_str(rest);
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let record = format!("{stamp:.3}\t{line}\n");
    if let Err(error) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, record.as_bytes()))
    {
        tracing::warn!(device = %io.name, %error, "cannot write device log line");
    }
}
