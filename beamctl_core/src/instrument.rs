//! The instrument: everything the event thread owns, and the periodic
//! pump translating device events into high-level signals.
//!
//! One `tick()` drains every device queue, derives motor / exposure /
//! sample signals, feeds the orchestrators and the interpreter, honors
//! pending scan requests and runs the debounced config autosave.

use std::path::PathBuf;
use std::time::Instant;

use beamctl_common::accounting::Accounting;
use beamctl_common::config::Config;
use beamctl_common::error::{CommandError, ScriptError};

use crate::calibrants::CalibrantStore;
use crate::exposer::Exposer;
use crate::manager::DeviceManager;
use crate::motor::MotorSet;
use crate::orchestrator::scan::{ScanRequest, ScanTask};
use crate::orchestrator::transmission::{TransmissionRequest, TransmissionTask};
use crate::samples::SampleStore;
use crate::script::interpreter::{Interpreter, InterpreterEvent};
use crate::signal::Signal;

/// Mutable access to the instrument state, handed to commands and
/// orchestrators for the duration of one dispatch.
pub struct InstrumentCtx<'a> {
    pub devices: &'a mut DeviceManager,
    pub motors: &'a mut MotorSet,
    pub samples: &'a mut SampleStore,
    pub calibrants: &'a mut CalibrantStore,
    pub exposer: &'a mut Exposer,
    pub accounting: &'a mut Accounting,
    pub config: &'a mut Config,
    pub scan_request: &'a mut Option<ScanRequest>,
}

/// The top-level instrument state.
pub struct Instrument {
    pub config: Config,
    pub accounting: Accounting,
    pub devices: DeviceManager,
    pub motors: MotorSet,
    pub samples: SampleStore,
    pub calibrants: CalibrantStore,
    pub exposer: Exposer,
    pub interpreter: Interpreter,
    scan_dir: PathBuf,
    scan: Option<ScanTask>,
    scan_request: Option<ScanRequest>,
    transmission: Option<TransmissionTask>,
}

impl Instrument {
    pub fn new(
        config: Config,
        accounting: Accounting,
        devices: DeviceManager,
        motors: MotorSet,
        samples: SampleStore,
        calibrants: CalibrantStore,
        exposer: Exposer,
        scan_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            accounting,
            devices,
            motors,
            samples,
            calibrants,
            exposer,
            interpreter: Interpreter::new(),
            scan_dir: scan_dir.into(),
            scan: None,
            scan_request: None,
            transmission: None,
        }
    }

    /// Parse and start a script.
    pub fn run_script(&mut self, text: &str) -> Result<Vec<InterpreterEvent>, ScriptError> {
        self.interpreter.parse(text)?;
        self.interpreter.start()
    }

    /// Begin a transmission measurement.
    pub fn start_transmission(
        &mut self,
        request: TransmissionRequest,
    ) -> Result<(), CommandError> {
        if self.transmission.is_some() {
            return Err(CommandError::Precondition(
                "a transmission measurement is already running".to_string(),
            ));
        }
        let Self {
            config,
            accounting,
            devices,
            motors,
            samples,
            calibrants,
            exposer,
            scan_request,
            ..
        } = self;
        let mut ix = InstrumentCtx {
            devices,
            motors,
            samples,
            calibrants,
            exposer,
            accounting,
            config,
            scan_request,
        };
        let (task, signals) = TransmissionTask::start(&mut ix, request)?;
        self.transmission = Some(task);
        for signal in signals {
            tracing::info!(?signal, "transmission");
        }
        Ok(())
    }

    pub fn transmission_running(&self) -> bool {
        self.transmission.is_some()
    }

    pub fn scan_running(&self) -> bool {
        self.scan.is_some()
    }

    /// One pass of the event pump. Returns the interpreter events of
    /// this tick for the caller's UI.
    pub fn tick(&mut self) -> Vec<InterpreterEvent> {
        let Self {
            config,
            accounting,
            devices,
            motors,
            samples,
            calibrants,
            exposer,
            interpreter,
            scan_dir,
            scan,
            scan_request,
            transmission,
        } = self;

        // 1. Drain the device queues and derive the high-level signals.
        let detector_name = devices.detector().map(|f| f.name().to_string()).ok();
        let device_events = devices.poll_all();
        let mut signals: Vec<Signal> = Vec::new();
        for (device, event) in device_events {
            if let Some(frontend) = devices.get(&device) {
                if let Some(motion) = motors.translate(&device, frontend, &event) {
                    // Stage moves feed the sample store first.
                    for sample_signal in
                        samples.on_motor_signal(devices, motors, accounting, &motion)
                    {
                        signals.push(Signal::Sample(sample_signal));
                    }
                    signals.push(Signal::Motor(motion));
                }
            }
            if Some(&device) == detector_name.as_ref() {
                for exposure in exposer.on_detector_event(&event) {
                    signals.push(Signal::Exposure(exposure));
                }
            }
            signals.push(Signal::Device { device, event });
        }
        for exposure in exposer.tick() {
            signals.push(Signal::Exposure(exposure));
        }

        let mut ix = InstrumentCtx {
            devices,
            motors,
            samples,
            calibrants,
            exposer,
            accounting,
            config,
            scan_request,
        };

        // 2. Orchestrators see the signals and may add their own.
        if let Some(task) = scan.as_mut() {
            let mut produced = Vec::new();
            for signal in &signals {
                produced.extend(task.on_signal(&mut ix, signal));
            }
            signals.extend(produced.into_iter().map(Signal::Scan));
            if task.is_done() {
                *scan = None;
            }
        }
        if let Some(task) = transmission.as_mut() {
            let mut produced = Vec::new();
            for signal in &signals {
                produced.extend(task.on_signal(&mut ix, signal));
            }
            signals.extend(produced.into_iter().map(Signal::Transmission));
            if task.is_done() {
                *transmission = None;
            }
        }

        // 3. The interpreter sees everything, then gets its tick.
        let mut events = Vec::new();
        for signal in &signals {
            events.extend(interpreter.on_signal(&mut ix, signal));
        }
        events.extend(interpreter.tick(&mut ix));

        // 4. Act on a scan request raised by a command.
        match ix.scan_request.take() {
            Some(ScanRequest::Start(params)) => {
                if scan.is_some() {
                    events.extend(interpreter.on_signal(
                        &mut ix,
                        &Signal::Scan(crate::orchestrator::scan::ScanSignal::Finished {
                            success: false,
                            index: 0,
                            message: "a scan is already running".to_string(),
                        }),
                    ));
                } else {
                    match ScanTask::start(&mut ix, scan_dir.clone(), params) {
                        Ok((task, produced)) => {
                            *scan = Some(task);
                            for signal in produced {
                                events.extend(
                                    interpreter.on_signal(&mut ix, &Signal::Scan(signal)),
                                );
                            }
                        }
                        Err(error) => {
                            events.extend(interpreter.on_signal(
                                &mut ix,
                                &Signal::Scan(
                                    crate::orchestrator::scan::ScanSignal::Finished {
                                        success: false,
                                        index: 0,
                                        message: error.to_string(),
                                    },
                                ),
                            ));
                        }
                    }
                }
            }
            Some(ScanRequest::Stop) => {
                if let Some(task) = scan.as_mut() {
                    let produced = task.stop(&mut ix);
                    for signal in produced {
                        events.extend(interpreter.on_signal(&mut ix, &Signal::Scan(signal)));
                    }
                    *scan = None;
                }
            }
            None => {}
        }

        // 5. Debounced config autosave.
        if let Err(error) = config.tick(Instant::now()) {
            tracing::error!(%error, "config autosave failed");
        }

        events
    }

    /// Fleet-wide emergency stop: cancels the script and the
    /// orchestrators, stops every motor and closes the shutter.
    /// Devices remain connected.
    pub fn panic(&mut self) {
        tracing::warn!("panic requested");
        let Self {
            config,
            accounting,
            devices,
            motors,
            samples,
            calibrants,
            exposer,
            interpreter,
            scan,
            scan_request,
            transmission,
            ..
        } = self;
        let mut ix = InstrumentCtx {
            devices,
            motors,
            samples,
            calibrants,
            exposer,
            accounting,
            config,
            scan_request,
        };
        if interpreter.is_running() {
            let _ = interpreter.stop(&mut ix);
        }
        if let Some(task) = scan.as_mut() {
            task.stop(&mut ix);
        }
        *scan = None;
        if let Some(task) = transmission.as_mut() {
            task.stop(&mut ix);
        }
        *transmission = None;
        samples.panic(devices, motors);
        devices.panic_stop();
    }

    /// Orderly shutdown: persist state and stop every worker.
    pub fn shutdown(&mut self) {
        self.samples.save_to_config(&mut self.config);
        self.calibrants.save_to_config(&mut self.config);
        if self.config.is_dirty() {
            if let Err(error) = self.config.save() {
                tracing::error!(%error, "cannot save the configuration on shutdown");
            }
        }
        self.devices.shutdown_all();
    }
}
