//! Shared rig for core integration tests: an instrument wired to a
//! simulated TMCM controller over an in-process transport.
#![allow(dead_code)] // not every test binary uses every helper

use std::thread;
use std::time::{Duration, Instant};

use beamctl_common::accounting::Accounting;
use beamctl_common::config::Config;
use beamctl_core::calibrants::CalibrantStore;
use beamctl_core::exposer::Exposer;
use beamctl_core::instrument::Instrument;
use beamctl_core::manager::{DeviceKind, DeviceManager, DeviceSpec};
use beamctl_core::motor::{Motor, MotorRole, MotorSet};
use beamctl_core::samples::SampleStore;
use beamctl_core::script::interpreter::InterpreterEvent;
use beamctl_device::backends::trinamic::write_position_file;
use beamctl_device::tmcl::{self, axis_param, instruction};
use beamctl_device::transport::{TransportPeer, channel_pair};

/// A 3-axis TMCM simulator: answers GAP/SAP/MVP/Stop, moving one axis
/// towards its target over a few position polls.
pub fn run_tmcm(peer: TransportPeer) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        struct Axis {
            actual: i32,
            target: i32,
            speed: i32,
            reached: bool,
            polls_left: i32,
        }
        let mut axes: Vec<Axis> = (0..3)
            .map(|_| Axis {
                actual: 0,
                target: 0,
                speed: 0,
                reached: true,
                polls_left: 0,
            })
            .collect();
        while let Ok(frame) = peer.outbound.recv() {
            if frame.len() != 9 {
                continue;
            }
            let command = frame[1];
            let parameter = frame[2];
            let motor = frame[3] as usize;
            let value = i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
            let reply = match command {
                instruction::GET_FIRMWARE_VERSION => {
                    tmcl::pack_reply(100, command, (351 << 16) | 0x0142)
                }
                instruction::SET_AXIS_PARAMETER => {
                    match parameter {
                        axis_param::ACTUAL_POSITION => axes[motor].actual = value,
                        axis_param::TARGET_POSITION => axes[motor].target = value,
                        _ => {}
                    }
                    tmcl::pack_reply(100, command, value)
                }
                instruction::MOVE_TO => {
                    let axis = &mut axes[motor];
                    axis.target = if frame[2] == 1 {
                        axis.actual + value
                    } else {
                        value
                    };
                    axis.reached = false;
                    axis.speed = if axis.target < axis.actual { -800 } else { 800 };
                    axis.polls_left = 2;
                    tmcl::pack_reply(100, command, value)
                }
                instruction::STOP => {
                    axes[motor].speed = 0;
                    axes[motor].polls_left = 0;
                    tmcl::pack_reply(100, command, 0)
                }
                instruction::GET_AXIS_PARAMETER => {
                    let axis = &mut axes[motor];
                    let value = match parameter {
                        axis_param::ACTUAL_POSITION => {
                            if axis.speed != 0 {
                                if axis.polls_left > 0 {
                                    axis.polls_left -= 1;
                                    axis.actual += (axis.target - axis.actual) / 3;
                                } else {
                                    axis.actual = axis.target;
                                    axis.speed = 0;
                                    axis.reached = true;
                                }
                            }
                            axis.actual
                        }
                        axis_param::TARGET_POSITION => axis.target,
                        axis_param::ACTUAL_SPEED | axis_param::TARGET_SPEED => axis.speed,
                        axis_param::TARGET_POSITION_REACHED => i32::from(axis.reached),
                        axis_param::LEFT_LIMIT_SWITCH_STATUS
                        | axis_param::RIGHT_LIMIT_SWITCH_STATUS => 0,
                        axis_param::LEFT_LIMIT_SWITCH_DISABLE
                        | axis_param::RIGHT_LIMIT_SWITCH_DISABLE => 0,
                        axis_param::PULSE_DIVISOR => 5,
                        axis_param::RAMP_DIVISOR => 7,
                        axis_param::MICROSTEP_RESOLUTION => 6,
                        axis_param::MAX_POSITIONING_SPEED => 1000,
                        axis_param::MAX_ACCELERATION => 500,
                        axis_param::ABSOLUTE_MAX_CURRENT => 128,
                        axis_param::STANDBY_CURRENT => 32,
                        axis_param::FREEWHEELING_DELAY => 100,
                        _ => 0,
                    };
                    tmcl::pack_reply(100, command, value)
                }
                _ => tmcl::pack_reply(2, command, 0),
            };
            if peer.inbound.send(reply.to_vec()).is_err() {
                break;
            }
        }
    })
}

/// A minimal camserver: acknowledges settings and sends one code-7
/// line per image once the exposure time has passed. `series_counts`
/// gives the base counts of each exposure series in order; series
/// beyond the list report 1000 counts.
pub fn run_pilatus(peer: TransportPeer, series_counts: Vec<i64>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut exptime = 1.0f64;
        let mut nimages = 1i64;
        let mut period = 1.003f64;
        let mut series = 0usize;
        let mut pending: Option<(Instant, String, i64)> = None;
        loop {
            match peer.outbound.recv_timeout(Duration::from_millis(10)) {
                Ok(request) => {
                    let line = String::from_utf8_lossy(&request);
                    let line = line.trim();
                    let mut words = line.split_whitespace();
                    let reply = match words.next() {
                        Some("version") => "24 OK tvx 7.3.13".to_string(),
                        Some("exptime") => {
                            if let Some(v) = words.next().and_then(|w| w.parse().ok()) {
                                exptime = v;
                            }
                            format!("15 OK exptime {exptime:.6}")
                        }
                        Some("expperiod") => {
                            if let Some(v) = words.next().and_then(|w| w.parse().ok()) {
                                period = v;
                            }
                            format!("15 OK expperiod {period:.6}")
                        }
                        Some("nimages") => {
                            if let Some(v) = words.next().and_then(|w| w.parse().ok()) {
                                nimages = v;
                            }
                            format!("15 OK nimages {nimages}")
                        }
                        Some("setthreshold") => match words.next() {
                            None => "15 OK threshold 4425 gain mid".to_string(),
                            Some(gain) => {
                                let threshold = words.next().unwrap_or("4425").to_string();
                                let gain = gain.trim_end_matches('g');
                                format!("15 OK threshold {threshold} gain {gain}")
                            }
                        },
                        Some("exposure") => {
                            let filename = words.next().unwrap_or("image.cbf");
                            pending = Some((
                                Instant::now()
                                    + Duration::from_secs_f64(period * nimages as f64),
                                filename.to_string(),
                                nimages,
                            ));
                            format!("15 OK starting exposure {filename}")
                        }
                        Some("k") => {
                            pending = None;
                            "13 OK stopped exposure".to_string()
                        }
                        _ => "15 ERR unknown request".to_string(),
                    };
                    if peer.inbound.send(format!("{reply}\n").into_bytes()).is_err() {
                        return;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
            if let Some((deadline, filename, count)) = &pending {
                if Instant::now() >= *deadline {
                    let base = series_counts.get(series).copied().unwrap_or(1000);
                    for i in 0..*count {
                        let line = format!("7 OK {filename} {}\n", base + i);
                        if peer.inbound.send(line.into_bytes()).is_err() {
                            return;
                        }
                    }
                    series += 1;
                    pending = None;
                }
            }
        }
    })
}

/// Answer Modbus requests from a coil/register image until the peer
/// hangs up.
pub fn run_modbus(
    peer: TransportPeer,
    mut image: beamctl_device::modbus::ModbusServerImage,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(request) = peer.outbound.recv() {
            if let Some(response) = image.answer(&request) {
                if peer.inbound.send(response).is_err() {
                    break;
                }
            }
        }
    })
}

/// An instrument with one simulated TMCM351 and three named motors.
pub struct Rig {
    pub instrument: Instrument,
    pub controller: thread::JoinHandle<()>,
    pub dir: tempfile::TempDir,
}

pub fn motion_rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let posfile = dir.path().join("tmcm351.motorpos");
    write_position_file(
        &posfile,
        &[(0.0, -50.0, 50.0), (0.0, -50.0, 50.0), (0.0, -50.0, 50.0)],
    )
    .unwrap();
    let mut devices = DeviceManager::new();
    let (transport, peer) = channel_pair();
    devices
        .add_with_transport(
            DeviceSpec {
                name: "tmcm351".to_string(),
                kind: DeviceKind::Tmcm351,
                host: "sim".to_string(),
                port: 0,
                position_file: Some(posfile),
                log_format: None,
                log_file: None,
            },
            Box::new(transport),
        )
        .unwrap();
    let controller = run_tmcm(peer);
    let mut motors = MotorSet::new();
    let mut x = Motor::new("Sample_X", "tmcm351", 0);
    x.role = Some(MotorRole::SampleX);
    motors.add(x).unwrap();
    let mut y = Motor::new("Sample_Y", "tmcm351", 1);
    y.role = Some(MotorRole::SampleY);
    motors.add(y).unwrap();
    motors.add(Motor::new("PH1_X", "tmcm351", 2)).unwrap();
    let instrument = Instrument::new(
        Config::new(),
        Accounting::in_memory(),
        devices,
        motors,
        SampleStore::new(),
        CalibrantStore::new(),
        Exposer::new(dir.path().join("images"), 5),
        dir.path().join("scan"),
    );
    Rig {
        instrument,
        controller,
        dir,
    }
}

/// Tick the instrument until the script finishes or the timeout hits.
pub fn run_to_completion(
    instrument: &mut Instrument,
    timeout: Duration,
) -> (Vec<InterpreterEvent>, Option<(bool, String)>) {
    let deadline = Instant::now() + timeout;
    let mut all = Vec::new();
    while Instant::now() < deadline {
        for event in instrument.tick() {
            let finish = match &event {
                InterpreterEvent::Finished { success, message } => {
                    Some((*success, message.clone()))
                }
                _ => None,
            };
            all.push(event);
            if let Some(finish) = finish {
                return (all, Some(finish));
            }
        }
        thread::sleep(Duration::from_millis(5));
    }
    (all, None)
}
