//! Motion behavior of the TMCM back-end against a scripted controller
//! simulator: zero moves, soft-limit rejection, target-reached and
//! end-switch stop detection.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use common::{launch, wait_for};

use beamctl_device::backend::BackendOptions;
use beamctl_device::backends::trinamic::{TMCM351, TrinamicBackend, write_position_file};
use beamctl_device::message::DeviceEvent;
use beamctl_device::tmcl::{self, axis_param, instruction};
use beamctl_device::transport::TransportPeer;
use beamctl_device::variable::VarValue;
use beamctl_device::varname::VarName;

/// How the simulated controller behaves once a MoveTo arrives.
#[derive(Clone, Copy, PartialEq)]
enum MotionScript {
    /// Travel for a few position polls, then reach the target.
    ReachTarget,
    /// Travel, then hit the left end switch halfway.
    HitLeftSwitch,
}

struct SimAxis {
    actual: i32,
    target: i32,
    speed: i32,
    reached: bool,
    left_switch: bool,
    polls_left: i32,
}

/// A minimal TMCM-351: GAP/SAP/MVP/Stop/firmware, one moving axis.
fn run_controller(
    peer: TransportPeer,
    script: MotionScript,
    moveto_frames: Arc<AtomicUsize>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut axes: Vec<SimAxis> = (0..3)
            .map(|_| SimAxis {
                actual: 0,
                target: 0,
                speed: 0,
                reached: true,
                left_switch: false,
                polls_left: 0,
            })
            .collect();
        // pulse divisor, ramp divisor, microstep resolution
        let mut divisors = [[5i32, 7, 6], [5, 7, 6], [5, 7, 6]];
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
                        axis_param::PULSE_DIVISOR => divisors[motor][0] = value,
                        axis_param::RAMP_DIVISOR => divisors[motor][1] = value,
                        axis_param::MICROSTEP_RESOLUTION => divisors[motor][2] = value,
                        _ => {}
                    }
                    tmcl::pack_reply(100, command, value)
                }
                instruction::MOVE_TO => {
                    moveto_frames.fetch_add(1, Ordering::SeqCst);
                    let axis = &mut axes[motor];
                    axis.target = if frame[2] == 1 {
                        axis.actual + value
                    } else {
                        value
                    };
                    axis.reached = false;
                    axis.speed = if axis.target < axis.actual { -800 } else { 800 };
                    axis.polls_left = 3;
                    tmcl::pack_reply(100, command, value)
                }
                instruction::STOP => {
                    let axis = &mut axes[motor];
                    axis.speed = 0;
                    axis.polls_left = 0;
                    tmcl::pack_reply(100, command, 0)
                }
                instruction::GET_AXIS_PARAMETER => {
                    let axis = &mut axes[motor];
                    let value = match parameter {
                        axis_param::ACTUAL_POSITION => {
                            // Advance the "physics" one poll at a time.
                            if axis.speed != 0 {
                                if axis.polls_left > 0 {
                                    axis.polls_left -= 1;
                                    axis.actual += (axis.target - axis.actual) / 4;
                                } else {
                                    match script {
                                        MotionScript::ReachTarget => {
                                            axis.actual = axis.target;
                                            axis.speed = 0;
                                            axis.reached = true;
                                        }
                                        MotionScript::HitLeftSwitch => {
                                            axis.speed = 0;
                                            axis.left_switch = true;
                                        }
                                    }
                                }
                            }
                            axis.actual
                        }
                        axis_param::TARGET_POSITION => axis.target,
                        axis_param::ACTUAL_SPEED => axis.speed,
                        axis_param::TARGET_SPEED => axis.speed,
                        axis_param::TARGET_POSITION_REACHED => i32::from(axis.reached),
                        axis_param::LEFT_LIMIT_SWITCH_STATUS => i32::from(axis.left_switch),
                        axis_param::RIGHT_LIMIT_SWITCH_STATUS => 0,
                        // Both end switches enabled (disable flag = 0).
                        axis_param::LEFT_LIMIT_SWITCH_DISABLE
                        | axis_param::RIGHT_LIMIT_SWITCH_DISABLE => 0,
                        axis_param::PULSE_DIVISOR => divisors[motor][0],
                        axis_param::RAMP_DIVISOR => divisors[motor][1],
                        axis_param::MICROSTEP_RESOLUTION => divisors[motor][2],
                        axis_param::MAX_POSITIONING_SPEED => 1000,
                        axis_param::MAX_ACCELERATION => 500,
                        axis_param::ABSOLUTE_MAX_CURRENT => 128,
                        axis_param::STANDBY_CURRENT => 32,
                        axis_param::ACTUAL_ACCELERATION => 0,
                        axis_param::ACTUAL_LOAD_VALUE => 17,
                        axis_param::DRIVER_ERROR_FLAGS => 0,
                        axis_param::RAMP_MODE => 0,
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

struct Rig {
    frontend: beamctl_device::frontend::DeviceFrontend,
    controller: thread::JoinHandle<()>,
    moveto_frames: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

/// Launch a TMCM351 whose axis 0 starts at 10.0 with limits (-5, 15).
fn rig(script: MotionScript) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let posfile = dir.path().join("tmcm351.motorpos");
    write_position_file(
        &posfile,
        &[(10.0, -5.0, 15.0), (0.0, -20.0, 20.0), (0.0, 0.0, 73.0)],
    )
    .unwrap();
    let backend = TrinamicBackend::new(TMCM351, &posfile).unwrap();
    let options = BackendOptions {
        poll_interval: Duration::from_millis(10),
        watchdog_timeout: Duration::from_secs(5),
        log_file: None,
        log_format: None,
    };
    let (frontend, peer) = launch("mot1", "tmcm351", backend, options);
    let moveto_frames = Arc::new(AtomicUsize::new(0));
    let controller = run_controller(peer, script, Arc::clone(&moveto_frames));
    Rig {
        frontend,
        controller,
        moveto_frames,
        _dir: dir,
    }
}

/// Wait for startup plus the calibration of axis 0 to its persisted
/// position (10.0).
fn wait_ready(rig: &mut Rig) {
    let (_, ready) = wait_for(&mut rig.frontend, Duration::from_secs(5), |event| {
        matches!(event, DeviceEvent::StartupDone)
    });
    assert!(ready, "controller never became ready");
    let name = VarName::per_axis("actualposition", 0);
    if rig
        .frontend
        .get_f64(&name)
        .is_some_and(|v| (v - 10.0).abs() < 1e-6)
    {
        return;
    }
    let (_, calibrated) = wait_for(&mut rig.frontend, Duration::from_secs(5), |event| {
        matches!(
            event,
            DeviceEvent::VariableChanged { name: n, value } if *n == name
                && value.as_f64().is_some_and(|v| (v - 10.0).abs() < 1e-6)
        )
    });
    assert!(calibrated, "calibration from the position file never landed");
}

#[test]
fn zero_move_completes_without_wire_traffic() {
    let mut rig = rig(MotionScript::ReachTarget);
    wait_ready(&mut rig);
    let current = rig
        .frontend
        .get_f64(&VarName::per_axis("actualposition", 0))
        .unwrap();
    let frames_before = rig.moveto_frames.load(Ordering::SeqCst);
    rig.frontend
        .issue_command("moveto", vec![VarValue::Int(0), VarValue::Float(current)])
        .unwrap();
    // The synthetic trace: moving=true, lastmovewassuccessful=true,
    // moving=false — and no MoveTo frame on the wire.
    let moving = VarName::per_axis("moving", 0);
    let lastmove = VarName::per_axis("lastmovewassuccessful", 0);
    let (events, done) = wait_for(&mut rig.frontend, Duration::from_secs(2), |event| {
        matches!(
            event,
            DeviceEvent::VariableChanged { name, value: VarValue::Bool(false) } if *name == moving
        )
    });
    assert!(done, "zero move never completed");
    let trace: Vec<(String, bool)> = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::VariableChanged {
                name,
                value: VarValue::Bool(b),
            } if *name == moving || *name == lastmove => Some((name.to_string(), *b)),
            _ => None,
        })
        .collect();
    assert_eq!(
        trace,
        vec![
            ("moving$0".to_string(), true),
            ("lastmovewassuccessful$0".to_string(), true),
            ("moving$0".to_string(), false),
        ]
    );
    assert_eq!(rig.moveto_frames.load(Ordering::SeqCst), frames_before);
    rig.frontend.shutdown();
    rig.controller.join().unwrap();
}

#[test]
fn target_outside_soft_limits_is_rejected_before_sending() {
    let mut rig = rig(MotionScript::ReachTarget);
    wait_ready(&mut rig);
    let frames_before = rig.moveto_frames.load(Ordering::SeqCst);
    rig.frontend
        .issue_command("moveto", vec![VarValue::Int(0), VarValue::Float(20.0)])
        .unwrap();
    let (events, failed) = wait_for(&mut rig.frontend, Duration::from_secs(2), |event| {
        matches!(
            event,
            DeviceEvent::CommandResult { success: false, command, .. } if command == "moveto"
        )
    });
    assert!(failed, "out-of-limits move was not rejected: {events:?}");
    let message = events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::CommandResult {
                success: false,
                message,
                ..
            } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(message.contains("software limits"), "message: {message}");
    assert_eq!(rig.moveto_frames.load(Ordering::SeqCst), frames_before);
    rig.frontend.shutdown();
    rig.controller.join().unwrap();
}

#[test]
fn successful_move_ends_on_target_reached() {
    let mut rig = rig(MotionScript::ReachTarget);
    wait_ready(&mut rig);
    rig.frontend
        .issue_command("moveto", vec![VarValue::Int(0), VarValue::Float(12.0)])
        .unwrap();
    let moving = VarName::per_axis("moving", 0);
    let (_, done) = wait_for(&mut rig.frontend, Duration::from_secs(10), |event| {
        matches!(
            event,
            DeviceEvent::VariableChanged { name, value: VarValue::Bool(false) } if *name == moving
        )
    });
    assert!(done, "motion never finished");
    assert_eq!(
        rig.frontend
            .get_bool(&VarName::per_axis("lastmovewassuccessful", 0)),
        Some(true)
    );
    let position = rig
        .frontend
        .get_f64(&VarName::per_axis("actualposition", 0))
        .unwrap();
    assert!((position - 12.0).abs() < 1e-3, "stopped at {position}");
    rig.frontend.shutdown();
    rig.controller.join().unwrap();
}

#[test]
fn end_switch_stops_the_motion_unsuccessfully() {
    let mut rig = rig(MotionScript::HitLeftSwitch);
    wait_ready(&mut rig);
    rig.frontend
        .issue_command("moverel", vec![VarValue::Int(0), VarValue::Float(-8.0)])
        .unwrap();
    let moving = VarName::per_axis("moving", 0);
    let (_, done) = wait_for(&mut rig.frontend, Duration::from_secs(10), |event| {
        matches!(
            event,
            DeviceEvent::VariableChanged { name, value: VarValue::Bool(false) } if *name == moving
        )
    });
    assert!(done, "motion never finished");
    assert_eq!(
        rig.frontend
            .get_bool(&VarName::per_axis("lastmovewassuccessful", 0)),
        Some(false)
    );
    assert_eq!(
        rig.frontend.get_str(&VarName::plain("__status__")),
        Some("Idle")
    );
    rig.frontend.shutdown();
    rig.controller.join().unwrap();
}

#[test]
fn stop_is_accepted_when_nothing_moves() {
    let mut rig = rig(MotionScript::ReachTarget);
    let (_, ready) = wait_for(&mut rig.frontend, Duration::from_secs(5), |event| {
        matches!(event, DeviceEvent::StartupDone)
    });
    assert!(ready);
    for _ in 0..2 {
        rig.frontend
            .issue_command("stop", vec![VarValue::Int(0)])
            .unwrap();
        let (_, accepted) = wait_for(&mut rig.frontend, Duration::from_secs(2), |event| {
            matches!(
                event,
                DeviceEvent::CommandResult { success: true, command, .. } if command == "stop"
            )
        });
        assert!(accepted, "stop of an idle motor must be accepted");
    }
    rig.frontend.shutdown();
    rig.controller.join().unwrap();
}
