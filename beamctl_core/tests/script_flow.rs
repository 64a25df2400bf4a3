//! Interpreter behavior without any devices: labels, subroutines,
//! flags, the shared namespace and the failure modes.

mod common;

use std::time::Duration;

use common::{motion_rig, run_to_completion};

use beamctl_common::accounting::Accounting;
use beamctl_common::config::Config;
use beamctl_common::error::ScriptError;
use beamctl_core::calibrants::CalibrantStore;
use beamctl_core::exposer::Exposer;
use beamctl_core::instrument::Instrument;
use beamctl_core::manager::DeviceManager;
use beamctl_core::motor::MotorSet;
use beamctl_core::samples::SampleStore;
use beamctl_core::script::expr::ScriptValue;
use beamctl_core::script::interpreter::InterpreterEvent;

fn bare_instrument() -> (Instrument, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let instrument = Instrument::new(
        Config::new(),
        Accounting::in_memory(),
        DeviceManager::new(),
        MotorSet::new(),
        SampleStore::new(),
        CalibrantStore::new(),
        Exposer::new(dir.path().join("images"), 5),
        dir.path().join("scan"),
    );
    (instrument, dir)
}

#[test]
fn gosub_and_return_follow_the_call_stack() {
    let (mut instrument, _dir) = bare_instrument();
    instrument
        .run_script(
            "@start\n\
             sleep(0.01)\n\
             gosub(\"sub\")\n\
             end\n\
             @sub\n\
             sleep(0.01)\n\
             return\n",
        )
        .unwrap();
    let (events, finish) = run_to_completion(&mut instrument, Duration::from_secs(5));
    assert_eq!(finish, Some((true, String::new())));
    let visited: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            InterpreterEvent::Advance(line) => Some(*line),
            _ => None,
        })
        .collect();
    // @start, sleep, gosub, @sub, sleep, return; the end line finishes
    // the script without being announced.
    assert_eq!(visited, vec![0, 1, 2, 4, 5, 6]);
}

#[test]
fn the_result_variable_flows_between_commands() {
    let (mut instrument, _dir) = bare_instrument();
    instrument
        .run_script("set('x', 17)\nset('y', _ + 3)\nset('z', y * 2)\n")
        .unwrap();
    let (_, finish) = run_to_completion(&mut instrument, Duration::from_secs(5));
    assert_eq!(finish, Some((true, String::new())));
    let ns = instrument.interpreter.namespace();
    assert_eq!(ns.get("x"), Some(&ScriptValue::Int(17)));
    assert_eq!(ns.get("y"), Some(&ScriptValue::Int(20)));
    assert_eq!(ns.get("z"), Some(&ScriptValue::Int(40)));
}

#[test]
fn flags_are_shared_between_commands() {
    let (mut instrument, _dir) = bare_instrument();
    instrument
        .run_script("newflag('armed')\nsetflag('armed')\nnewflag('cold')\n")
        .unwrap();
    let (_, finish) = run_to_completion(&mut instrument, Duration::from_secs(5));
    assert_eq!(finish, Some((true, String::new())));
    assert_eq!(instrument.interpreter.flags.get("armed"), Some(true));
    assert_eq!(instrument.interpreter.flags.get("cold"), Some(false));
}

#[test]
fn a_missing_label_fails_the_script_deterministically() {
    let (mut instrument, _dir) = bare_instrument();
    instrument.run_script("goto(\"nowhere\")\nend\n").unwrap();
    let (_, finish) = run_to_completion(&mut instrument, Duration::from_secs(5));
    let (success, message) = finish.expect("script must terminate");
    assert!(!success);
    assert!(message.contains("does not exist"), "message: {message}");
}

#[test]
fn duplicate_labels_fail_the_jump() {
    let (mut instrument, _dir) = bare_instrument();
    instrument
        .run_script("@twice\n@twice\ngoto(\"twice\")\n")
        .unwrap();
    let (_, finish) = run_to_completion(&mut instrument, Duration::from_secs(5));
    let (success, message) = finish.expect("script must terminate");
    assert!(!success);
    assert!(message.contains("more than one"), "message: {message}");
}

#[test]
fn return_with_an_empty_call_stack_fails_clearly() {
    let (mut instrument, _dir) = bare_instrument();
    instrument.run_script("return\n").unwrap();
    let (_, finish) = run_to_completion(&mut instrument, Duration::from_secs(5));
    let (success, message) = finish.expect("script must terminate");
    assert!(!success);
    assert!(message.contains("call stack is empty"), "message: {message}");
}

#[test]
fn unknown_commands_are_parse_errors_with_line_numbers() {
    let (mut instrument, _dir) = bare_instrument();
    let error = instrument
        .run_script("sleep(0.1)\nfrobnicate(1)\n")
        .unwrap_err();
    assert_eq!(
        error,
        ScriptError::UnknownCommand {
            line: 2,
            name: "frobnicate".to_string()
        }
    );
}

#[test]
fn comments_and_blank_lines_are_no_ops() {
    let (mut instrument, _dir) = bare_instrument();
    instrument
        .run_script("# a header comment\n\nset('x', 1)  # trailing comment\n\n")
        .unwrap();
    let (_, finish) = run_to_completion(&mut instrument, Duration::from_secs(5));
    assert_eq!(finish, Some((true, String::new())));
    assert_eq!(
        instrument.interpreter.namespace().get("x"),
        Some(&ScriptValue::Int(1))
    );
}

#[test]
fn stopping_a_running_script_fails_it() {
    let (mut instrument, _dir) = bare_instrument();
    instrument.run_script("sleep(30)\n").unwrap();
    // Let the sleep start.
    instrument.tick();
    assert!(instrument.interpreter.is_running());
    instrument.panic();
    assert!(!instrument.interpreter.is_running());
}

#[test]
fn a_device_move_runs_end_to_end_from_a_script() {
    let mut rig = motion_rig();
    rig.instrument
        .devices
        .wait_all_ready(Duration::from_secs(10))
        .unwrap();
    rig.instrument
        .run_script("moveto('Sample_X', 12.0)\nwhere('Sample_X')\n")
        .unwrap();
    let (_, finish) = run_to_completion(&mut rig.instrument, Duration::from_secs(20));
    let (success, message) = finish.expect("script must terminate");
    assert!(success, "script failed: {message}");
    let position = rig
        .instrument
        .interpreter
        .namespace()
        .get("_")
        .and_then(ScriptValue::as_f64)
        .expect("where() leaves the position in _");
    assert!((position - 12.0).abs() < 1e-3, "ended at {position}");
    rig.instrument.shutdown();
    rig.controller.join().unwrap();
}

#[test]
fn moveto_where_is_a_zero_move() {
    let mut rig = motion_rig();
    rig.instrument
        .devices
        .wait_all_ready(Duration::from_secs(10))
        .unwrap();
    rig.instrument
        .run_script("where('PH1_X')\nmoveto('PH1_X', _)\n")
        .unwrap();
    let (_, finish) = run_to_completion(&mut rig.instrument, Duration::from_secs(20));
    let (success, message) = finish.expect("script must terminate");
    assert!(success, "zero move failed: {message}");
    rig.instrument.shutdown();
    rig.controller.join().unwrap();
}
