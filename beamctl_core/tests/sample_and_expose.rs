//! End-to-end sample switching and exposures driven from scripts.

mod common;

use std::time::Duration;

use common::{motion_rig, run_pilatus, run_to_completion};

use beamctl_common::sample::{Measured, Sample};
use beamctl_core::manager::{DeviceKind, DeviceSpec};
use beamctl_core::script::expr::ScriptValue;
use beamctl_device::transport::channel_pair;

#[test]
fn the_sample_command_drives_x_then_y_and_selects_the_sample() {
    let mut rig = motion_rig();
    rig.instrument
        .devices
        .wait_all_ready(Duration::from_secs(10))
        .unwrap();
    let mut sample = Sample::new("GC36");
    sample.positionx = Measured::exact(12.5);
    sample.positiony = Measured::exact(-3.25);
    rig.instrument
        .samples
        .add_sample(sample, &mut rig.instrument.config)
        .unwrap();

    rig.instrument.run_script("sample('GC36')\n").unwrap();
    let (_, finish) = run_to_completion(&mut rig.instrument, Duration::from_secs(20));
    let (success, message) = finish.expect("script must terminate");
    assert!(success, "sample move failed: {message}");
    assert_eq!(rig.instrument.samples.current_title(), Some("GC36"));
    let x = rig
        .instrument
        .motors
        .get("Sample_X")
        .unwrap()
        .position(&rig.instrument.devices)
        .unwrap();
    let y = rig
        .instrument
        .motors
        .get("Sample_Y")
        .unwrap()
        .position(&rig.instrument.devices)
        .unwrap();
    assert!((x - 12.5).abs() < 1e-3, "X ended at {x}");
    assert!((y + 3.25).abs() < 1e-3, "Y ended at {y}");
    rig.instrument.shutdown();
    rig.controller.join().unwrap();
}

#[test]
fn exposemulti_waits_for_every_image() {
    let mut rig = motion_rig();
    let (transport, peer) = channel_pair();
    rig.instrument
        .devices
        .add_with_transport(
            DeviceSpec {
                name: "pilatus".to_string(),
                kind: DeviceKind::Pilatus,
                host: "sim".to_string(),
                port: 0,
                position_file: None,
                log_format: None,
                log_file: None,
            },
            Box::new(transport),
        )
        .unwrap();
    let detector = run_pilatus(peer, Vec::new());
    rig.instrument
        .devices
        .wait_all_ready(Duration::from_secs(10))
        .unwrap();

    rig.instrument
        .run_script("exposemulti(0.1, 2, 'tst')\n")
        .unwrap();
    let (_, finish) = run_to_completion(&mut rig.instrument, Duration::from_secs(20));
    let (success, message) = finish.expect("script must terminate");
    assert!(success, "exposure failed: {message}");
    assert_eq!(
        rig.instrument.interpreter.namespace().get("_"),
        Some(&ScriptValue::Bool(true))
    );
    // The image directory of the prefix was created.
    assert!(rig.dir.path().join("images").join("tst").is_dir());
    rig.instrument.shutdown();
    rig.controller.join().unwrap();
    detector.join().unwrap();
}
