//! Transmission measurement of two samples against an empty-beam
//! reference, end to end over simulated devices.

mod common;

use std::time::{Duration, Instant};

use common::{motion_rig, run_modbus, run_pilatus, run_tmcm};

use beamctl_common::ckey;
use beamctl_common::sample::{Measured, Sample, SampleCategory};
use beamctl_core::manager::{DeviceKind, DeviceSpec};
use beamctl_core::motor::{Motor, MotorRole};
use beamctl_core::orchestrator::transmission::{
    SampleOrdering, TransmissionRequest,
};
use beamctl_device::modbus::ModbusServerImage;
use beamctl_device::transport::channel_pair;

#[test]
fn transmissions_are_measured_and_stored() {
    let mut rig = motion_rig();

    // Second controller carrying the beamstop axes.
    let (bs_transport, bs_peer) = channel_pair();
    let posfile = rig.dir.path().join("tmcm351b.motorpos");
    beamctl_device::backends::trinamic::write_position_file(
        &posfile,
        &[(0.0, -5.0, 50.0), (0.0, -5.0, 50.0), (0.0, -5.0, 50.0)],
    )
    .unwrap();
    rig.instrument
        .devices
        .add_with_transport(
            DeviceSpec {
                name: "tmcm351b".to_string(),
                kind: DeviceKind::Tmcm351,
                host: "sim".to_string(),
                port: 0,
                position_file: Some(posfile),
                log_format: None,
                log_file: None,
            },
            Box::new(bs_transport),
        )
        .unwrap();
    let bs_controller = run_tmcm(bs_peer);
    let mut bsx = Motor::new("BeamStop_X", "tmcm351b", 0);
    bsx.role = Some(MotorRole::BeamstopX);
    rig.instrument.motors.add(bsx).unwrap();
    let mut bsy = Motor::new("BeamStop_Y", "tmcm351b", 1);
    bsy.role = Some(MotorRole::BeamstopY);
    rig.instrument.motors.add(bsy).unwrap();

    // Detector: dark 10, empty 1000, then 600 and 300 counts.
    let (det_transport, det_peer) = channel_pair();
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
            Box::new(det_transport),
        )
        .unwrap();
    let detector = run_pilatus(det_peer, vec![10, 1000, 600, 300]);

    // X-ray source with a controllable shutter coil.
    let (src_transport, src_peer) = channel_pair();
    rig.instrument
        .devices
        .add_with_transport(
            DeviceSpec {
                name: "genix".to_string(),
                kind: DeviceKind::Genix,
                host: "sim".to_string(),
                port: 0,
                position_file: None,
                log_format: None,
                log_file: None,
            },
            Box::new(src_transport),
        )
        .unwrap();
    let source = run_modbus(src_peer, ModbusServerImage::new(8, 4));

    rig.instrument
        .devices
        .wait_all_ready(Duration::from_secs(10))
        .unwrap();

    // Beamstop positions and the samples.
    for (key, value) in [
        (ckey!["beamstop", "out", "x"], 20.0),
        (ckey!["beamstop", "out", "y"], 20.0),
        (ckey!["beamstop", "in", "x"], 0.5),
        (ckey!["beamstop", "in", "y"], 0.5),
    ] {
        rig.instrument.config.insert(key, value);
    }
    let mut eb = Sample::new("EB");
    eb.category = SampleCategory::EmptyBeam;
    rig.instrument
        .samples
        .add_sample(eb, &mut rig.instrument.config)
        .unwrap();
    for (title, x) in [("S1", 5.0), ("S2", 10.0)] {
        let mut sample = Sample::new(title);
        sample.positionx = Measured::exact(x);
        sample.transmission = Measured::exact(1.0);
        rig.instrument
            .samples
            .add_sample(sample, &mut rig.instrument.config)
            .unwrap();
    }

    rig.instrument
        .start_transmission(TransmissionRequest {
            samples: vec!["S1".to_string(), "S2".to_string()],
            empty_sample: "EB".to_string(),
            exptime: 0.05,
            nimages: 1,
            delay: 0.003,
            lazy: false,
            ordering: SampleOrdering::Title,
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(60);
    while rig.instrument.transmission_running() {
        assert!(Instant::now() < deadline, "transmission never finished");
        rig.instrument.tick();
        std::thread::sleep(Duration::from_millis(5));
    }

    // T = (I_s − I_d) / (I_e − I_d)
    let t1 = rig.instrument.samples.get("S1").unwrap().transmission;
    let t2 = rig.instrument.samples.get("S2").unwrap().transmission;
    assert!((t1.val - (600.0 - 10.0) / (1000.0 - 10.0)).abs() < 1e-9, "T1 = {}", t1.val);
    assert!((t2.val - (300.0 - 10.0) / (1000.0 - 10.0)).abs() < 1e-9, "T2 = {}", t2.val);
    assert!(t1.err > 0.0 && t2.err > 0.0, "errors must be propagated");

    // The beamstop ended up back in.
    let bsx_pos = rig
        .instrument
        .motors
        .get("BeamStop_X")
        .unwrap()
        .position(&rig.instrument.devices)
        .unwrap();
    assert!((bsx_pos - 0.5).abs() < 1e-3, "beamstop X at {bsx_pos}");

    // The shutter is closed again.
    let shutter = rig
        .instrument
        .devices
        .source()
        .unwrap()
        .get_bool(&"shutter".into());
    assert_eq!(shutter, Some(false));

    rig.instrument.shutdown();
    rig.controller.join().unwrap();
    bs_controller.join().unwrap();
    detector.join().unwrap();
    source.join().unwrap();
}
