//! Behavior of the generic back-end runner, exercised through the
//! vacuum gauge procedure and an in-process gauge simulator.

mod common;

use std::thread;
use std::time::Duration;

use common::{launch, wait_for};

use beamctl_device::backend::BackendOptions;
use beamctl_device::backends::vacuum::{VacuumGaugeBackend, encode_pressure};
use beamctl_device::message::{DeviceEvent, DeviceStatus};
use beamctl_device::transport::TransportPeer;
use beamctl_device::varname::VarName;

/// Frame a reply stem with the gauge's modulo-64 checksum.
fn gauge_frame(stem: &[u8]) -> Vec<u8> {
    let checksum = stem.iter().fold(0u32, |acc, b| acc + u32::from(*b)) % 64 + 64;
    let mut out = stem.to_vec();
    out.push(checksum as u8);
    out.push(b'\r');
    out
}

/// Answer gauge queries with a fixed pressure until the peer is
/// dropped.
fn run_gauge(peer: TransportPeer, pressure: f64) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(request) = peer.outbound.recv() {
            let reply = match request.get(3) {
                Some(b'M') => encode_pressure(pressure),
                Some(b'T') => gauge_frame(b"001TTPG300"),
                Some(b'U') => gauge_frame(b"001U mbar"),
                _ => continue,
            };
            if peer.inbound.send(reply).is_err() {
                break;
            }
        }
    })
}

fn fast_options() -> BackendOptions {
    BackendOptions {
        poll_interval: Duration::from_millis(10),
        watchdog_timeout: Duration::from_secs(5),
        log_file: None,
        log_format: None,
    }
}

#[test]
fn startup_completes_once_urgent_variables_are_valid() {
    let (mut frontend, peer) =
        launch("vac1", "vacuumgauge", VacuumGaugeBackend::new(), fast_options());
    let gauge = run_gauge(peer, 0.02);
    let (_, ready) = wait_for(&mut frontend, Duration::from_secs(2), |event| {
        matches!(event, DeviceEvent::StartupDone)
    });
    assert!(ready, "StartupDone never arrived");
    assert!(frontend.is_ready());
    assert_eq!(frontend.status(), DeviceStatus::Idle);
    let pressure = frontend.get_f64(&VarName::plain("pressure")).unwrap();
    assert!((pressure - 0.02).abs() / 0.02 < 1e-3);
    // The classification travels through the aux status variable.
    assert_eq!(
        frontend.get_str(&VarName::plain("__auxstatus__")),
        Some("Vacuum OK")
    );
    frontend.shutdown();
    gauge.join().unwrap();
}

#[test]
fn unchanged_values_are_silent_but_signalled_refreshes_emit() {
    let (mut frontend, peer) =
        launch("vac2", "vacuumgauge", VacuumGaugeBackend::new(), fast_options());
    let gauge = run_gauge(peer, 0.5);
    let (_, ready) = wait_for(&mut frontend, Duration::from_secs(2), |event| {
        matches!(event, DeviceEvent::StartupDone)
    });
    assert!(ready);
    // Let the periodic poll deliver a few unchanged readings, then
    // drain: no further change events for a constant pressure.
    thread::sleep(Duration::from_millis(100));
    frontend.poll();
    thread::sleep(Duration::from_millis(100));
    let pressure_name = VarName::plain("pressure");
    let quiet: Vec<_> = frontend
        .poll()
        .into_iter()
        .filter(|e| {
            matches!(e, DeviceEvent::VariableChanged { name, .. } if *name == pressure_name)
        })
        .collect();
    assert!(quiet.is_empty(), "unchanged pressure still emitted: {quiet:?}");
    // A refresh with signal_needed forces exactly one event through.
    frontend.refresh(pressure_name.clone(), true).unwrap();
    let (_, emitted) = wait_for(&mut frontend, Duration::from_secs(1), |event| {
        matches!(event, DeviceEvent::VariableChanged { name, .. } if *name == pressure_name)
    });
    assert!(emitted, "signalled refresh did not emit");
    frontend.shutdown();
    gauge.join().unwrap();
}

#[test]
fn silent_device_trips_the_watchdog_and_disconnects() {
    let options = BackendOptions {
        poll_interval: Duration::from_millis(10),
        watchdog_timeout: Duration::from_millis(200),
        log_file: None,
        log_format: None,
    };
    let (mut frontend, peer) =
        launch("vac3", "vacuumgauge", VacuumGaugeBackend::new(), options);
    // The gauge never answers; keep the peer alive so the transport
    // does not fail first.
    let (_, fired) = wait_for(&mut frontend, Duration::from_secs(2), |event| {
        matches!(event, DeviceEvent::WatchdogTimeout(_))
    });
    assert!(fired, "watchdog never fired");
    assert!(!frontend.is_connected());
    assert_eq!(frontend.status(), DeviceStatus::Disconnected);
    // The cache is cleared on disconnect.
    assert!(frontend.get_f64(&VarName::plain("pressure")).is_none());
    drop(peer);
    frontend.shutdown();
}

#[test]
fn telemetry_reports_traffic_counters() {
    let (mut frontend, peer) =
        launch("vac4", "vacuumgauge", VacuumGaugeBackend::new(), fast_options());
    let gauge = run_gauge(peer, 0.02);
    let (_, ready) = wait_for(&mut frontend, Duration::from_secs(2), |event| {
        matches!(event, DeviceEvent::StartupDone)
    });
    assert!(ready);
    frontend.request_telemetry().unwrap();
    let (events, got) = wait_for(&mut frontend, Duration::from_secs(1), |event| {
        matches!(event, DeviceEvent::Telemetry(_))
    });
    assert!(got, "no telemetry reply");
    let telemetry = events
        .iter()
        .find_map(|e| match e {
            DeviceEvent::Telemetry(t) => Some(t.clone()),
            _ => None,
        })
        .unwrap();
    assert!(telemetry.messages_sent >= 1);
    assert!(telemetry.messages_received >= 1);
    assert!(telemetry.queries >= 1);
    frontend.shutdown();
    gauge.join().unwrap();
}

#[test]
fn dead_transport_kills_the_backend() {
    let (mut frontend, peer) =
        launch("vac5", "vacuumgauge", VacuumGaugeBackend::new(), fast_options());
    drop(peer); // remote end hangs up
    let (_, died) = wait_for(&mut frontend, Duration::from_secs(2), |event| {
        matches!(event, DeviceEvent::BackendDied(_))
    });
    assert!(died, "backend did not report its death");
    assert!(!frontend.is_connected());
    frontend.shutdown();
}
