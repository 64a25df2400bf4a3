//! Shared wiring for back-end integration tests: launch a procedure on
//! real worker threads connected to an in-process transport peer.
#![allow(dead_code)] // not every test binary uses every helper

use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;

use beamctl_device::backend::{BackendOptions, DeviceProcedure, spawn_backend};
use beamctl_device::frontend::DeviceFrontend;
use beamctl_device::message::DeviceEvent;
use beamctl_device::transport::{TransportPeer, channel_pair, spawn_comm_worker};

/// Spawn a full front-end/back-end/comm-worker stack over a channel
/// transport; the returned peer plays the device.
pub fn launch<P: DeviceProcedure>(
    name: &str,
    device_type: &'static str,
    procedure: P,
    options: BackendOptions,
) -> (DeviceFrontend, TransportPeer) {
    let (transport, peer) = channel_pair();
    let (to_back_tx, to_back_rx) = unbounded();
    let (to_front_tx, to_front_rx) = unbounded();
    let (wire_tx, wire_rx) = unbounded();
    let comm = spawn_comm_worker(
        name,
        Box::new(transport),
        wire_rx,
        to_back_tx.clone(),
        Duration::from_millis(5),
    );
    let backend = spawn_backend(
        name,
        procedure,
        Some(wire_tx),
        to_back_rx,
        to_front_tx,
        options,
    );
    let frontend =
        DeviceFrontend::new(name, device_type, to_back_tx, to_front_rx, backend, Some(comm));
    (frontend, peer)
}

/// Poll the front-end until the predicate matches one of the drained
/// events, collecting everything seen along the way.
pub fn wait_for(
    frontend: &mut DeviceFrontend,
    timeout: Duration,
    mut predicate: impl FnMut(&DeviceEvent) -> bool,
) -> (Vec<DeviceEvent>, bool) {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        for event in frontend.poll() {
            let hit = predicate(&event);
            seen.push(event);
            if hit {
                return (seen, true);
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    (seen, false)
}
