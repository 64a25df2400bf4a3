//! Byte transports and the communication worker.
//!
//! TCP devices get a dedicated communication worker thread: it writes
//! outbound messages handed over by the back-end and feeds inbound
//! chunks into the back-end queue as [`Request::Incoming`]. A fatal
//! socket condition becomes [`Request::CommError`], which the back-end
//! escalates to a disconnect.
//!
//! [`ChannelTransport`] is an in-process loopback used by the device
//! simulators and the test suites.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};

use beamctl_common::error::DeviceError;

use crate::message::Request;

/// Cut complete `terminator`-ended lines off a receive buffer, keeping
/// any partial tail for the next chunk. The terminator is stripped.
pub fn split_lines(buffer: &mut Vec<u8>, terminator: u8) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == terminator) {
        let rest = buffer.split_off(pos + 1);
        let mut line = std::mem::replace(buffer, rest);
        line.pop(); // drop the terminator
        frames.push(line);
    }
    frames
}

/// A bidirectional byte pipe towards a device.
pub trait Transport: Send + 'static {
    /// Write the whole buffer.
    fn send(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for inbound bytes. `Ok(None)` means no data
    /// arrived; an error means the channel broke down.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, DeviceError>;
}

/// Plain TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, DeviceError> {
        let addr = format!("{host}:{port}");
        let mut last_error = None;
        for candidate in std::net::ToSocketAddrs::to_socket_addrs(&addr)
            .map_err(|e| DeviceError::Communication(format!("cannot resolve {addr}: {e}")))?
        {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| DeviceError::Communication(e.to_string()))?;
                    return Ok(Self { stream });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(DeviceError::Communication(format!(
            "cannot connect to {addr}: {}",
            last_error.map_or_else(|| "no addresses".to_string(), |e| e.to_string())
        )))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.stream
            .write_all(data)
            .map_err(|e| DeviceError::Communication(format!("send failed: {e}")))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, DeviceError> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| DeviceError::Communication(e.to_string()))?;
        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(DeviceError::Communication(
                "socket closed by the remote side".to_string(),
            )),
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(DeviceError::Communication(format!("receive failed: {e}"))),
        }
    }
}

/// In-process transport over channels, paired with a [`TransportPeer`].
///
/// The peer plays the device: whatever the back-end sends shows up on
/// `peer.outbound`, and bytes pushed into `peer.inbound` are received
/// by the back-end.
pub struct ChannelTransport {
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
}

/// The device-side half of a [`ChannelTransport`].
pub struct TransportPeer {
    /// Frames the back-end sent to the "device".
    pub outbound: Receiver<Vec<u8>>,
    /// Bytes the "device" sends back.
    pub inbound: Sender<Vec<u8>>,
}

/// Create a connected transport/peer pair.
pub fn channel_pair() -> (ChannelTransport, TransportPeer) {
    let (to_device, outbound) = unbounded();
    let (inbound, from_device) = unbounded();
    (
        ChannelTransport {
            rx: from_device,
            tx: to_device,
        },
        TransportPeer { outbound, inbound },
    )
}

impl Transport for ChannelTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| DeviceError::Communication("peer hung up".to_string()))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, DeviceError> {
        match self.rx.recv_timeout(timeout) {
            Ok(data) => Ok(Some(data)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::Communication(
                "peer hung up".to_string(),
            )),
        }
    }
}

/// Spawn the communication worker of a TCP-style device.
///
/// The worker exits when the outbound channel is dropped (back-end
/// gone) or the transport fails, in which case it reports the failure
/// into the back-end queue first.
pub fn spawn_comm_worker(
    device_name: &str,
    mut transport: Box<dyn Transport>,
    outbound: Receiver<Vec<u8>>,
    to_back: Sender<Request>,
    poll: Duration,
) -> std::thread::JoinHandle<()> {
    let name = format!("comm-{device_name}");
    let device = device_name.to_string();
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            loop {
                // Drain pending outbound messages first: the wire stays
                // write-before-read like the devices expect.
                loop {
                    match outbound.try_recv() {
                        Ok(message) => {
                            if let Err(error) = transport.send(&message) {
                                let _ = to_back.send(Request::CommError(error.to_string()));
                                return;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return,
                    }
                }
                match transport.recv(poll) {
                    Ok(Some(bytes)) => {
                        if to_back.send(Request::Incoming(bytes)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(device = %device, %error, "communication worker failed");
                        let _ = to_back.send(Request::CommError(error.to_string()));
                        return;
                    }
                }
            }
        })
        .expect("spawning a communication worker cannot fail")
}
