use super::Envelope;
use crate::error::Result;

use log::{debug, error};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::Duration;

/// The maximum datagram size. Bounds the encoded envelope, which in turn
/// drives the append chunking policy.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// A message channel to the rest of the cluster: an unreliable, unordered,
/// possibly-duplicating carrier of envelopes addressed by replica ID. The
/// event loop is the only caller; implementations need not be thread-safe,
/// only movable to the thread that runs the loop.
pub trait Transport: Send {
    /// Sends a message. Delivery is best-effort; an undeliverable message is
    /// dropped, not an error.
    fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Receives the next message, waiting up to the given timeout. Returns
    /// None on timeout, and also when an inbound datagram is undecodable
    /// (the datagram is dropped and logged).
    fn recv(&self, timeout: Duration) -> Result<Option<Envelope>>;
}

/// A loopback UDP transport. All outbound datagrams go to the single
/// simulator port given at launch; the simulator routes them by the
/// envelope's dst field, including fan-out of the broadcast address.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds an ephemeral local socket and points it at the simulator port.
    pub fn new(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.connect(("127.0.0.1", port))?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = serde_json::to_vec(envelope)?;
        if frame.len() > MAX_DATAGRAM_SIZE {
            error!("Dropping oversized {}-byte datagram to {}", frame.len(), envelope.dst);
            return Ok(());
        }
        match self.socket.send(&frame) {
            Ok(_) => Ok(()),
            // The simulator may be momentarily gone; the message is lost,
            // which the protocol tolerates.
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Envelope>> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = [0; MAX_DATAGRAM_SIZE];
        let n = match self.socket.recv(&mut buf) {
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::ConnectionRefused
                ) =>
            {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&buf[..n]) {
            Ok(envelope) => {
                debug!("Received {envelope:?}");
                Ok(Some(envelope))
            }
            Err(err) => {
                error!("Dropping undecodable {n}-byte datagram: {err}");
                Ok(None)
            }
        }
    }
}
