mod log;
mod message;
mod node;
mod server;
mod state;
mod transport;

pub use self::log::{Command, Entry, Index, Log};
pub use message::{Ack, Envelope, Message, BROADCAST};
pub use node::{Node, NodeID, Term};
pub use server::Server;
pub use state::State;
pub use transport::{Transport, UdpTransport, MAX_DATAGRAM_SIZE};

use std::time::Duration;

/// The interval between leader heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(150);

/// The range of randomized election timeouts, in milliseconds. A replica that
/// doesn't hear from a leader within its timeout campaigns for leadership.
pub const ELECTION_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 500..=800;

/// The minimum interval between data appends to a single peer. This paces
/// catch-up replication; failure hints bypass it.
pub const APPEND_INTERVAL: Duration = Duration::from_millis(300);

/// The maximum number of entries in a single append message, keeping the
/// encoded datagram below the transport's size limit.
pub const MAX_APPEND_ENTRIES: usize = 30;

/// The maximum time to wait for an inbound message per event loop iteration.
/// Bounds timer latency while the transport is idle.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
