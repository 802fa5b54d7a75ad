use super::{Envelope, Log, Message, Node, NodeID, State, Transport, BROADCAST, POLL_INTERVAL};
use crate::error::Result;

use log::{debug, info};
use std::time::Instant;

/// A replica server. Drives the Raft node with a single-threaded event loop
/// that owns all mutable state: each iteration fires expired timers, drains
/// the node's outbox into the transport, and polls the transport with a
/// bounded wait. There are no locks and no background threads; the bounded
/// poll is the only suspension point.
pub struct Server {
    node: Node,
    node_rx: crossbeam::channel::Receiver<Envelope>,
    transport: Box<dyn Transport>,
}

impl Server {
    /// Creates a new replica server.
    pub fn new(
        id: NodeID,
        peers: Vec<NodeID>,
        log: Log,
        state: Box<dyn State>,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let node = Node::new(id, peers, log, state, node_tx, Instant::now())?;
        Ok(Self { node, node_rx, transport })
    }

    /// Announces the replica and runs the event loop. Runs until the process
    /// is killed; only an unrecoverable transport error returns.
    pub fn serve(mut self) -> Result<()> {
        info!("Replica {} starting", self.node.id());
        self.transport.send(&Envelope {
            src: self.node.id().clone(),
            dst: BROADCAST.into(),
            leader: BROADCAST.into(),
            message: Message::Hello,
        })?;

        loop {
            let now = Instant::now();
            self.node = self.node.tick(now)?;
            self.drain_outbox()?;

            if let Some(envelope) = self.transport.recv(POLL_INTERVAL)? {
                if self.accepts(&envelope) {
                    self.node = self.node.step(envelope, now)?;
                    self.drain_outbox()?;
                } else {
                    debug!("Ignoring message not addressed to us: {envelope:?}");
                }
            }
        }
    }

    /// Checks whether an inbound message is for us: addressed to this replica
    /// or broadcast, and not our own broadcast echoed back.
    fn accepts(&self, envelope: &Envelope) -> bool {
        let id = self.node.id();
        envelope.src != *id && (envelope.dst == *id || envelope.dst == BROADCAST)
    }

    /// Forwards the node's outbound messages to the transport.
    fn drain_outbox(&mut self) -> Result<()> {
        while let Ok(envelope) = self.node_rx.try_recv() {
            self.transport.send(&envelope)?;
        }
        Ok(())
    }
}
