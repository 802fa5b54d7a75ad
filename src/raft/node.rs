use super::{
    Ack, Command, Envelope, Index, Log, Message, State, APPEND_INTERVAL, BROADCAST,
    ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL, MAX_APPEND_ENTRIES,
};
use crate::error::Result;

use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// A replica ID.
pub type NodeID = String;

/// A leader term.
pub type Term = u64;

/// Draws a fresh randomized election deadline.
fn rand_election_deadline(now: Instant) -> Instant {
    now + Duration::from_millis(rand::thread_rng().gen_range(ELECTION_TIMEOUT_RANGE))
}

/// A Raft replica with a dynamic role. The replica is driven synchronously by
/// the event loop: step() processes an inbound message, tick() fires any
/// expired timers against the given wall-clock instant. Both consume the
/// current replica and return a new one with a possibly different role.
/// Outbound messages are emitted via the node_tx channel, which the event
/// loop drains into the transport.
///
/// This enum wraps the RawNode<Role> types, which implement the actual
/// replica logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new replica, starting as a leaderless follower, or as leader
    /// if there are no peers.
    pub fn new(
        id: NodeID,
        peers: Vec<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        now: Instant,
    ) -> Result<Self> {
        let node = RawNode::new(id, peers, log, state, node_tx, now)?;
        if node.peers.is_empty() {
            // A cluster of one is its own majority.
            return Ok(node.into_candidate(now)?.into_leader(now)?.into());
        }
        Ok(node.into())
    }

    /// Returns the replica ID.
    pub fn id(&self) -> &NodeID {
        match self {
            Node::Candidate(n) => &n.id,
            Node::Follower(n) => &n.id,
            Node::Leader(n) => &n.id,
        }
    }

    /// Returns the replica's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term(),
            Node::Follower(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Processes an inbound message.
    pub fn step(self, msg: Envelope, now: Instant) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg, now),
            Node::Follower(n) => n.step(msg, now),
            Node::Leader(n) => n.step(msg, now),
        }
    }

    /// Fires any timers that expired at or before the given instant.
    pub fn tick(self, now: Instant) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(now),
            Node::Follower(n) => n.tick(now),
            Node::Leader(n) => n.tick(now),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {
    /// The leader to advertise in outbound envelopes, or the broadcast
    /// sentinel if unknown.
    fn leader_hint(&self, id: &NodeID) -> NodeID;
}

/// A Raft replica with the concrete role R. Role-specific state (e.g. the
/// leader's per-peer replication progress) lives in the role itself, making
/// it unrepresentable in other roles.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: Vec<NodeID>,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            role,
        }
    }

    /// Returns the replica's current term. Convenience wrapper for the log.
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// Returns the cluster size as number of replicas.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector: the largest
    /// value replicated across a strict majority. The vector must have the
    /// same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message, stamping the envelope with our leader view.
    fn send(&self, dst: &str, message: Message) -> Result<()> {
        let envelope = Envelope {
            src: self.id.clone(),
            dst: dst.to_string(),
            leader: self.role.leader_hint(&self.id),
            message,
        };
        debug!("Sending {envelope:?}");
        Ok(self.node_tx.send(envelope)?)
    }

    /// Broadcasts a message to all peers via the broadcast address.
    fn broadcast(&self, message: Message) -> Result<()> {
        self.send(BROADCAST, message)
    }

    /// Applies any committed but unapplied entries to the state machine, in
    /// index order.
    fn maybe_apply(&mut self) -> Result<()> {
        while self.state.get_applied_index() < self.log.commit_index() {
            let index = self.state.get_applied_index() + 1;
            let entry = self.log.get(index).expect("committed entry must exist").clone();
            debug!("Applying {entry:?} at index {index}");
            self.state.apply(index, &entry)?;
        }
        Ok(())
    }
}

/// A follower replicates state from a leader, or waits out its election
/// timeout if it doesn't know of one.
pub struct Follower {
    /// The leader, or None if we haven't heard from one in this term.
    leader: Option<NodeID>,
    /// When to start an election unless a leader or candidate shows up.
    election_deadline: Instant,
    /// Client requests deferred until a leader is known. Redirected in order
    /// once one is.
    pending: VecDeque<Envelope>,
}

impl Follower {
    fn new(leader: Option<NodeID>, election_deadline: Instant) -> Self {
        Self { leader, election_deadline, pending: VecDeque::new() }
    }
}

impl Role for Follower {
    fn leader_hint(&self, _id: &NodeID) -> NodeID {
        self.leader.clone().unwrap_or_else(|| BROADCAST.to_string())
    }
}

impl RawNode<Follower> {
    /// Creates a new replica as a leaderless follower.
    fn new(
        id: NodeID,
        peers: Vec<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        now: Instant,
    ) -> Result<Self> {
        let mut peers = peers;
        peers.sort();
        peers.dedup();
        assert!(!peers.contains(&id), "replica can't be its own peer");
        let role = Follower::new(None, rand_election_deadline(now));
        Ok(Self { id, peers, log, state, node_tx, role })
    }

    /// Transitions the follower into a candidate, campaigning for leadership
    /// in a new term. Queued client requests are carried along.
    fn into_candidate(mut self, now: Instant) -> Result<RawNode<Candidate>> {
        let pending = std::mem::take(&mut self.role.pending);
        let mut node = self.into_role(Candidate::new(rand_election_deadline(now), pending));
        node.campaign(now)?;
        Ok(node)
    }

    /// Remains a follower, but adopts a new term (clearing the vote) and/or a
    /// discovered leader.
    fn into_follower(
        mut self,
        term: Term,
        leader: Option<NodeID>,
        now: Instant,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);
        if term > self.term() {
            info!("Discovered new term {term}");
            self.log.set_term(term, None);
            self.role.leader = None;
        }
        if let Some(leader) = leader {
            assert!(self.role.leader.is_none(), "already have a leader in term {term}");
            info!("Following leader {leader} in term {term}");
            self.role.leader = Some(leader);
            self.drain_pending()?;
        }
        self.role.election_deadline = rand_election_deadline(now);
        Ok(self)
    }

    /// Redirects queued client requests to the leader, if one is now known.
    fn drain_pending(&mut self) -> Result<()> {
        if self.role.leader.is_none() {
            return Ok(());
        }
        while let Some(envelope) = self.role.pending.pop_front() {
            let (Message::Get { mid, .. } | Message::Put { mid, .. }) = envelope.message else {
                panic!("non-client message in pending queue");
            };
            debug!("Redirecting queued request {mid} from {}", envelope.src);
            self.send(&envelope.src, Message::Redirect { mid })?;
        }
        Ok(())
    }

    /// Processes an inbound message.
    fn step(mut self, msg: Envelope, now: Instant) -> Result<Node> {
        // A higher term wins immediately: adopt it, then process the message.
        if let Some(term) = msg.message.term() {
            if term > self.term() {
                return self.into_follower(term, None, now)?.step(msg, now);
            }
        }

        match msg.message {
            // A leader replicates entries, or asserts leadership via an empty
            // heartbeat. Either way it establishes the leader for this term.
            Message::Append { term, prev_log_index, prev_log_term, entries, leader_commit } => {
                // A stale leader is rejected without mutating state; the
                // fail's term tells it to step down.
                if term < self.term() {
                    self.send(
                        &msg.src,
                        Message::Fail {
                            term: self.term(),
                            first_index: self.log.first_conflict_index(prev_log_index),
                        },
                    )?;
                    return Ok(self.into());
                }

                // Adopt the sender as leader (redirecting any queued client
                // requests to it) and reset the election timeout.
                match self.role.leader.clone() {
                    Some(leader) => {
                        assert_eq!(leader, msg.src, "multiple leaders in term {term}");
                        self.role.election_deadline = rand_election_deadline(now);
                    }
                    None => self = self.into_follower(term, Some(msg.src.clone()), now)?,
                }

                // Reject the append if the base entry doesn't match our log,
                // hinting where the leader should back off to.
                if !self.log.has(prev_log_index, prev_log_term) {
                    debug!("Rejecting append with base {prev_log_index}/{prev_log_term}");
                    self.send(
                        &msg.src,
                        Message::Fail {
                            term: self.term(),
                            first_index: self.log.first_conflict_index(prev_log_index),
                        },
                    )?;
                    return Ok(self.into());
                }

                // Splice the entries into our log, advance the commit index as
                // far as the leader allows, and apply.
                self.log.splice(prev_log_index, entries.clone());
                let commit_index =
                    std::cmp::min(leader_commit, self.log.last_index()).max(self.log.commit_index());
                if commit_index > self.log.commit_index() {
                    self.log.commit(commit_index);
                    self.maybe_apply()?;
                }

                // Acknowledge, echoing the base and entries so the leader can
                // compute the new match index.
                self.send(
                    &msg.src,
                    Message::Ok(Ack::Entries { prev_log_index, prev_log_term, entries }),
                )?;
            }

            // A candidate is asking for our vote.
            Message::RequestVote { term, last_log_index, last_log_term } => {
                let (log_index, log_term) = self.log.last();
                let grant = term >= self.term()
                    // Only vote for candidates whose log is at least as
                    // up-to-date as ours, to preserve Leader Completeness.
                    && (last_log_term > log_term
                        || (last_log_term == log_term && last_log_index >= log_index))
                    // At most one vote per term, but re-granting is fine.
                    && self.log.get_term().1.map_or(true, |vote| *vote == msg.src);
                if grant {
                    info!("Voting for {} in term {term} election", msg.src);
                    self.log.set_term(term, Some(msg.src.clone()));
                    self.role.election_deadline = rand_election_deadline(now);
                }
                self.send(&msg.src, Message::Vote { term: self.term(), vote: grant })?;
            }

            // A vote may arrive after we lost an election and stepped back to
            // follower. Ignore it.
            Message::Vote { .. } => {}

            // Client requests: redirect if we know a leader, queue otherwise.
            ref message @ (Message::Get { .. } | Message::Put { .. }) => {
                if let Some(leader) = self.role.leader.clone() {
                    let (Message::Get { mid, .. } | Message::Put { mid, .. }) = message else {
                        unreachable!();
                    };
                    debug!("Redirecting request {mid} to {leader}");
                    let mid = mid.clone();
                    self.send(&msg.src, Message::Redirect { mid })?;
                } else {
                    debug!("Queueing client request until a leader is known");
                    self.role.pending.push_back(msg);
                }
            }

            // Anything else is stale or misrouted (e.g. an append ack from
            // when we were leader, or a startup hello). Drop it.
            _ => debug!("Dropping {msg:?}"),
        }
        Ok(self.into())
    }

    /// Starts an election if the timeout has expired.
    fn tick(self, now: Instant) -> Result<Node> {
        if now >= self.role.election_deadline {
            return Ok(self.into_candidate(now)?.into());
        }
        Ok(self.into())
    }
}

/// A candidate is campaigning to become leader.
pub struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<NodeID>,
    /// When to abandon this election and start a new one.
    election_deadline: Instant,
    /// Client requests deferred until a leader is known.
    pending: VecDeque<Envelope>,
}

impl Candidate {
    fn new(election_deadline: Instant, pending: VecDeque<Envelope>) -> Self {
        Self { votes: HashSet::new(), election_deadline, pending }
    }
}

impl Role for Candidate {
    fn leader_hint(&self, _id: &NodeID) -> NodeID {
        BROADCAST.to_string()
    }
}

impl RawNode<Candidate> {
    /// Campaigns for leadership: bump the term, vote for ourself, and solicit
    /// votes from all peers.
    fn campaign(&mut self, now: Instant) -> Result<()> {
        let term = self.term() + 1;
        info!("Starting new election for term {term}");
        self.role.votes = HashSet::from([self.id.clone()]);
        self.role.election_deadline = rand_election_deadline(now);
        self.log.set_term(term, Some(self.id.clone()));

        let (last_log_index, last_log_term) = self.log.last();
        self.broadcast(Message::RequestVote { term, last_log_index, last_log_term })
    }

    /// Transitions the candidate to follower. Either we lost the election to
    /// a leader in this term, or we discovered a higher term.
    fn into_follower(
        mut self,
        term: Term,
        leader: Option<NodeID>,
        now: Instant,
    ) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term regression {} → {}", self.term(), term);
        if leader.is_some() {
            assert_eq!(term, self.term(), "can't follow leader in a different term");
            info!("Lost election, following leader in term {term}");
        } else {
            assert!(term > self.term(), "can't become leaderless follower in current term");
            info!("Discovered new term {term}");
            self.log.set_term(term, None);
        }
        let pending = std::mem::take(&mut self.role.pending);
        let mut node = self.into_role(Follower::new(leader, rand_election_deadline(now)));
        node.role.pending = pending;
        node.drain_pending()?;
        Ok(node)
    }

    /// Transitions the candidate to leader: we won the election.
    fn into_leader(mut self, now: Instant) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term());
        let pending = std::mem::take(&mut self.role.pending);
        let peers = self.peers.clone();
        let commit_index = self.log.commit_index();
        let mut node = self.into_role(Leader::new(peers, commit_index, now));

        // Announce leadership immediately, so followers stand down and
        // clients get redirected to us.
        node.heartbeat(now)?;

        // Serve the requests that queued up during the election.
        for envelope in pending {
            node.client_request(envelope)?;
        }
        Ok(node)
    }

    /// Processes an inbound message.
    fn step(mut self, msg: Envelope, now: Instant) -> Result<Node> {
        // A higher term wins immediately: step down, then process the message.
        if let Some(term) = msg.message.term() {
            if term > self.term() {
                return self.into_follower(term, None, now)?.step(msg, now);
            }
        }

        match msg.message {
            // A valid append in our term means someone else won the election.
            // Follow them and process the message as a follower.
            Message::Append { term, .. } if term == self.term() => {
                return self.into_follower(term, Some(msg.src.clone()), now)?.step(msg, now);
            }

            // A stale leader; tell it about the current term.
            Message::Append { prev_log_index, .. } => {
                self.send(
                    &msg.src,
                    Message::Fail {
                        term: self.term(),
                        first_index: self.log.first_conflict_index(prev_log_index),
                    },
                )?;
            }

            // We already voted for ourself, so deny rival candidates.
            Message::RequestVote { .. } => {
                self.send(&msg.src, Message::Vote { term: self.term(), vote: false })?;
            }

            // Tally granted votes; a strict majority makes us leader.
            Message::Vote { term, vote } => {
                if term < self.term() {
                    debug!("Dropping vote from stale term {term}");
                } else if vote {
                    self.role.votes.insert(msg.src);
                    if self.role.votes.len() >= self.quorum_size() {
                        return Ok(self.into_leader(now)?.into());
                    }
                }
            }

            // No leader to answer or redirect to yet; queue the request.
            Message::Get { .. } | Message::Put { .. } => {
                debug!("Queueing client request during election");
                self.role.pending.push_back(msg);
            }

            _ => debug!("Dropping {msg:?}"),
        }
        Ok(self.into())
    }

    /// Starts a new election (in a fresh term) if this one timed out.
    fn tick(mut self, now: Instant) -> Result<Node> {
        if now >= self.role.election_deadline {
            self.campaign(now)?;
        }
        Ok(self.into())
    }
}

/// Replication progress of a single peer, tracked by the leader.
struct Progress {
    /// The next log index to send.
    next_index: Index,
    /// The highest log index known to be replicated on the peer.
    match_index: Index,
    /// When a data append was last sent, for pacing. None until the first
    /// send, so a new leader replicates without delay.
    last_append: Option<Instant>,
}

impl Progress {
    /// Attempts to advance the match index, returning true if it did. The
    /// next index follows, but never regresses.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }
}

/// A leader serializes client puts into the log and replicates them to
/// followers.
pub struct Leader {
    /// Per-peer replication progress.
    progress: HashMap<NodeID, Progress>,
    /// When heartbeats were last sent to all peers.
    last_heartbeat: Instant,
}

impl Leader {
    fn new(peers: Vec<NodeID>, commit_index: Index, now: Instant) -> Self {
        let progress = peers
            .into_iter()
            .map(|p| (p, Progress { next_index: commit_index + 1, match_index: 0, last_append: None }))
            .collect();
        Self { progress, last_heartbeat: now }
    }
}

impl Role for Leader {
    fn leader_hint(&self, id: &NodeID) -> NodeID {
        id.clone()
    }
}

impl RawNode<Leader> {
    /// Transitions the leader to a leaderless follower in a higher term. This
    /// is the only way a leader steps down.
    fn into_follower(mut self, term: Term, now: Instant) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "leader can only step down to a later term");
        info!("Discovered new term {term}, stepping down");
        self.log.set_term(term, None);
        Ok(self.into_role(Follower::new(None, rand_election_deadline(now))))
    }

    /// Processes an inbound message.
    fn step(mut self, msg: Envelope, now: Instant) -> Result<Node> {
        // A higher term wins immediately: step down, then process the message.
        if let Some(term) = msg.message.term() {
            if term > self.term() {
                return self.into_follower(term, now)?.step(msg, now);
            }
        }

        match msg.message {
            // A follower accepted entries (or confirmed a heartbeat's base).
            // Record its progress and try to commit.
            Message::Ok(Ack::Entries { prev_log_index, entries, .. }) => {
                let match_index = prev_log_index + entries.len() as Index;
                // Acks carry no term, so an ack from an earlier leadership of
                // ours may refer to entries we no longer have. Drop it.
                if match_index > self.log.last_index() {
                    debug!("Dropping ack beyond the log from {}", msg.src);
                    return Ok(self.into());
                }
                let advanced = match self.role.progress.get_mut(&msg.src) {
                    Some(progress) => progress.advance(match_index),
                    None => {
                        debug!("Dropping append ack from unknown sender {}", msg.src);
                        false
                    }
                };
                if advanced {
                    self.maybe_commit_and_apply()?;
                }
            }

            // A follower rejected an append. Back off to its hint (but never
            // below what we know matches) and retransmit immediately.
            Message::Fail { term, first_index } => {
                if term < self.term() {
                    debug!("Dropping fail from stale term {term}");
                    return Ok(self.into());
                }
                let Some(progress) = self.role.progress.get_mut(&msg.src) else {
                    debug!("Dropping fail from unknown sender {}", msg.src);
                    return Ok(self.into());
                };
                let next_index =
                    first_index.max(progress.match_index + 1).min(progress.next_index);
                debug!("Follower {} rejected append, retrying from {next_index}", msg.src);
                progress.next_index = next_index;
                self.maybe_send_append(&msg.src, now, true)?;
            }

            // There can't be two leaders in the same term.
            Message::Append { term, .. } if term == self.term() => {
                panic!("saw other leader {} in term {term}", msg.src);
            }

            // A stale leader; tell it about the current term.
            Message::Append { prev_log_index, .. } => {
                self.send(
                    &msg.src,
                    Message::Fail {
                        term: self.term(),
                        first_index: self.log.first_conflict_index(prev_log_index),
                    },
                )?;
            }

            // Don't grant votes while leading this term.
            Message::RequestVote { .. } => {
                self.send(&msg.src, Message::Vote { term: self.term(), vote: false })?;
            }

            // Votes may straggle in after we won. Ignore them.
            Message::Vote { .. } => {}

            // Serve client requests directly.
            Message::Get { .. } | Message::Put { .. } => self.client_request(msg)?,

            _ => debug!("Dropping {msg:?}"),
        }
        Ok(self.into())
    }

    /// Fires the heartbeat and replication timers.
    fn tick(mut self, now: Instant) -> Result<Node> {
        if now.duration_since(self.role.last_heartbeat) >= HEARTBEAT_INTERVAL {
            self.heartbeat(now)?;
        }
        for peer in self.role.progress.keys().cloned().sorted() {
            self.maybe_send_append(&peer, now, false)?;
        }
        Ok(self.into())
    }

    /// Sends an empty append to every peer, asserting leadership, publishing
    /// the commit index, and probing each peer's log via its base entry.
    fn heartbeat(&mut self, now: Instant) -> Result<()> {
        for peer in self.role.progress.keys().cloned().sorted() {
            let next_index = self.role.progress[&peer].next_index;
            self.send_append(&peer, next_index, true)?;
        }
        self.role.last_heartbeat = now;
        Ok(())
    }

    /// Dispatches a client request: gets are answered from the local state
    /// machine, puts are proposed for consensus.
    fn client_request(&mut self, msg: Envelope) -> Result<()> {
        match msg.message {
            Message::Get { key, mid } => {
                // Committed puts are applied eagerly, so the local map is
                // current as of our leadership.
                let value = self.state.read(&key).unwrap_or_default();
                self.send(&msg.src, Message::Ok(Ack::Client { mid, value: Some(value) }))
            }
            Message::Put { key, value, mid } => self.client_put(msg.src, key, value, mid),
            _ => panic!("not a client request: {:?}", msg.message),
        }
    }

    /// Proposes a client put for consensus by appending it to our log. The
    /// client is acknowledged when the entry commits. Retransmitted requests
    /// are detected by their MID and never appended twice.
    fn client_put(&mut self, src: NodeID, key: String, value: String, mid: String) -> Result<()> {
        let commit_index = self.log.commit_index();
        if self.log.scan(1..=commit_index).any(|e| e.mid() == Some(mid.as_str())) {
            debug!("Put {mid} already committed, acknowledging");
            return self.send(&src, Message::Ok(Ack::Client { mid, value: None }));
        }
        if self.log.scan(commit_index + 1..).any(|e| e.mid() == Some(mid.as_str())) {
            debug!("Put {mid} already proposed, awaiting commit");
            return Ok(());
        }

        let index = self.log.append(Command::Put { src, mid, key, value });
        debug!("Proposed put at index {index}");

        // A cluster of one commits immediately.
        if self.peers.is_empty() {
            self.maybe_commit_and_apply()?;
        }
        Ok(())
    }

    /// Commits any entries replicated to a quorum, applies them, and
    /// acknowledges the originating clients.
    fn maybe_commit_and_apply(&mut self) -> Result<()> {
        // The quorum index is the highest index replicated to a majority,
        // counting our own log as fully replicated.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.last_index()))
                .collect(),
        );
        if quorum_index <= self.log.commit_index() {
            return Ok(());
        }

        // Only entries from our own term can be committed by counting
        // replicas (see section 5.4.2 in the Raft paper); earlier entries
        // commit implicitly with them.
        let entry_term = self.log.get(quorum_index).expect("quorum entry must exist").term;
        if entry_term != self.term() {
            return Ok(());
        }
        self.log.commit(quorum_index);

        // Apply the newly committed entries and answer the clients waiting on
        // them. Clients of entries inherited from prior terms get answered
        // too; duplicate oks are harmless.
        while self.state.get_applied_index() < self.log.commit_index() {
            let index = self.state.get_applied_index() + 1;
            let entry = self.log.get(index).expect("committed entry must exist").clone();
            debug!("Applying {entry:?} at index {index}");
            self.state.apply(index, &entry)?;
            if let Command::Put { src, mid, .. } = entry.command {
                self.send(&src, Message::Ok(Ack::Client { mid, value: None }))?;
            }
        }
        Ok(())
    }

    /// Sends a data append to a peer if it is behind and the per-peer pacing
    /// interval has elapsed (or the send is forced by a rejection hint).
    fn maybe_send_append(&mut self, peer: &str, now: Instant, force: bool) -> Result<()> {
        let (next_index, match_index, last_append) = {
            let progress = &self.role.progress[peer];
            (progress.next_index, progress.match_index, progress.last_append)
        };
        if match_index >= self.log.last_index() {
            return Ok(()); // caught up
        }
        if !force
            && last_append.is_some_and(|at| now.duration_since(at) < APPEND_INTERVAL)
        {
            return Ok(());
        }
        self.send_append(peer, next_index, false)?;
        self.role.progress.get_mut(peer).expect("unknown peer").last_append = Some(now);
        Ok(())
    }

    /// Sends an append to a peer from the given next index: either a
    /// heartbeat (empty entries) or a chunk of at most MAX_APPEND_ENTRIES
    /// entries, with the base entry just before the chunk.
    fn send_append(&self, peer: &str, next_index: Index, heartbeat: bool) -> Result<()> {
        let prev_log_index = next_index - 1;
        let prev_log_term = self.log.get(prev_log_index).expect("next_index beyond log").term;
        let entries: Vec<_> = if heartbeat {
            Vec::new()
        } else {
            self.log.scan(next_index..).take(MAX_APPEND_ENTRIES).cloned().collect()
        };
        if !entries.is_empty() {
            debug!("Replicating {} entries with base {prev_log_index} to {peer}", entries.len());
        }
        self.send(
            peer,
            Message::Append {
                term: self.term(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.log.commit_index(),
            },
        )
    }
}
