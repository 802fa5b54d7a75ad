use super::{Entry, Index, NodeID, Term};

use serde::{Deserialize, Serialize};

/// The reserved identifier denoting all replicas as a destination, and "no
/// known leader" in the envelope's leader field.
pub const BROADCAST: &str = "FFFF";

/// A message envelope, exchanged between replicas and with clients as a flat
/// JSON object. Every message carries the sender, the destination, and the
/// sender's current view of the leader (or "FFFF" if unknown); the payload
/// fields are flattened alongside and dispatched on the "type" field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub src: NodeID,
    /// The recipient, or "FFFF" for broadcast.
    pub dst: NodeID,
    /// The sender's current leader, or "FFFF" if unknown.
    pub leader: NodeID,
    /// The message payload.
    #[serde(flatten)]
    pub message: Message,
}

/// A message payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Broadcast once at startup to announce the replica's existence.
    Hello,

    /// A client read of a single key.
    Get {
        key: String,
        #[serde(rename = "MID")]
        mid: String,
    },
    /// A client write of a single key.
    Put {
        key: String,
        value: String,
        #[serde(rename = "MID")]
        mid: String,
    },
    /// Tells a client to retry its request with the leader named in the
    /// envelope's leader field.
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },

    /// Candidates solicit votes from all peers when campaigning.
    RequestVote {
        /// The candidate's term.
        term: Term,
        /// The index of the candidate's last log entry.
        last_log_index: Index,
        /// The term of the candidate's last log entry.
        last_log_term: Term,
    },
    /// A vote response. Voters grant at most one vote per term.
    Vote {
        /// The voter's current term.
        term: Term,
        /// Whether the vote was granted.
        vote: bool,
    },

    /// Leaders replicate log entries to followers. An empty entries list is a
    /// heartbeat, asserting leadership and publishing the commit index.
    Append {
        /// The leader's term.
        term: Term,
        /// The index of the entry immediately preceding entries.
        prev_log_index: Index,
        /// The term of the entry at prev_log_index.
        prev_log_term: Term,
        /// The entries to append, in order. At most MAX_APPEND_ENTRIES.
        entries: Vec<Entry>,
        /// The leader's commit index.
        leader_commit: Index,
    },

    /// A positive acknowledgement: either a follower accepting an append
    /// (echoing its base and entries), or a reply to a client request. The
    /// two share the "ok" wire type and are told apart by their fields.
    Ok(Ack),

    /// A follower rejecting an append whose base doesn't match its log.
    Fail {
        /// The follower's current term.
        term: Term,
        /// A back-off hint: the first index worth retrying (see
        /// Log::first_conflict_index).
        first_index: Index,
    },
}

/// The body of an "ok" acknowledgement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ack {
    /// A follower accepted an append. Echoes the base and the entries
    /// received, so the leader can compute the new match index even when
    /// responses are reordered or duplicated.
    Entries { prev_log_index: Index, prev_log_term: Term, entries: Vec<Entry> },
    /// A reply to a client get or put. The value is present for gets only.
    Client {
        #[serde(rename = "MID")]
        mid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

impl Message {
    /// Returns the sender's term, for messages that carry one. Client
    /// messages and append acknowledgements don't.
    pub fn term(&self) -> Option<Term> {
        match self {
            Message::RequestVote { term, .. }
            | Message::Vote { term, .. }
            | Message::Append { term, .. }
            | Message::Fail { term, .. } => Some(*term),
            Message::Hello
            | Message::Get { .. }
            | Message::Put { .. }
            | Message::Redirect { .. }
            | Message::Ok(_) => None,
        }
    }
}
