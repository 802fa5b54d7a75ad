use super::{NodeID, Term};

use serde::{Deserialize, Serialize};

/// A log index. Client commands start at 1; index 0 is the sentinel.
pub type Index = u64;

/// A log entry: a term-stamped command slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the entry was appended.
    pub term: Term,
    /// The command, flattened into the entry's wire representation.
    #[serde(flatten)]
    pub command: Command,
}

/// A state machine command carried by a log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    /// The fixed sentinel at index 0. Never replicated, never applied; it
    /// exists so that prev_log_index arithmetic is total for any live index.
    #[serde(rename = "none")]
    Sentinel,
    /// A client put, stamped with the originating client and request ID so
    /// the leader can acknowledge the client when the entry commits.
    Put {
        src: NodeID,
        #[serde(rename = "MID")]
        mid: String,
        key: String,
        value: String,
    },
}

impl Entry {
    /// Returns the client request ID for put entries.
    pub fn mid(&self) -> Option<&str> {
        match &self.command {
            Command::Put { mid, .. } => Some(mid),
            Command::Sentinel => None,
        }
    }
}

/// The replicated log: a 1-origin append-only sequence of term-stamped
/// commands, with a fixed sentinel at index 0. The leader appends client puts
/// at the tail and replicates them to followers, who truncate a conflicting
/// suffix and append the leader's entries. Once an index is at or below the
/// commit index it is frozen and applied to the state machine.
///
/// The log also holds the current term and vote. Neither the log nor the
/// term survive a restart; a restarted replica rejoins the cluster empty.
///
/// Invariants:
///
/// * Entry indexes are contiguous (the backing vector slot i holds index i).
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Committed entries are never truncated or replaced.
/// * If two logs contain a matching index/term, all previous entries are
///   identical (Log Matching, section 5.3 in the Raft paper).
pub struct Log {
    /// Log entries. entries[0] is the sentinel.
    entries: Vec<Entry>,
    /// The current term. Never decreases.
    term: Term,
    /// Who we voted for in the current term, if anyone.
    vote: Option<NodeID>,
    /// The index of the last committed entry.
    commit_index: Index,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// Creates a new, empty log holding only the sentinel.
    pub fn new() -> Self {
        Self {
            entries: vec![Entry { term: 0, command: Command::Sentinel }],
            term: 0,
            vote: None,
            commit_index: 0,
        }
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<&NodeID>) {
        (self.term, self.vote.as_ref())
    }

    /// Stores the current term and cast vote (if any). Enforces that the term
    /// does not regress and that we only vote for one node per term. The vote
    /// is cleared on any term increase.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(
            term > self.term || self.vote.is_none() || vote == self.vote,
            "can't change vote in term {term}"
        );
        self.term = term;
        self.vote = vote;
    }

    /// Returns the last log index and its term.
    pub fn last(&self) -> (Index, Term) {
        let last = self.entries.last().expect("log without sentinel");
        (self.last_index(), last.term)
    }

    /// Returns the last log index.
    pub fn last_index(&self) -> Index {
        self.entries.len() as Index - 1
    }

    /// Returns the commit index.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Fetches the entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    /// Checks whether the entry at the given index has the given term. This
    /// is the append base check: the sentinel makes (0, 0) always match, and
    /// an index beyond the log never matches.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Appends a command at the tail under the current term, returning its
    /// index. Leader-only; followers ingest entries via splice().
    pub fn append(&mut self, command: Command) -> Index {
        assert!(self.term > 0, "can't append in term 0");
        self.entries.push(Entry { term: self.term, command });
        self.last_index()
    }

    /// Discards all entries at indexes >= index. Follower-only, used when a
    /// leader's entries conflict with the local log. Can't touch committed
    /// entries nor the sentinel.
    pub fn truncate_from(&mut self, index: Index) {
        assert!(index > self.commit_index, "can't truncate committed entries");
        self.entries.truncate(index as usize);
    }

    /// Splices entries received from a leader into the log immediately after
    /// prev_index, whose term the caller has already verified via has().
    /// Entries that are already present (same position, same term) are left
    /// alone; the first term conflict truncates the old suffix. Returns the
    /// index of the last spliced entry.
    pub fn splice(&mut self, prev_index: Index, entries: Vec<Entry>) -> Index {
        assert!(prev_index <= self.last_index(), "splice base {prev_index} beyond log");
        let mut index = prev_index;
        for entry in entries {
            index += 1;
            if let Some(existing) = self.get(index) {
                // Log Matching: same index and term implies the same entry.
                if existing.term == entry.term {
                    continue;
                }
                self.truncate_from(index);
            }
            self.entries.push(entry);
        }
        index
    }

    /// Returns the smallest index whose entry has the same term as the entry
    /// at the given index, or the last index if the given index is beyond the
    /// log. Sent as a back-off hint with append rejections, letting the
    /// leader skip an entire conflicting term instead of probing entry by
    /// entry.
    pub fn first_conflict_index(&self, index: Index) -> Index {
        if index > self.last_index() {
            return self.last_index();
        }
        let term = self.entries[index as usize].term;
        let mut first = index;
        while first > 0 && self.entries[first as usize - 1].term == term {
            first -= 1;
        }
        first
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Index {
        assert!(index <= self.last_index(), "commit index {index} does not exist");
        assert!(index >= self.commit_index, "commit regression {} → {index}", self.commit_index);
        self.commit_index = index;
        index
    }

    /// Returns an iterator over the entries in the given index range,
    /// clamped to the log's bounds.
    pub fn scan(&self, range: impl std::ops::RangeBounds<Index>) -> std::slice::Iter<'_, Entry> {
        use std::ops::Bound;
        let start = match range.start_bound() {
            Bound::Included(&index) => index as usize,
            Bound::Excluded(&index) => index as usize + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&index) => index as usize + 1,
            Bound::Excluded(&index) => index as usize,
            Bound::Unbounded => self.entries.len(),
        };
        let start = start.min(self.entries.len());
        let end = end.clamp(start, self.entries.len());
        self.entries[start..end].iter()
    }
}
