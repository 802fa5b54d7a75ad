use super::{Entry, Index};
use crate::error::Result;

/// A Raft-managed state machine. Committed log entries are applied in index
/// order; application must be deterministic, so that replicas converge on
/// identical state from identical logs.
pub trait State: Send {
    /// Returns the index of the last applied entry.
    fn get_applied_index(&self) -> Index;

    /// Applies a committed entry at the given index. Entries must be applied
    /// contiguously from get_applied_index() + 1 upward.
    fn apply(&mut self, index: Index, entry: &Entry) -> Result<()>;

    /// Reads the value of a key, or None if absent.
    fn read(&self, key: &str) -> Option<String>;
}
