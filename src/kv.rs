use crate::error::Result;
use crate::raft::{Command, Entry, Index, State};

use log::debug;
use std::collections::HashMap;

/// The key/value store: a string map mutated exclusively by applying
/// committed put entries in index order. Holds no history and no locks; the
/// Raft log is the system of record.
#[derive(Debug, Default)]
pub struct KV {
    /// The index of the last applied entry.
    applied_index: Index,
    /// The current key/value pairs.
    data: HashMap<String, String>,
}

impl KV {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl State for KV {
    fn get_applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, index: Index, entry: &Entry) -> Result<()> {
        assert_eq!(index, self.applied_index + 1, "entries must be applied in order");
        if let Command::Put { key, value, .. } = &entry.command {
            debug!("Applying put {key}={value} at index {index}");
            self.data.insert(key.clone(), value.clone());
        }
        self.applied_index = index;
        Ok(())
    }

    fn read(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }
}
