//! Global path -> command id table.
//!
//! Populated from outside (typically a handshake response). When a task's
//! path is present, the dispatcher overwrites the task's own command id with
//! the table's value right before submission.

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct CmdIdTable {
    ids: DashMap<String, u32>,
}

impl CmdIdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous id for `path`, if any.
    pub fn insert(&self, path: impl Into<String>, cmd_id: u32) -> Option<u32> {
        self.ids.insert(path.into(), cmd_id)
    }

    pub fn remove(&self, path: &str) -> Option<u32> {
        self.ids.remove(path).map(|(_, id)| id)
    }

    pub fn get(&self, path: &str) -> Option<u32> {
        self.ids.get(path).map(|id| *id)
    }

    /// Bulk load, replacing entries for paths already present.
    pub fn extend<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        for (path, cmd_id) in entries {
            self.ids.insert(path.into(), cmd_id);
        }
    }

    pub fn clear(&self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
