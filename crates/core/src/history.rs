//! Bounded most-recently-used list of opened files and their last page.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default number of remembered files.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// One remembered file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub path: PathBuf,
    pub page_index: usize,
}

/// Most recent entry last; at most one entry per path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStore {
    capacity: usize,
    entries: Vec<HistoryEntry>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    /// Record `path` at `page_index`, moving it to the most recent position.
    pub fn push(&mut self, path: impl Into<PathBuf>, page_index: usize) {
        let path = path.into();
        self.entries.retain(|e| e.path != path);
        debug!("History: {:?} at page {}", path, page_index);
        self.entries.push(HistoryEntry { path, page_index });
        if self.entries.len() > self.capacity {
            let excess = self.entries.len() - self.capacity;
            self.entries.drain(..excess);
        }
    }

    /// Saved page for `path`.
    pub fn get(&self, path: &Path) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.path == path)
            .map(|e| e.page_index)
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Load a store saved with [`HistoryStore::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let mut store: HistoryStore = serde_json::from_slice(&data)
            .map_err(|e| crate::error::ComicError::corrupt(path, e))?;
        store.capacity = store.capacity.max(1);
        if store.entries.len() > store.capacity {
            let excess = store.entries.len() - store.capacity;
            store.entries.drain(..excess);
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::error::ComicError::corrupt(path, e))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_exceeds_capacity() {
        let mut history = HistoryStore::default();
        for i in 0..25 {
            history.push(format!("/comics/{}.cbz", i), i);
        }
        assert_eq!(history.len(), DEFAULT_HISTORY_CAPACITY);
        assert_eq!(history.entries()[0].path, PathBuf::from("/comics/15.cbz"));
        assert_eq!(history.entries()[9].path, PathBuf::from("/comics/24.cbz"));
    }

    #[test]
    fn test_readding_moves_to_most_recent() {
        let mut history = HistoryStore::new(3);
        history.push("/a.cbz", 1);
        history.push("/b.cbz", 2);
        history.push("/a.cbz", 7);

        assert_eq!(history.len(), 2);
        assert_eq!(history.entries()[1].path, PathBuf::from("/a.cbz"));
        assert_eq!(history.get(Path::new("/a.cbz")), Some(7));
        assert_eq!(history.get(Path::new("/missing.cbz")), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("history.json");
        let mut history = HistoryStore::new(4);
        history.push("/x.cbr", 3);
        history.save(&file).unwrap();

        let loaded = HistoryStore::load(&file).unwrap();
        assert_eq!(loaded, history);
    }

    #[test]
    fn test_load_garbage_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("history.json");
        std::fs::write(&file, b"not json").unwrap();
        assert!(HistoryStore::load(&file).is_err());
    }
}
