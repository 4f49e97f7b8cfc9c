//! What is currently open: the reader's single-owner session state.

use crate::backend::Password;
use crate::detect::FileKind;
use crate::history::HistoryEntry;
use std::path::{Path, PathBuf};

/// Session load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    NotSet,
    Loading,
    Loaded,
}

/// The open file, its page list and view state.
#[derive(Debug, Clone, Default)]
pub struct FileSession {
    state: LoadState,
    kind: Option<FileKind>,
    path: PathBuf,
    name: String,
    entries: Vec<String>,
    page_index: usize,
    rotation: u16,
    password: Password,
}

/// Normalize degrees into `0..360`.
pub fn normalize_rotation(degrees: i32) -> u16 {
    degrees.rem_euclid(360) as u16
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

impl FileSession {
    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn kind(&self) -> Option<FileKind> {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn page_count(&self) -> usize {
        self.entries.len()
    }

    pub fn rotation(&self) -> u16 {
        self.rotation
    }

    pub fn password(&self) -> &Password {
        &self.password
    }

    pub fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    /// Entry id of the current page.
    pub fn current_entry(&self) -> Option<&str> {
        self.entries.get(self.page_index).map(String::as_str)
    }

    /// `(path, page_index)` to remember, if a file is loaded.
    pub fn history_entry(&self) -> Option<HistoryEntry> {
        self.is_loaded().then(|| HistoryEntry {
            path: self.path.clone(),
            page_index: self.page_index,
        })
    }

    /// Enter LOADING.
    pub fn begin_loading(&mut self) {
        self.state = LoadState::Loading;
    }

    /// Replace the session with a freshly opened file, still LOADING.
    pub fn populate(
        &mut self,
        kind: FileKind,
        path: PathBuf,
        entries: Vec<String>,
        page_index: usize,
        password: Password,
    ) {
        *self = Self {
            state: LoadState::Loading,
            kind: Some(kind),
            name: display_name(&path),
            path,
            page_index: page_index.min(entries.len().saturating_sub(1)),
            entries,
            rotation: 0,
            password,
        };
    }

    /// Move to page `index` (LOADING until the page arrives).
    pub fn set_page(&mut self, index: usize) {
        self.page_index = index;
        self.state = LoadState::Loading;
    }

    pub fn finish_loading(&mut self) {
        if self.state == LoadState::Loading {
            self.state = LoadState::Loaded;
        }
    }

    /// Store a rotation normalized to `0..360`.
    pub fn set_rotation(&mut self, degrees: i32) -> u16 {
        self.rotation = normalize_rotation(degrees);
        self.rotation
    }

    /// Clear everything back to NOT_SET.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
