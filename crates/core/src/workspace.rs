//! Per-job scratch directories under the OS temp root.
//!
//! Deletion is confined to strict descendants of the canonical temp root, so
//! a bad path can never take user files with it.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Prefix of every job workspace directory.
pub const WORKSPACE_PREFIX: &str = "comic-job-";

/// Scratch directory owned by one conversion job.
#[derive(Debug)]
pub struct TempWorkspace {
    path: PathBuf,
    cleaned: bool,
}

impl TempWorkspace {
    /// Create `<temp>/comic-job-<uuid>`.
    pub fn create() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("{}{}", WORKSPACE_PREFIX, Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        debug!("Created workspace {:?}", path);
        Ok(Self {
            path,
            cleaned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the workspace. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if !self.cleaned {
            cleanup_path(&self.path);
            self.cleaned = true;
        }
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Recursively delete `path` if it lies strictly inside the OS temp root.
///
/// Returns whether anything was removed. Missing paths and paths outside the
/// temp root are left alone; removal failures are logged.
pub fn cleanup_path(path: &Path) -> bool {
    if !path.exists() {
        debug!("Nothing to clean at {:?}", path);
        return false;
    }

    let root = match std::env::temp_dir().canonicalize() {
        Ok(root) => root,
        Err(e) => {
            warn!("Cannot resolve temp root: {}", e);
            return false;
        }
    };
    let target = match path.canonicalize() {
        Ok(target) => target,
        Err(e) => {
            warn!("Cannot resolve {:?}: {}", path, e);
            return false;
        }
    };
    if target == root || !target.starts_with(&root) {
        warn!("Refusing to delete {:?}: outside {:?}", target, root);
        return false;
    }

    let mut failures = 0usize;
    for entry in WalkDir::new(&target).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cannot walk {:?}: {}", target, e);
                failures += 1;
                continue;
            }
        };
        let removed = if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        if let Err(e) = removed {
            warn!("Failed to remove {:?}: {}", entry.path(), e);
            failures += 1;
        }
    }

    if failures == 0 {
        debug!("Removed workspace {:?}", target);
    }
    !target.exists()
}
