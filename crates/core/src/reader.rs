//! The reader controller: opens files, pages through them and reports
//! progress as [`ReaderEvent`]s.
//!
//! The reader owns the one [`FileSession`], the [`HistoryStore`] and the page
//! worker. Archive pages are fetched by the worker; PDF pages are rendered
//! inline and complete within the request that asked for them.

use crate::backend::{BackendRegistry, EntryListing, Password};
use crate::config::ReaderConfig;
use crate::detect::{detect_kind, FileKind};
use crate::error::{ComicError, Result};
use crate::history::HistoryStore;
use crate::session::FileSession;
use crate::worker::{FailureTag, PageInstruction, PagePayload, PageWorker, WorkerFailure};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Notifications for whoever displays the pages.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    LoadingStarted,
    LoadingFinished,
    PageReady {
        page_index: usize,
        payload: PagePayload,
    },
    OpenFailed {
        path: PathBuf,
        tag: FailureTag,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Next,
    Previous,
}

/// Single controller for the open file.
pub struct Reader {
    config: ReaderConfig,
    registry: Arc<BackendRegistry>,
    session: FileSession,
    history: HistoryStore,
    worker: PageWorker,
    events_tx: async_channel::Sender<ReaderEvent>,
    events_rx: async_channel::Receiver<ReaderEvent>,
}

impl Reader {
    pub fn new(config: ReaderConfig) -> Result<Self> {
        let registry = Arc::new(BackendRegistry::new(config.render.clone()));
        Self::with_registry(config, registry)
    }

    /// Reader sharing an existing backend table.
    pub fn with_registry(config: ReaderConfig, registry: Arc<BackendRegistry>) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = async_channel::unbounded();
        Ok(Self {
            history: HistoryStore::new(config.history_capacity),
            worker: PageWorker::new(Arc::clone(&registry)),
            config,
            registry,
            session: FileSession::default(),
            events_tx,
            events_rx,
        })
    }

    /// Receiver for reader events.
    pub fn events(&self) -> async_channel::Receiver<ReaderEvent> {
        self.events_rx.clone()
    }

    pub fn session(&self) -> &FileSession {
        &self.session
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Replace the history, e.g. with one loaded from disk.
    pub fn set_history(&mut self, history: HistoryStore) {
        self.history = history;
    }

    /// Whether a page request is waiting for its worker.
    pub fn is_busy(&self) -> bool {
        self.worker.is_busy()
    }

    /// Open `path` and request its first page to show.
    ///
    /// The start page is `page_index` when given (clamped to the last page),
    /// else the page saved in history, else the opened image for a single
    /// image, else 0.
    ///
    /// # Errors
    ///
    /// `PasswordRequired` when the file is encrypted and `password` is missing
    /// or wrong; the caller may retry with a password. Any error leaves the
    /// session reset and emits [`ReaderEvent::OpenFailed`].
    pub async fn open_path(
        &mut self,
        path: &Path,
        page_index: Option<usize>,
        password: Password,
    ) -> Result<()> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.record_history();
        self.worker.kill();
        self.session.begin_loading();
        self.emit(ReaderEvent::LoadingStarted);
        info!("Opening {:?}", path);

        let (kind, listing) = match self.list(&path, &password).await {
            Ok(found) => found,
            Err(e) => return Err(self.fail_open(&path, e)),
        };
        if listing.password_required {
            return Err(self.fail_open(&path, ComicError::PasswordRequired(path.clone())));
        }
        if listing.entries.is_empty() {
            return Err(self.fail_open(&path, ComicError::corrupt(&path, "no page images found")));
        }

        let last = listing.entries.len() - 1;
        let start = match page_index {
            Some(explicit) => explicit.min(last),
            None => match self.history.get(&path) {
                Some(saved) => saved.min(last),
                None if kind == FileKind::Image => {
                    let own = path.to_string_lossy();
                    listing.entries.iter().position(|e| *e == own).unwrap_or(0)
                }
                None => 0,
            },
        };
        debug!("{:?}: {} pages, starting at {}", path, listing.entries.len(), start);

        self.session
            .populate(kind, path.clone(), listing.entries, start, password);
        self.request_page(start)
            .map_err(|e| self.fail_open(&path, e))
    }

    async fn list(&self, path: &Path, password: &Password) -> Result<(FileKind, EntryListing)> {
        let registry = Arc::clone(&self.registry);
        let path = path.to_path_buf();
        let password = password.clone();
        tokio::task::spawn_blocking(move || {
            let (kind, backend) = registry.for_path(&path)?;
            debug!("{:?} handled by the {} backend", path, backend.name());
            let listing = backend.list_page_entries(&path, &password)?;
            Ok((kind, listing))
        })
        .await?
    }

    /// Show page `index`. Out-of-range requests and requests while nothing is
    /// loaded are ignored and return `false`.
    pub fn go_to_page(&mut self, index: usize) -> bool {
        if !self.session.is_loaded() || index >= self.session.page_count() {
            debug!("Ignoring request for page {}", index);
            return false;
        }
        self.record_history();
        match self.request_page(index) {
            Ok(()) => true,
            Err(e) => {
                let path = self.session.path().to_path_buf();
                self.fail_open(&path, e);
                false
            }
        }
    }

    /// Advance one page, chaining into the next sibling file when enabled.
    pub async fn next_page(&mut self) -> Result<bool> {
        if !self.session.is_loaded() {
            return Ok(false);
        }
        let index = self.session.page_index();
        if index + 1 < self.session.page_count() {
            return Ok(self.go_to_page(index + 1));
        }
        if !self.config.auto_open_next {
            return Ok(false);
        }
        match sibling(self.session.path(), Direction::Next) {
            Some(next) => self.open_path(&next, Some(0), Password::None).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Go back one page, chaining into the previous sibling file at its last
    /// page when enabled.
    pub async fn prev_page(&mut self) -> Result<bool> {
        if !self.session.is_loaded() {
            return Ok(false);
        }
        let index = self.session.page_index();
        if index > 0 {
            return Ok(self.go_to_page(index - 1));
        }
        if !self.config.auto_open_previous {
            return Ok(false);
        }
        match sibling(self.session.path(), Direction::Previous) {
            Some(previous) => self
                .open_path(&previous, Some(usize::MAX), Password::None)
                .await
                .map(|_| true),
            None => Ok(false),
        }
    }

    /// Store the view rotation, normalized to `0..360`.
    pub fn set_rotation(&mut self, degrees: i32) -> u16 {
        self.session.set_rotation(degrees)
    }

    /// Remember the current position and close the file.
    pub fn close_current(&mut self) {
        self.record_history();
        self.worker.kill();
        if self.session.kind().is_some() {
            info!("Closing {:?}", self.session.path());
        }
        self.session.reset();
    }

    /// Wait for the pending page and publish it.
    ///
    /// Returns `None` when no page is pending, otherwise the page index shown
    /// or the error that reset the session.
    pub async fn process_next_reply(&mut self) -> Option<Result<usize>> {
        let reply = self.worker.recv().await?;
        let index = self.session.page_index();
        match reply.outcome {
            Ok(payload) => {
                self.page_ready(index, payload);
                Some(Ok(index))
            }
            Err(failure) => {
                let path = self.session.path().to_path_buf();
                let entry = self.session.current_entry().unwrap_or_default().to_string();
                let error = failure.into_error(&path, &entry);
                Some(Err(self.fail_open(&path, error)))
            }
        }
    }

    fn request_page(&mut self, index: usize) -> Result<()> {
        let kind = self
            .session
            .kind()
            .ok_or_else(|| ComicError::UnsupportedFormat(self.session.path().to_path_buf()))?;
        let entry = self
            .session
            .entries()
            .get(index)
            .cloned()
            .ok_or_else(|| ComicError::EntryNotFound {
                path: self.session.path().to_path_buf(),
                entry: index.to_string(),
            })?;

        if self.session.is_loaded() {
            self.emit(ReaderEvent::LoadingStarted);
        }
        self.session.set_page(index);

        if kind != FileKind::Pdf {
            self.worker.submit(PageInstruction {
                kind,
                container_path: self.session.path().to_path_buf(),
                entry_id: entry,
                password: self.session.password().clone(),
            });
            return Ok(());
        }

        let backend = self
            .registry
            .get(kind)
            .ok_or_else(|| ComicError::UnsupportedFormat(self.session.path().to_path_buf()))?;
        let bytes = backend.extract_entry(self.session.path(), &entry, self.session.password())?;
        self.page_ready(index, PagePayload::from_bytes(bytes, &entry));
        Ok(())
    }

    fn page_ready(&mut self, page_index: usize, payload: PagePayload) {
        self.session.finish_loading();
        self.emit(ReaderEvent::PageReady {
            page_index,
            payload,
        });
        self.emit(ReaderEvent::LoadingFinished);
    }

    fn record_history(&mut self) {
        if let Some(entry) = self.session.history_entry() {
            self.history.push(entry.path, entry.page_index);
        }
    }

    /// Reset after a failed open or page decode and report it.
    fn fail_open(&mut self, path: &Path, error: ComicError) -> ComicError {
        warn!("Failed to open {:?}: {}", path, error);
        self.worker.kill();
        self.session.reset();
        self.emit(ReaderEvent::OpenFailed {
            path: path.to_path_buf(),
            tag: WorkerFailure::tag_of(&error),
            reason: error.to_string(),
        });
        error
    }

    fn emit(&self, event: ReaderEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("Dropping reader event: {}", e);
        }
    }
}

/// The neighboring container of `path` in its folder, in natural order.
fn sibling(path: &Path, direction: Direction) -> Option<PathBuf> {
    let folder = path.parent()?;
    let mut candidates: Vec<PathBuf> = WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|p| p == path || detect_kind(p).is_some_and(|k| k.is_container()))
        .collect();
    candidates.sort_by(|a, b| {
        natord::compare_ignore_case(
            &a.file_name().unwrap_or_default().to_string_lossy(),
            &b.file_name().unwrap_or_default().to_string_lossy(),
        )
    });

    let position = candidates.iter().position(|p| p == path)?;
    let target = match direction {
        Direction::Next => position.checked_add(1)?,
        Direction::Previous => position.checked_sub(1)?,
    };
    candidates.get(target).cloned()
}
