//! Single-use page extraction workers.
//!
//! At most one worker is in flight. Submitting a new instruction aborts the
//! previous worker, and replies are matched against the current worker id so
//! a late reply from a replaced worker is never delivered.

use crate::backend::{BackendRegistry, Password};
use crate::detect::{mime_from_name, sniff_image_mime, FileKind};
use crate::error::ComicError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Identity of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(Uuid);

impl WorkerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// What a worker should fetch.
#[derive(Debug, Clone)]
pub struct PageInstruction {
    pub kind: FileKind,
    pub container_path: PathBuf,
    pub entry_id: String,
    pub password: Password,
}

/// Encoded page bytes with their MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl PagePayload {
    /// Build a payload, sniffing the MIME type from the bytes or the entry name.
    pub fn from_bytes(bytes: Vec<u8>, entry: &str) -> Self {
        let mime_type = sniff_image_mime(&bytes)
            .or_else(|| mime_from_name(entry))
            .unwrap_or("application/octet-stream")
            .to_string();
        Self { bytes, mime_type }
    }

    /// `data:<mime>;base64,<payload>` for direct display.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

/// Coarse failure category carried across the worker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureTag {
    PasswordRequired,
    UnsupportedEncryption,
    Corrupt,
    UnsupportedFormat,
    EntryNotFound,
    Internal,
}

impl fmt::Display for FailureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureTag::PasswordRequired => "password-required",
            FailureTag::UnsupportedEncryption => "unsupported-encryption",
            FailureTag::Corrupt => "corrupt",
            FailureTag::UnsupportedFormat => "unsupported-format",
            FailureTag::EntryNotFound => "entry-not-found",
            FailureTag::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// A tagged failure reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub tag: FailureTag,
    pub details: String,
}

impl WorkerFailure {
    pub fn tag_of(error: &ComicError) -> FailureTag {
        match error {
            ComicError::PasswordRequired(_) => FailureTag::PasswordRequired,
            ComicError::UnsupportedEncryption { .. } => FailureTag::UnsupportedEncryption,
            ComicError::CorruptOrUnreadable { .. } => FailureTag::Corrupt,
            ComicError::UnsupportedFormat(_) => FailureTag::UnsupportedFormat,
            ComicError::EntryNotFound { .. } => FailureTag::EntryNotFound,
            _ => FailureTag::Internal,
        }
    }

    /// Rebuild a [`ComicError`] on the receiving side.
    pub fn into_error(self, path: &Path, entry: &str) -> ComicError {
        match self.tag {
            FailureTag::PasswordRequired => ComicError::PasswordRequired(path.to_path_buf()),
            FailureTag::UnsupportedEncryption => ComicError::UnsupportedEncryption {
                path: path.to_path_buf(),
                scheme: self.details,
            },
            FailureTag::Corrupt | FailureTag::Internal => ComicError::corrupt(path, self.details),
            FailureTag::UnsupportedFormat => ComicError::UnsupportedFormat(path.to_path_buf()),
            FailureTag::EntryNotFound => ComicError::EntryNotFound {
                path: path.to_path_buf(),
                entry: entry.to_string(),
            },
        }
    }
}

impl From<&ComicError> for WorkerFailure {
    fn from(error: &ComicError) -> Self {
        let details = match error {
            ComicError::UnsupportedEncryption { scheme, .. } => scheme.clone(),
            other => other.to_string(),
        };
        Self {
            tag: Self::tag_of(error),
            details,
        }
    }
}

/// The single reply of a worker.
#[derive(Debug, Clone)]
pub struct WorkerReply {
    pub worker: WorkerId,
    pub outcome: std::result::Result<PagePayload, WorkerFailure>,
}

fn run_instruction(
    registry: &BackendRegistry,
    instruction: &PageInstruction,
) -> std::result::Result<PagePayload, WorkerFailure> {
    let backend = registry.get(instruction.kind).ok_or_else(|| WorkerFailure {
        tag: FailureTag::UnsupportedFormat,
        details: format!("no backend for {:?}", instruction.kind),
    })?;
    let bytes = backend
        .extract_entry(
            &instruction.container_path,
            &instruction.entry_id,
            &instruction.password,
        )
        .map_err(|e| WorkerFailure::from(&e))?;
    Ok(PagePayload::from_bytes(bytes, &instruction.entry_id))
}

/// Cancel-and-replace page worker.
pub struct PageWorker {
    registry: Arc<BackendRegistry>,
    tx: async_channel::Sender<WorkerReply>,
    rx: async_channel::Receiver<WorkerReply>,
    current: Option<(WorkerId, JoinHandle<()>)>,
}

impl PageWorker {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            registry,
            tx,
            rx,
            current: None,
        }
    }

    /// Start a worker for `instruction`, killing the one in flight.
    ///
    /// Must be called within a tokio runtime.
    pub fn submit(&mut self, instruction: PageInstruction) -> WorkerId {
        self.kill();

        let id = WorkerId::new();
        let registry = Arc::clone(&self.registry);
        let tx = self.tx.clone();
        debug!(
            "{} extracting '{}' from {:?}",
            id, instruction.entry_id, instruction.container_path
        );

        let handle = tokio::spawn(async move {
            let outcome =
                tokio::task::spawn_blocking(move || run_instruction(&registry, &instruction))
                    .await
                    .unwrap_or_else(|e| {
                        Err(WorkerFailure {
                            tag: FailureTag::Internal,
                            details: format!("worker task failed: {}", e),
                        })
                    });
            if tx.send(WorkerReply { worker: id, outcome }).await.is_err() {
                debug!("{} finished after its channel closed", id);
            }
        });

        self.current = Some((id, handle));
        id
    }

    /// Abort the in-flight worker, if any.
    pub fn kill(&mut self) {
        if let Some((id, handle)) = self.current.take() {
            handle.abort();
            debug!("Killed {}", id);
        }
    }

    /// The worker whose reply is awaited.
    pub fn current(&self) -> Option<WorkerId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Wait for the current worker's reply, dropping stale ones.
    ///
    /// Returns `None` when no worker is in flight. The worker is torn down
    /// once its reply is taken.
    pub async fn recv(&mut self) -> Option<WorkerReply> {
        loop {
            let current = self.current()?;
            let reply = self.rx.recv().await.ok()?;
            if reply.worker == current {
                self.current = None;
                return Some(reply);
            }
            debug!("Discarding stale reply from {}", reply.worker);
        }
    }
}

impl Drop for PageWorker {
    fn drop(&mut self) {
        self.kill();
    }
}
