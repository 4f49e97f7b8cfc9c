//! Archive backends: one implementation per [`FileKind`], behind a single table.
//!
//! Every backend lists the page images of a container, extracts a single page on
//! demand and bulk-extracts all pages for the conversion pipeline. Listing and
//! extraction are independent: `extract_entry` never relies on a previous
//! `list_page_entries` call.

pub mod epub;
pub mod folder;
pub mod pdf;
pub mod rar;
pub mod sevenz;
pub mod zip;

use crate::config::RenderConfig;
use crate::detect::{detect_kind, is_image_name, FileKind};
use crate::error::{ComicError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Password supplied for an encrypted container.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Password {
    /// No password was given.
    #[default]
    None,
    /// A user-supplied secret.
    Secret(String),
}

impl Password {
    /// The secret, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Password::None => None,
            Password::Secret(s) => Some(s.as_str()),
        }
    }

    /// Whether a secret was given.
    pub fn is_set(&self) -> bool {
        matches!(self, Password::Secret(_))
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Password::None => f.write_str("Password::None"),
            Password::Secret(_) => f.write_str("Password::Secret(***)"),
        }
    }
}

impl From<Option<String>> for Password {
    fn from(value: Option<String>) -> Self {
        value.map(Password::Secret).unwrap_or_default()
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Password::Secret(value.to_string())
    }
}

/// Page entries of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryListing {
    /// Opaque per-page identifiers in reading order.
    pub entries: Vec<String>,
    /// The pages are encrypted and no password was supplied.
    pub password_required: bool,
}

impl EntryListing {
    pub(crate) fn open(entries: Vec<String>) -> Self {
        Self {
            entries,
            password_required: false,
        }
    }
}

/// Uniform access to the pages of one kind of container.
pub trait ArchiveBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// List page images in reading order.
    ///
    /// # Errors
    ///
    /// `PasswordRequired` for a wrong password, `UnsupportedEncryption` for
    /// schemes the archive stack cannot decode, `CorruptOrUnreadable` otherwise.
    fn list_page_entries(&self, path: &Path, password: &Password) -> Result<EntryListing>;

    /// Read the bytes of one page entry.
    fn extract_entry(&self, path: &Path, entry: &str, password: &Password) -> Result<Vec<u8>>;

    /// Write every page image below `dest`, returning how many were written.
    fn extract_all(&self, path: &Path, dest: &Path, password: &Password) -> Result<usize>;
}

/// The `FileKind -> ArchiveBackend` table shared by the reader and the converter.
pub struct BackendRegistry {
    backends: HashMap<FileKind, Box<dyn ArchiveBackend>>,
}

impl BackendRegistry {
    /// Registry with every built-in backend. PDF pages render with `render`.
    pub fn new(render: RenderConfig) -> Self {
        let mut registry = Self {
            backends: HashMap::new(),
        };
        registry.register(FileKind::Zip, zip::ZipBackend);
        registry.register(FileKind::Rar, rar::RarBackend);
        registry.register(FileKind::SevenZip, sevenz::SevenZipBackend);
        registry.register(FileKind::Epub, epub::EpubBackend);
        registry.register(FileKind::Pdf, pdf::PdfBackend::new(render));
        registry.register(FileKind::ImageFolder, folder::FolderBackend);
        registry.register(FileKind::Image, folder::ImageFileBackend);
        registry
    }

    /// Replace the backend for a kind.
    pub fn register<B: ArchiveBackend + 'static>(&mut self, kind: FileKind, backend: B) {
        self.backends.insert(kind, Box::new(backend));
    }

    /// Backend for a kind.
    pub fn get(&self, kind: FileKind) -> Option<&dyn ArchiveBackend> {
        self.backends.get(&kind).map(|b| &**b)
    }

    /// Detect a path's kind and return it with its backend.
    pub fn for_path(&self, path: &Path) -> Result<(FileKind, &dyn ArchiveBackend)> {
        let kind = detect_kind(path).ok_or_else(|| ComicError::UnsupportedFormat(path.into()))?;
        let backend = self
            .get(kind)
            .ok_or_else(|| ComicError::UnsupportedFormat(path.into()))?;
        Ok((kind, backend))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(RenderConfig::default())
    }
}

/// Sort names so that `page2` comes before `page10`.
pub fn sort_naturally(names: &mut [String]) {
    names.sort_by(|a, b| natord::compare_ignore_case(a, b));
}

/// The page a password is checked against: the first encrypted one in
/// reading order. Archives may mix plain and encrypted entries.
pub(crate) fn password_check_entry<'a>(
    entries: &'a [String],
    encrypted: &HashSet<String>,
) -> Option<&'a str> {
    entries
        .iter()
        .find(|name| encrypted.contains(*name))
        .map(String::as_str)
}

/// Whether an archive entry name is a page image. Resource forks are skipped.
pub(crate) fn is_page_entry(name: &str) -> bool {
    if name.ends_with('/') || name.starts_with("__MACOSX/") || name.contains("/__MACOSX/") {
        return false;
    }
    let file_name = name.rsplit('/').next().unwrap_or(name);
    !file_name.starts_with("._") && is_image_name(file_name)
}

/// Normalize separators of an archive entry name.
pub(crate) fn normalize_entry_name(name: &str) -> String {
    name.replace('\\', "/")
}

/// Resolve an entry name below `dest`, refusing absolute and parent components.
pub(crate) fn sanitize_entry_path(dest: &Path, name: &str) -> Option<PathBuf> {
    let mut out = dest.to_path_buf();
    let mut pushed = false;
    for component in Path::new(&normalize_entry_name(name)).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    pushed.then_some(out)
}

/// Write one extracted entry below `dest`.
pub(crate) fn write_entry(archive: &Path, dest: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    let target = sanitize_entry_path(dest, name)
        .ok_or_else(|| ComicError::extraction(archive, format!("unsafe entry path '{}'", name)))?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, data)?;
    Ok(target)
}
