//! PDF backend: entries are 1-based page numbers, pages are rendered to PNG.

use super::{ArchiveBackend, EntryListing, Password};
use crate::config::RenderConfig;
use crate::error::{ComicError, Result};
use crate::pdf_renderer::PdfRenderer;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Backend for PDF documents.
///
/// The pdfium binding is created on first use and shared afterwards.
pub struct PdfBackend {
    render: RenderConfig,
    renderer: Mutex<Option<Arc<PdfRenderer>>>,
}

impl PdfBackend {
    pub fn new(render: RenderConfig) -> Self {
        Self {
            render,
            renderer: Mutex::new(None),
        }
    }

    /// The shared renderer, binding pdfium if needed.
    pub fn renderer(&self) -> Result<Arc<PdfRenderer>> {
        let mut slot = self.renderer.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(renderer) = slot.as_ref() {
            return Ok(Arc::clone(renderer));
        }
        let renderer = Arc::new(PdfRenderer::new(self.render.clone())?);
        *slot = Some(Arc::clone(&renderer));
        Ok(renderer)
    }
}

/// Parse a 1-based page entry into a 0-based index.
pub fn page_index(path: &Path, entry: &str) -> Result<usize> {
    match entry.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n - 1),
        _ => Err(ComicError::EntryNotFound {
            path: path.to_path_buf(),
            entry: entry.to_string(),
        }),
    }
}

impl ArchiveBackend for PdfBackend {
    fn name(&self) -> &str {
        "pdf"
    }

    fn list_page_entries(&self, path: &Path, password: &Password) -> Result<EntryListing> {
        let count = self.renderer()?.page_count(path, password)?;
        debug!("{:?}: {} pages", path, count);
        Ok(EntryListing::open((1..=count).map(|n| n.to_string()).collect()))
    }

    fn extract_entry(&self, path: &Path, entry: &str, password: &Password) -> Result<Vec<u8>> {
        let index = page_index(path, entry)?;
        Ok(self.renderer()?.render_page(path, index, password)?.data)
    }

    fn extract_all(&self, path: &Path, dest: &Path, password: &Password) -> Result<usize> {
        Ok(self.renderer()?.render_to_dir(path, dest, password)?.len())
    }
}
