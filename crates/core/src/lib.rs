//! # comic-core
//!
//! Access and conversion core for comic and e-book archives.
//!
//! - **Reading**: open CBZ/ZIP, CBR/RAR, CB7/7Z, EPUB, PDF, image folders or
//!   single images, list their pages in natural order, and stream one page
//!   at a time from a cancellable worker.
//! - **Conversion**: batch-convert any readable source to CBZ, PDF, EPUB or
//!   an image folder, optionally resizing and re-encoding pages on the way.
//!
//! PDF pages are rendered with **pdfium**, archives are read with the `zip`,
//! `unrar` and `sevenz-rust` crates, and PDFs are written with `lopdf`.
//!
//! ## Reading
//!
//! ```rust,no_run
//! use comic_core::{Password, Reader, ReaderConfig, ReaderEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut reader = Reader::new(ReaderConfig::default())?;
//!     let events = reader.events();
//!
//!     reader
//!         .open_path(std::path::Path::new("Vol 1.cbz"), None, Password::None)
//!         .await?;
//!     reader.process_next_reply().await;
//!
//!     while let Ok(event) = events.try_recv() {
//!         if let ReaderEvent::PageReady { page_index, payload } = event {
//!             println!("page {} is {} ({} bytes)", page_index, payload.mime_type, payload.bytes.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Batch Conversion with Progress
//!
//! ```rust,no_run
//! use comic_core::{
//!     ConversionOptions, ConversionProgress, ConversionRequest, Converter, ConverterConfig,
//!     OutputFormat,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = ConversionOptions::new(OutputFormat::Pdf).scale(50).quality(85);
//!     let converter = Converter::new(ConverterConfig::new(options))?;
//!
//!     let request = ConversionRequest::new(["Vol 1.cbr", "Vol 2.cb7"], "./output");
//!     let summary = converter
//!         .convert_batch(request, |progress: ConversionProgress| {
//!             println!(
//!                 "File {}/{}: {:?}",
//!                 progress.file_index + 1,
//!                 progress.total_files,
//!                 progress.phase
//!             );
//!         })
//!         .await?;
//!
//!     println!("{} converted, {} failed", summary.succeeded(), summary.errors);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod converter;
pub mod detect;
pub mod error;
pub mod history;
pub mod pack;
pub mod pdf_renderer;
pub mod reader;
pub mod session;
pub mod transform;
pub mod worker;
pub mod workspace;

#[cfg(test)]
mod test_util;

// Re-export main types for convenience
pub use backend::{ArchiveBackend, BackendRegistry, EntryListing, Password};
pub use config::{
    ConversionOptions, ConversionPhase, ConversionProgress, ConversionRequest, ConversionSummary,
    ConverterConfig, FailedFile, FileResult, OutputFormat, PageFormat, PdfDpiMethod, PngPage,
    ReaderConfig, RenderConfig,
};
pub use converter::{CancelHandle, Converter};
pub use detect::{detect_kind, FileKind};
pub use error::{ComicError, Result};
pub use history::{HistoryEntry, HistoryStore};
pub use pdf_renderer::PdfRenderer;
pub use reader::{Reader, ReaderEvent};
pub use session::{FileSession, LoadState};
pub use transform::{ImageTransformer, PageTransformer, ResizeSurface, TransformPlan};
pub use worker::{FailureTag, PagePayload};
pub use workspace::{cleanup_path, TempWorkspace};

/// Container extensions the reader and converter accept.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["cbz", "zip", "cbr", "rar", "cb7", "7z", "epub", "pdf"];

/// Check if a file extension names a supported container or page image.
pub fn is_supported_extension(ext: &str) -> bool {
    FileKind::from_extension(ext).is_some()
}

/// Initialize the library's logging.
/// Call this once at application startup if you want to see logs.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
