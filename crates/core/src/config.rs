//! Configuration and request/result types for page access and conversion.

use crate::error::{ComicError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for PDF page rasterization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Default output DPI (dots per inch).
    /// Default: 300.
    pub dpi: u32,

    /// Upper bound for the larger side of a rendered page, in pixels.
    /// Default: 5000.
    pub max_dimension: u32,

    /// Number of threads for parallel PNG encoding.
    /// Default: number of CPU cores.
    pub render_threads: usize,

    /// PNG compression level (0-9, higher = smaller file, slower).
    /// Default: 6.
    pub png_compression: u8,

    /// Whether to keep the alpha channel (transparency).
    /// Default: false.
    pub use_alpha: bool,

    /// Background color for pages (if not using alpha).
    /// Default: white (255, 255, 255).
    pub background_color: (u8, u8, u8),
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_dimension: 5000,
            render_threads: num_cpus::get(),
            png_compression: 6,
            use_alpha: false,
            background_color: (255, 255, 255),
        }
    }
}

impl RenderConfig {
    /// Create a render config with specified DPI.
    pub fn with_dpi(dpi: u32) -> Self {
        Self {
            dpi,
            ..Default::default()
        }
    }

    /// Set the pixel cap for the larger page side.
    pub fn max_dimension(mut self, pixels: u32) -> Self {
        self.max_dimension = pixels;
        self
    }

    /// Set the number of encoder threads.
    pub fn render_threads(mut self, threads: usize) -> Self {
        self.render_threads = threads;
        self
    }

    /// Set PNG compression level.
    pub fn png_compression(mut self, level: u8) -> Self {
        self.png_compression = level.min(9);
        self
    }

    /// Enable alpha channel.
    pub fn use_alpha(mut self, enabled: bool) -> Self {
        self.use_alpha = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.dpi == 0 || self.dpi > 1200 {
            return Err(ComicError::InvalidConfig(
                "dpi must be between 1 and 1200".to_string(),
            ));
        }
        if self.max_dimension < 16 {
            return Err(ComicError::InvalidConfig(
                "max_dimension must be at least 16 pixels".to_string(),
            ));
        }
        if self.render_threads == 0 {
            return Err(ComicError::InvalidConfig(
                "render_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reader behavior: sibling chaining, history size and page rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Open the next container in the folder when paging past the last page.
    pub auto_open_next: bool,

    /// Open the previous container in the folder when paging before the first page.
    pub auto_open_previous: bool,

    /// Number of recently opened files remembered.
    /// Default: 10.
    pub history_capacity: usize,

    /// Rendering settings for PDF pages.
    pub render: RenderConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            auto_open_next: false,
            auto_open_previous: false,
            history_capacity: 10,
            render: RenderConfig::default(),
        }
    }
}

impl ReaderConfig {
    /// Enable or disable chaining into the next sibling file.
    pub fn auto_open_next(mut self, enabled: bool) -> Self {
        self.auto_open_next = enabled;
        self
    }

    /// Enable or disable chaining into the previous sibling file.
    pub fn auto_open_previous(mut self, enabled: bool) -> Self {
        self.auto_open_previous = enabled;
        self
    }

    /// Set the history capacity.
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the PDF render configuration.
    pub fn render(mut self, render: RenderConfig) -> Self {
        self.render = render;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(ComicError::InvalidConfig(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        self.render.validate()
    }
}

/// Container produced by a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Zip of page images.
    Cbz,
    /// One image per PDF page.
    Pdf,
    /// Image-only EPUB 3 book.
    Epub,
    /// Plain directory of page images (extract tool).
    Folder,
}

impl OutputFormat {
    /// File extension of the produced container, `None` for folders.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            OutputFormat::Cbz => Some("cbz"),
            OutputFormat::Pdf => Some("pdf"),
            OutputFormat::Epub => Some("epub"),
            OutputFormat::Folder => None,
        }
    }
}

/// Image codec for pages written by a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageFormat {
    /// Keep each page's existing codec.
    Keep,
    Jpeg,
    Png,
    Webp,
}

impl PageFormat {
    /// Canonical file extension, `None` for [`PageFormat::Keep`].
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            PageFormat::Keep => None,
            PageFormat::Jpeg => Some("jpg"),
            PageFormat::Png => Some("png"),
            PageFormat::Webp => Some("webp"),
        }
    }

    /// Whether a page with the given file extension is already in this format.
    pub fn matches_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        match self {
            PageFormat::Keep => true,
            PageFormat::Jpeg => ext == "jpg" || ext == "jpeg",
            PageFormat::Png => ext == "png",
            PageFormat::Webp => ext == "webp",
        }
    }
}

/// How the physical page size of a generated PDF is derived from pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PdfDpiMethod {
    /// Use the JFIF density stored in the image, 300 when absent.
    Metadata,
    Fixed300,
    Fixed72,
}

/// Options for one conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOptions {
    /// Target container.
    pub output_format: OutputFormat,

    /// Page codec for the target.
    pub page_format: PageFormat,

    /// Scale in percent, 25 to 400. 100 keeps the pixel size.
    pub scale: u32,

    /// Encoder quality for lossy codecs, 0 to 100.
    /// Default: 80.
    pub quality: u8,

    /// Page sizing for PDF output.
    pub pdf_dpi: PdfDpiMethod,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Cbz,
            page_format: PageFormat::Keep,
            scale: 100,
            quality: 80,
            pdf_dpi: PdfDpiMethod::Metadata,
        }
    }
}

impl ConversionOptions {
    /// Options targeting the given container with default page handling.
    pub fn new(output_format: OutputFormat) -> Self {
        Self {
            output_format,
            ..Default::default()
        }
    }

    /// Set the page codec.
    pub fn page_format(mut self, format: PageFormat) -> Self {
        self.page_format = format;
        self
    }

    /// Set the scale in percent.
    pub fn scale(mut self, percent: u32) -> Self {
        self.scale = percent;
        self
    }

    /// Set the lossy encoder quality.
    pub fn quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    /// Set the PDF page sizing method.
    pub fn pdf_dpi(mut self, method: PdfDpiMethod) -> Self {
        self.pdf_dpi = method;
        self
    }

    /// Page codec actually written. PDF pages are always JPEG.
    pub fn effective_page_format(&self) -> PageFormat {
        match self.output_format {
            OutputFormat::Pdf => PageFormat::Jpeg,
            _ => self.page_format,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(25..=400).contains(&self.scale) {
            return Err(ComicError::InvalidConfig(
                "scale must be between 25 and 400".to_string(),
            ));
        }
        if self.quality > 100 {
            return Err(ComicError::InvalidConfig(
                "quality must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// Combined configuration for the converter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Render configuration used when a source is a PDF.
    pub render: RenderConfig,

    /// Output options.
    pub options: ConversionOptions,
}

impl ConverterConfig {
    /// Create a converter config for the given target.
    pub fn new(options: ConversionOptions) -> Self {
        Self {
            render: RenderConfig::default(),
            options,
        }
    }

    /// Validate the entire configuration.
    pub fn validate(&self) -> Result<()> {
        self.render.validate()?;
        self.options.validate()?;
        Ok(())
    }
}

/// A batch conversion request.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Source containers or image folders, processed in order.
    pub inputs: Vec<PathBuf>,

    /// Directory receiving the produced files.
    pub output_dir: PathBuf,

    /// Password tried on encrypted sources.
    pub password: Option<String>,
}

impl ConversionRequest {
    /// Create a new conversion request.
    pub fn new<I, P>(inputs: I, output_dir: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            output_dir: output_dir.into(),
            password: None,
        }
    }

    /// Set the password for encrypted sources.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Progress information for a conversion operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionProgress {
    /// Index of the current file being processed.
    pub file_index: usize,

    /// Total number of files to process.
    pub total_files: usize,

    /// Name of the current file.
    pub current_file: String,

    /// Pages finished in the current phase.
    pub pages_completed: usize,

    /// Total pages in the current file (if known).
    pub total_pages: Option<usize>,

    /// Current phase of processing.
    pub phase: ConversionPhase,
}

/// Phase of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionPhase {
    /// Pulling page images into the workspace.
    Extracting,
    /// Resizing or re-encoding pages.
    Transforming,
    /// Writing the target container.
    Packing,
    /// Removing the workspace.
    CleaningUp,
    /// Completed successfully.
    Completed,
    /// Failed with error.
    Failed,
    /// Stopped by a cancel request.
    Canceled,
}

/// Outcome of a batch conversion.
#[derive(Debug, Clone, Default)]
pub struct ConversionSummary {
    /// Number of inputs in the request.
    pub total: usize,

    /// Inputs whose job ran to an end, successful or failed. A job cut
    /// short by a cancel is not counted.
    pub attempted: usize,

    /// Started jobs that failed.
    pub errors: usize,

    /// Whether the batch stopped on a cancel request.
    pub canceled: bool,

    /// Successfully produced outputs.
    pub successful: Vec<FileResult>,

    /// Failed conversions.
    pub failed: Vec<FailedFile>,

    /// Total processing time.
    pub total_duration: Duration,
}

impl ConversionSummary {
    /// Jobs that completed.
    pub fn succeeded(&self) -> usize {
        self.attempted.saturating_sub(self.errors)
    }

    /// Inputs left unconverted because of a cancel.
    pub fn not_started(&self) -> usize {
        self.total.saturating_sub(self.attempted)
    }
}

/// Result for a single successfully converted file.
#[derive(Debug, Clone)]
pub struct FileResult {
    /// Original input path.
    pub input_path: PathBuf,

    /// Produced container or folder.
    pub output_path: PathBuf,

    /// Number of pages.
    pub page_count: usize,

    /// Processing time for this file.
    pub duration: Duration,
}

/// Information about a failed conversion.
#[derive(Debug, Clone)]
pub struct FailedFile {
    /// Original input path.
    pub input_path: PathBuf,

    /// Error message.
    pub error: String,
}

/// A single rendered PDF page.
#[derive(Debug, Clone)]
pub struct PngPage {
    /// Page number (1-indexed).
    pub page_number: usize,

    /// PNG image data.
    pub data: Vec<u8>,

    /// Image width in pixels.
    pub width: u32,

    /// Image height in pixels.
    pub height: u32,

    /// Path where the PNG was written (if saved to disk).
    pub output_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // RenderConfig tests
    #[test]
    fn test_render_config_defaults() {
        let config = RenderConfig::default();
        assert_eq!(config.dpi, 300);
        assert_eq!(config.max_dimension, 5000);
        assert!(config.render_threads > 0);
        assert_eq!(config.png_compression, 6);
        assert!(!config.use_alpha);
        assert_eq!(config.background_color, (255, 255, 255));
    }

    #[test]
    fn test_render_config_builder_pattern() {
        let config = RenderConfig::with_dpi(72)
            .max_dimension(2000)
            .render_threads(2)
            .png_compression(9)
            .use_alpha(true);

        assert_eq!(config.dpi, 72);
        assert_eq!(config.max_dimension, 2000);
        assert_eq!(config.render_threads, 2);
        assert_eq!(config.png_compression, 9);
        assert!(config.use_alpha);
    }

    #[test]
    fn test_render_config_png_compression_clamped() {
        let config = RenderConfig::default().png_compression(15);
        assert_eq!(config.png_compression, 9);
    }

    #[test]
    fn test_render_config_validation() {
        assert!(RenderConfig::with_dpi(300).validate().is_ok());

        let mut config = RenderConfig::default();
        config.dpi = 0;
        assert!(config.validate().is_err());

        let mut config = RenderConfig::default();
        config.dpi = 1201;
        assert!(config.validate().is_err());

        let mut config = RenderConfig::default();
        config.render_threads = 0;
        assert!(config.validate().is_err());

        let config = RenderConfig::default().max_dimension(4);
        assert!(config.validate().is_err());
    }

    // ReaderConfig tests
    #[test]
    fn test_reader_config_defaults() {
        let config = ReaderConfig::default();
        assert!(!config.auto_open_next);
        assert!(!config.auto_open_previous);
        assert_eq!(config.history_capacity, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reader_config_zero_history_rejected() {
        let config = ReaderConfig::default().history_capacity(0);
        assert!(matches!(config.validate(), Err(ComicError::InvalidConfig(_))));
    }

    #[test]
    fn test_reader_config_serde_roundtrip() {
        let config = ReaderConfig::default()
            .auto_open_next(true)
            .history_capacity(5);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReaderConfig = serde_json::from_str(&json).unwrap();
        assert!(parsed.auto_open_next);
        assert!(!parsed.auto_open_previous);
        assert_eq!(parsed.history_capacity, 5);
    }

    // ConversionOptions tests
    #[test]
    fn test_conversion_options_defaults() {
        let options = ConversionOptions::default();
        assert_eq!(options.output_format, OutputFormat::Cbz);
        assert_eq!(options.page_format, PageFormat::Keep);
        assert_eq!(options.scale, 100);
        assert_eq!(options.quality, 80);
        assert_eq!(options.pdf_dpi, PdfDpiMethod::Metadata);
    }

    #[test]
    fn test_conversion_options_scale_bounds() {
        assert!(ConversionOptions::default().scale(25).validate().is_ok());
        assert!(ConversionOptions::default().scale(400).validate().is_ok());
        assert!(ConversionOptions::default().scale(24).validate().is_err());
        assert!(ConversionOptions::default().scale(401).validate().is_err());
    }

    #[test]
    fn test_conversion_options_quality_clamped() {
        let options = ConversionOptions::default().quality(150);
        assert_eq!(options.quality, 100);
    }

    #[test]
    fn test_pdf_target_forces_jpeg_pages() {
        let options = ConversionOptions::new(OutputFormat::Pdf).page_format(PageFormat::Png);
        assert_eq!(options.effective_page_format(), PageFormat::Jpeg);

        let options = ConversionOptions::new(OutputFormat::Cbz).page_format(PageFormat::Png);
        assert_eq!(options.effective_page_format(), PageFormat::Png);
    }

    #[test]
    fn test_page_format_matches_extension() {
        assert!(PageFormat::Jpeg.matches_extension("JPEG"));
        assert!(PageFormat::Jpeg.matches_extension("jpg"));
        assert!(!PageFormat::Jpeg.matches_extension("png"));
        assert!(PageFormat::Keep.matches_extension("bmp"));
    }

    #[test]
    fn test_output_format_extension() {
        assert_eq!(OutputFormat::Cbz.extension(), Some("cbz"));
        assert_eq!(OutputFormat::Epub.extension(), Some("epub"));
        assert_eq!(OutputFormat::Folder.extension(), None);
    }

    // ConversionRequest tests
    #[test]
    fn test_conversion_request_new() {
        let request = ConversionRequest::new(["a.cbz", "b.cbr"], "/output");
        assert_eq!(request.inputs.len(), 2);
        assert_eq!(request.output_dir, PathBuf::from("/output"));
        assert!(request.password.is_none());
    }

    #[test]
    fn test_conversion_request_with_password() {
        let request = ConversionRequest::new(["a.cbz"], "/output").with_password("secret");
        assert_eq!(request.password.as_deref(), Some("secret"));
    }

    // ConversionSummary tests
    #[test]
    fn test_summary_counts() {
        let summary = ConversionSummary {
            total: 5,
            attempted: 3,
            errors: 1,
            canceled: true,
            ..Default::default()
        };
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.not_started(), 2);
    }

    #[test]
    fn test_conversion_phase_variants() {
        assert_ne!(ConversionPhase::Extracting, ConversionPhase::Completed);
        assert_eq!(ConversionPhase::Canceled, ConversionPhase::Canceled);
    }
}
