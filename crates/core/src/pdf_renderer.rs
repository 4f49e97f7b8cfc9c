//! PDF page rasterization using pdfium (Google's PDF engine).
//!
//! Pages are rendered one at a time because a pdfium document is not
//! thread-safe. PNG encoding of rendered pages runs on a rayon pool.
//!
//! Resolution follows [`resolve_dpi`]: pages render at the configured DPI,
//! raised to the native resolution of the largest embedded image when that
//! image is bigger than the raster, and capped so the longer side stays
//! within `max_dimension` pixels.

use crate::backend::Password;
use crate::config::{PngPage, RenderConfig};
use crate::error::{ComicError, Result};
use image::RgbaImage;
use pdfium_render::prelude::*;
use rayon::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Environment variable naming a directory that holds the pdfium library.
pub const PDFIUM_PATH_ENV: &str = "PDFIUM_DYNAMIC_LIB_PATH";

/// PDF to PNG renderer using pdfium.
pub struct PdfRenderer {
    config: RenderConfig,
    pdfium: Pdfium,
    /// Rayon pool for PNG encoding.
    thread_pool: rayon::ThreadPool,
}

fn bind_pdfium() -> Result<Pdfium> {
    let mut dirs = vec![
        "./".to_string(),
        "/usr/lib".to_string(),
        "/usr/local/lib".to_string(),
    ];
    if let Ok(dir) = std::env::var(PDFIUM_PATH_ENV) {
        dirs.push(dir);
    }

    let bindings = dirs
        .iter()
        .find_map(|dir| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)).ok()
        })
        .map(Ok)
        .unwrap_or_else(Pdfium::bind_to_system_library)
        .map_err(|e| ComicError::PdfiumError(format!("Failed to load pdfium library: {}", e)))?;

    Ok(Pdfium::new(bindings))
}

fn map_load_error(path: &Path, error: PdfiumError) -> ComicError {
    match error {
        PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError) => {
            ComicError::PasswordRequired(path.to_path_buf())
        }
        other => ComicError::corrupt(path, format!("Failed to load PDF: {}", other)),
    }
}

impl PdfRenderer {
    /// Create a new PDF renderer.
    pub fn new(config: RenderConfig) -> Result<Self> {
        config.validate()?;

        let pdfium = bind_pdfium()?;

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.render_threads)
            .build()
            .map_err(|e| {
                ComicError::InvalidConfig(format!("Failed to create thread pool: {}", e))
            })?;

        info!(
            "PDF renderer initialized with {} threads, {} DPI",
            config.render_threads, config.dpi
        );

        Ok(Self {
            config,
            pdfium,
            thread_pool,
        })
    }

    /// Get the configured default DPI.
    pub fn dpi(&self) -> u32 {
        self.config.dpi
    }

    fn load<'a>(&'a self, path: &Path, password: &'a Password) -> Result<PdfDocument<'a>> {
        self.pdfium
            .load_pdf_from_file(path, password.as_str())
            .map_err(|e| map_load_error(path, e))
    }

    /// Number of pages in a PDF.
    pub fn page_count(&self, path: &Path, password: &Password) -> Result<usize> {
        let document = self.load(path, password)?;
        Ok(document.pages().len() as usize)
    }

    /// Page sizes of a PDF without rendering it.
    pub fn pdf_info(&self, path: &Path, password: &Password) -> Result<PdfInfo> {
        let document = self.load(path, password)?;
        let page_count = document.pages().len() as usize;
        let mut pages = Vec::with_capacity(page_count);

        for (i, page) in document.pages().iter().enumerate() {
            pages.push(PageInfo {
                page_number: i + 1,
                width_points: page.width().value,
                height_points: page.height().value,
            });
        }

        Ok(PdfInfo { page_count, pages })
    }

    /// Render one page (0-based) to PNG.
    pub fn render_page(&self, path: &Path, index: usize, password: &Password) -> Result<PngPage> {
        let start = Instant::now();
        let document = self.load(path, password)?;
        let page_count = document.pages().len() as usize;
        if index >= page_count {
            return Err(ComicError::EntryNotFound {
                path: path.to_path_buf(),
                entry: (index + 1).to_string(),
            });
        }

        let image = self.rasterize(&document, index)?;
        let data = encode_png_standalone(&image, self.config.png_compression)?;
        debug!("Rendered page {} of {:?} in {:?}", index + 1, path, start.elapsed());

        Ok(PngPage {
            page_number: index + 1,
            data,
            width: image.width(),
            height: image.height(),
            output_path: None,
        })
    }

    /// Render every page into `output_dir` as `page_0001.png`, `page_0002.png`, ...
    ///
    /// Pages are rendered in batches of `render_threads` so that only one
    /// batch of raw bitmaps is held in memory while it is encoded.
    pub fn render_to_dir(
        &self,
        path: &Path,
        output_dir: &Path,
        password: &Password,
    ) -> Result<Vec<PngPage>> {
        let start = Instant::now();
        std::fs::create_dir_all(output_dir)?;

        let document = self.load(path, password)?;
        let page_count = document.pages().len() as usize;
        debug!("Rendering {} pages from {:?}", page_count, path);

        let batch_size = self.config.render_threads.max(1);
        let compression = self.config.png_compression;
        let mut pages = Vec::with_capacity(page_count);

        let mut first = 0;
        while first < page_count {
            let last = (first + batch_size).min(page_count);
            let mut raw_images: Vec<(usize, RgbaImage)> = Vec::with_capacity(last - first);
            for page_idx in first..last {
                raw_images.push((page_idx, self.rasterize(&document, page_idx)?));
            }

            let encoded: Vec<Result<PngPage>> = self.thread_pool.install(|| {
                raw_images
                    .into_par_iter()
                    .map(|(page_idx, image)| {
                        let data = encode_png_standalone(&image, compression)?;
                        let output_path = page_path(output_dir, page_idx + 1);
                        std::fs::write(&output_path, &data)?;
                        Ok(PngPage {
                            page_number: page_idx + 1,
                            data,
                            width: image.width(),
                            height: image.height(),
                            output_path: Some(output_path),
                        })
                    })
                    .collect()
            });

            for page in encoded {
                pages.push(page?);
            }
            first = last;
        }

        pages.sort_by_key(|p| p.page_number);
        debug!("Rendered {} pages in {:?}", page_count, start.elapsed());
        Ok(pages)
    }

    /// Rasterize one page at its resolved DPI.
    fn rasterize(&self, document: &PdfDocument, page_idx: usize) -> Result<RgbaImage> {
        let page = document.pages().get(page_idx as u16).map_err(|e| {
            ComicError::PdfRenderError(format!("Failed to get page {}: {}", page_idx + 1, e))
        })?;

        let width_pt = page.width().value;
        let height_pt = page.height().value;
        let dpi = resolve_dpi(width_pt, height_pt, largest_embedded_image(&page), &self.config);
        let scale = dpi / 72.0;
        let width = ((width_pt * scale) as i32).max(1);
        let height = ((height_pt * scale) as i32).max(1);

        let render_config = PdfRenderConfig::new()
            .set_target_width(width)
            .set_target_height(height)
            .rotate_if_landscape(PdfPageRenderRotation::None, false);

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            ComicError::PdfRenderError(format!("Failed to render page {}: {}", page_idx + 1, e))
        })?;

        let rgba_image: RgbaImage = bitmap.as_image().into_rgba8();
        Ok(if self.config.use_alpha {
            rgba_image
        } else {
            apply_background(rgba_image, self.config.background_color)
        })
    }
}

/// Pixel size of the largest image object on a page.
fn largest_embedded_image(page: &PdfPage) -> Option<(u32, u32)> {
    page.objects()
        .iter()
        .filter_map(|object| {
            let image = object.as_image_object()?;
            match image.get_raw_image() {
                Ok(raw) => Some((raw.width(), raw.height())),
                Err(e) => {
                    warn!("Skipping unreadable embedded image: {}", e);
                    None
                }
            }
        })
        .max_by_key(|(w, h)| u64::from(*w) * u64::from(*h))
}

/// Output DPI for a page of `width_pt` x `height_pt` points.
///
/// `embedded_px` is the pixel size of the page's largest embedded image.
pub fn resolve_dpi(
    width_pt: f32,
    height_pt: f32,
    embedded_px: Option<(u32, u32)>,
    config: &RenderConfig,
) -> f32 {
    let mut dpi = config.dpi as f32;
    if width_pt <= 0.0 || height_pt <= 0.0 {
        return dpi;
    }

    if let Some((px_w, px_h)) = embedded_px {
        let raster_w = width_pt * dpi / 72.0;
        let raster_h = height_pt * dpi / 72.0;
        if px_w as f32 > raster_w || px_h as f32 > raster_h {
            let native = (px_w as f32 * 72.0 / width_pt).max(px_h as f32 * 72.0 / height_pt);
            dpi = dpi.max(native);
        }
    }

    let longest_pt = width_pt.max(height_pt);
    if longest_pt * dpi / 72.0 > config.max_dimension as f32 {
        dpi = config.max_dimension as f32 * 72.0 / longest_pt;
    }
    dpi
}

/// File name used for a rendered page (1-based).
pub fn page_file_name(page_number: usize) -> String {
    format!("page_{:04}.png", page_number)
}

/// Blend transparent pixels over a solid background.
fn apply_background(mut image: RgbaImage, (r, g, b): (u8, u8, u8)) -> RgbaImage {
    for pixel in image.pixels_mut() {
        let alpha = pixel[3] as f32 / 255.0;
        if alpha < 1.0 {
            let inv_alpha = 1.0 - alpha;
            pixel[0] = ((pixel[0] as f32 * alpha) + (r as f32 * inv_alpha)) as u8;
            pixel[1] = ((pixel[1] as f32 * alpha) + (g as f32 * inv_alpha)) as u8;
            pixel[2] = ((pixel[2] as f32 * alpha) + (b as f32 * inv_alpha)) as u8;
            pixel[3] = 255;
        }
    }
    image
}

fn png_compression(level: u8) -> png::Compression {
    match level {
        0..=3 => png::Compression::Fast,
        4..=6 => png::Compression::Default,
        _ => png::Compression::Best,
    }
}

/// Standalone PNG encoding function (Send + Sync safe for parallel execution).
pub(crate) fn encode_png_standalone(image: &RgbaImage, level: u8) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());

    let mut encoder = png::Encoder::new(&mut buffer, image.width(), image.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_compression(png_compression(level));

    let mut writer = encoder
        .write_header()
        .map_err(|e| ComicError::PngEncodingError(format!("Failed to write PNG header: {}", e)))?;

    writer
        .write_image_data(image.as_raw())
        .map_err(|e| ComicError::PngEncodingError(format!("Failed to write PNG data: {}", e)))?;

    drop(writer);

    Ok(buffer.into_inner())
}

/// Information about a PDF document.
#[derive(Debug, Clone)]
pub struct PdfInfo {
    /// Number of pages.
    pub page_count: usize,
    /// Per-page information.
    pub pages: Vec<PageInfo>,
}

/// Information about a single PDF page.
#[derive(Debug, Clone)]
pub struct PageInfo {
    /// Page number (1-indexed).
    pub page_number: usize,
    /// Width in PDF points (1/72 inch).
    pub width_points: f32,
    /// Height in PDF points (1/72 inch).
    pub height_points: f32,
}

impl PageInfo {
    /// Get width in pixels at a given DPI.
    pub fn width_pixels(&self, dpi: f32) -> u32 {
        ((self.width_points * dpi) / 72.0) as u32
    }

    /// Get height in pixels at a given DPI.
    pub fn height_pixels(&self, dpi: f32) -> u32 {
        ((self.height_points * dpi) / 72.0) as u32
    }
}

/// Path of a rendered page file inside `dir`.
pub fn page_path(dir: &Path, page_number: usize) -> PathBuf {
    dir.join(page_file_name(page_number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    fn letter() -> (f32, f32) {
        (612.0, 792.0)
    }

    // ========== resolve_dpi ==========

    #[test]
    fn test_resolve_dpi_default_without_images() {
        let (w, h) = letter();
        let dpi = resolve_dpi(w, h, None, &RenderConfig::default());
        assert_eq!(dpi, 300.0);
    }

    #[test]
    fn test_resolve_dpi_small_embedded_image_keeps_default() {
        let (w, h) = letter();
        let dpi = resolve_dpi(w, h, Some((800, 1000)), &RenderConfig::default());
        assert_eq!(dpi, 300.0);
    }

    #[test]
    fn test_resolve_dpi_large_embedded_image_raises_dpi() {
        // 3400 px across 612 pt is exactly 400 DPI.
        let (w, h) = letter();
        let dpi = resolve_dpi(w, h, Some((3400, 4000)), &RenderConfig::default());
        assert!((dpi - 400.0).abs() < 0.01, "got {}", dpi);
    }

    #[test]
    fn test_resolve_dpi_capped_by_max_dimension() {
        let (w, h) = letter();
        let dpi = resolve_dpi(w, h, Some((9000, 12000)), &RenderConfig::default());
        let info = PageInfo {
            page_number: 1,
            width_points: w,
            height_points: h,
        };
        assert!(info.height_pixels(dpi) <= 5000);
        assert!(info.height_pixels(dpi) >= 4999);
    }

    #[test]
    fn test_resolve_dpi_cap_applies_to_default_dpi() {
        let config = RenderConfig::default().max_dimension(1000);
        let dpi = resolve_dpi(720.0, 360.0, None, &config);
        assert!((dpi - 100.0).abs() < 0.01, "got {}", dpi);
    }

    #[test]
    fn test_resolve_dpi_degenerate_page() {
        let dpi = resolve_dpi(0.0, 792.0, Some((5000, 5000)), &RenderConfig::with_dpi(150));
        assert_eq!(dpi, 150.0);
    }

    // ========== PageInfo ==========

    #[test]
    fn test_page_info_dimensions() {
        let info = PageInfo {
            page_number: 1,
            width_points: 612.0,
            height_points: 792.0,
        };

        assert_eq!(info.width_pixels(72.0), 612);
        assert_eq!(info.height_pixels(72.0), 792);
        assert_eq!(info.width_pixels(300.0), 2550);
        assert_eq!(info.height_pixels(300.0), 3300);
    }

    #[test]
    fn test_page_file_names_sort_in_page_order() {
        assert_eq!(page_file_name(1), "page_0001.png");
        assert_eq!(page_file_name(12), "page_0012.png");
        assert_eq!(
            page_path(Path::new("/tmp/ws"), 3),
            PathBuf::from("/tmp/ws/page_0003.png")
        );
    }

    // ========== encoding ==========

    #[test]
    fn test_encode_png_small_image() {
        let image = RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255]));
        let png_data = encode_png_standalone(&image, 6).unwrap();
        assert_eq!(&png_data[0..8], &PNG_MAGIC);
    }

    #[test]
    fn test_encode_png_every_compression_level() {
        let image = RgbaImage::from_pixel(4, 4, Rgba([0, 255, 0, 128]));
        for level in [0, 3, 6, 9] {
            let png_data = encode_png_standalone(&image, level).unwrap();
            assert_eq!(&png_data[0..8], &PNG_MAGIC);
            let decoded = image::load_from_memory(&png_data).unwrap();
            assert_eq!(decoded.width(), 4);
        }
    }

    #[test]
    fn test_apply_background_blends_transparency() {
        let mut image = RgbaImage::new(2, 1);
        image.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        image.put_pixel(1, 0, Rgba([10, 20, 30, 255]));

        let blended = apply_background(image, (255, 255, 255));
        assert_eq!(blended.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
        assert_eq!(blended.get_pixel(1, 0), &Rgba([10, 20, 30, 255]));
    }

    // ========== PdfRenderer (requires pdfium) ==========

    #[test]
    fn test_renderer_creation_with_invalid_config() {
        let mut config = RenderConfig::default();
        config.dpi = 0;
        assert!(PdfRenderer::new(config).is_err());
    }

    #[test]
    fn test_renderer_renders_generated_pdf() {
        let renderer = match PdfRenderer::new(RenderConfig::with_dpi(72)) {
            Ok(renderer) => renderer,
            Err(ComicError::PdfiumError(_)) => return,
            Err(e) => panic!("Unexpected error: {:?}", e),
        };
        let dir = tempfile::TempDir::new().unwrap();
        let pdf = dir.path().join("two.pdf");
        crate::test_util::write_pdf(&pdf, 2);

        assert_eq!(renderer.page_count(&pdf, &Password::None).unwrap(), 2);
        let page = renderer.render_page(&pdf, 1, &Password::None).unwrap();
        assert_eq!(page.page_number, 2);
        assert_eq!(&page.data[0..8], &PNG_MAGIC);

        let out = dir.path().join("out");
        let pages = renderer.render_to_dir(&pdf, &out, &Password::None).unwrap();
        assert_eq!(pages.len(), 2);
        assert!(out.join("page_0002.png").exists());

        let missing = renderer.render_page(&pdf, 5, &Password::None);
        assert!(matches!(missing, Err(ComicError::EntryNotFound { .. })));
    }
}
