//! Page resize and re-encode.
//!
//! A [`PageTransformer`] rewrites one extracted page in place: it may scale
//! it, change its codec, or both. The default transformer is a
//! [`ResizeSurface`], a dedicated thread that owns all decoding and resizing
//! and carries its own cancel flag.

use crate::config::{ConversionOptions, PageFormat};
use crate::error::{ComicError, Result};
use crossbeam_channel::{Receiver, Sender};
use crate::pack::{jpeg_info, unique_output_path};
use image::codecs::jpeg::{JpegEncoder, PixelDensity, PixelDensityUnit};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// What to do to each page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformPlan {
    pub page_format: PageFormat,
    /// Percent, 100 keeps the size.
    pub scale: u32,
    /// Lossy encoder quality, 0 to 100.
    pub quality: u8,
}

impl TransformPlan {
    pub fn from_options(options: &ConversionOptions) -> Self {
        Self {
            page_format: options.effective_page_format(),
            scale: options.scale,
            quality: options.quality,
        }
    }

    /// Whether `page` has to be rewritten under this plan.
    pub fn needs_transform(&self, page: &Path) -> bool {
        if self.scale != 100 {
            return true;
        }
        let ext = page.extension().and_then(|e| e.to_str()).unwrap_or("");
        !self.page_format.matches_extension(ext)
    }

    /// Extension of the rewritten page.
    pub fn target_extension(&self, page: &Path) -> String {
        match self.page_format.extension() {
            Some(ext) => ext.to_string(),
            None => page
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png")
                .to_ascii_lowercase(),
        }
    }
}

/// Rewrites a single page.
pub trait PageTransformer: Send + Sync {
    /// Rewrite `page` under `plan`, returning the path of the result.
    ///
    /// The result replaces `page`; a codec change also changes the extension.
    fn transform(&self, page: &Path, plan: &TransformPlan) -> Result<PathBuf>;

    /// Stop accepting work; pending and later calls fail with `Canceled`.
    fn cancel(&self);

    /// Accept work again after a cancel.
    fn reset(&self);
}

/// Decode, scale and re-encode `page`, replacing it atomically.
///
/// A codec change never overwrites a sibling page that already carries the
/// new extension; the result gets a free name instead.
pub fn transform_image(page: &Path, plan: &TransformPlan) -> Result<PathBuf> {
    let data = std::fs::read(page)?;
    let image = ImageReader::new(Cursor::new(&data))
        .with_guessed_format()?
        .decode()?;
    let image = if plan.scale == 100 {
        image
    } else {
        let width = ((image.width() as u64 * plan.scale as u64) / 100).max(1) as u32;
        let height = ((image.height() as u64 * plan.scale as u64) / 100).max(1) as u32;
        image.resize_exact(width, height, FilterType::Lanczos3)
    };
    let density = jpeg_info(&data)
        .and_then(|info| info.density)
        .and_then(|density| scaled_density(density, plan.scale));

    let ext = plan.target_extension(page);
    let target = target_path(page, &ext);
    let dir = page.parent().unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        encode(&image, &ext, plan.quality, density, &mut writer)?;
        writer.flush()?;
    }
    if target == page {
        temp.persist(&target)
            .map_err(|e| ComicError::conversion(page, e.error))?;
    } else {
        temp.persist_noclobber(&target)
            .map_err(|e| ComicError::conversion(page, e.error))?;
        if let Err(e) = std::fs::remove_file(page) {
            warn!("Failed to remove replaced page {:?}: {}", page, e);
        }
    }
    debug!("Transformed {:?} -> {:?}", page, target);
    Ok(target)
}

/// Where the rewritten page goes. `p1.png` becomes `p1.jpg`, or
/// `p1.png.jpg` when a `p1.jpg` page already exists.
fn target_path(page: &Path, ext: &str) -> PathBuf {
    let target = page.with_extension(ext);
    if target == page || !target.exists() {
        return target;
    }
    let dir = page.parent().unwrap_or_else(|| Path::new("."));
    let name = page.file_name().unwrap_or_default().to_string_lossy();
    unique_output_path(dir, &name, Some(ext))
}

/// JFIF density for a page resized to `scale` percent, keeping its physical
/// size. Aspect-ratio densities carry over unchanged.
fn scaled_density((unit, x, y): (u8, u16, u16), scale: u32) -> Option<PixelDensity> {
    let scale_axis =
        |v: u16| (u64::from(v) * u64::from(scale) / 100).clamp(1, u64::from(u16::MAX)) as u16;
    let (unit, density) = match unit {
        0 => (PixelDensityUnit::PixelAspectRatio, (x, y)),
        1 => (PixelDensityUnit::Inches, (scale_axis(x), scale_axis(y))),
        2 => (PixelDensityUnit::Centimeters, (scale_axis(x), scale_axis(y))),
        _ => return None,
    };
    if density.0 == 0 || density.1 == 0 {
        return None;
    }
    Some(PixelDensity { density, unit })
}

fn encode<W: Write + std::io::Seek>(
    image: &DynamicImage,
    ext: &str,
    quality: u8,
    density: Option<PixelDensity>,
    writer: &mut W,
) -> Result<()> {
    match ext {
        "jpg" | "jpeg" => {
            let mut encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
            if let Some(density) = density {
                encoder.set_pixel_density(density);
            }
            DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
        }
        other => {
            let format = ImageFormat::from_extension(other).ok_or_else(|| {
                ComicError::InvalidConfig(format!("no encoder for '.{}' pages", other))
            })?;
            image.write_to(writer, format)?;
        }
    }
    Ok(())
}

/// Synchronous transformer running on the caller's thread.
#[derive(Debug, Default)]
pub struct ImageTransformer {
    canceled: AtomicBool,
}

impl PageTransformer for ImageTransformer {
    fn transform(&self, page: &Path, plan: &TransformPlan) -> Result<PathBuf> {
        if self.canceled.load(Ordering::Acquire) {
            return Err(ComicError::Canceled);
        }
        transform_image(page, plan)
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    fn reset(&self) {
        self.canceled.store(false, Ordering::Release);
    }
}

struct ResizeJob {
    page: PathBuf,
    plan: TransformPlan,
    reply: Sender<Result<PathBuf>>,
}

/// Transformer backed by one dedicated thread.
pub struct ResizeSurface {
    jobs: Option<Sender<ResizeJob>>,
    canceled: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ResizeSurface {
    pub fn new() -> Result<Self> {
        let (jobs, queue) = crossbeam_channel::unbounded();
        let canceled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&canceled);
        let thread = std::thread::Builder::new()
            .name("resize-surface".to_string())
            .spawn(move || Self::run(queue, flag))?;
        Ok(Self {
            jobs: Some(jobs),
            canceled,
            thread: Some(thread),
        })
    }

    fn run(queue: Receiver<ResizeJob>, canceled: Arc<AtomicBool>) {
        for job in queue {
            let result = if canceled.load(Ordering::Acquire) {
                Err(ComicError::Canceled)
            } else {
                transform_image(&job.page, &job.plan)
            };
            if job.reply.send(result).is_err() {
                debug!("Resize result for {:?} has no receiver", job.page);
            }
        }
        debug!("Resize surface stopped");
    }
}

impl PageTransformer for ResizeSurface {
    fn transform(&self, page: &Path, plan: &TransformPlan) -> Result<PathBuf> {
        if self.canceled.load(Ordering::Acquire) {
            return Err(ComicError::Canceled);
        }
        let stopped = || ComicError::ChannelError("resize surface stopped".to_string());
        let (reply, result) = crossbeam_channel::bounded(1);
        self.jobs
            .as_ref()
            .ok_or_else(stopped)?
            .send(ResizeJob {
                page: page.to_path_buf(),
                plan: *plan,
                reply,
            })
            .map_err(|_| stopped())?;
        result.recv().map_err(|_| stopped())?
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    fn reset(&self) {
        self.canceled.store(false, Ordering::Release);
    }
}

impl Drop for ResizeSurface {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Resize surface thread panicked");
            }
        }
    }
}
