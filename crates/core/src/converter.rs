//! Batch conversion: extract, optionally transform, then pack each input.
//!
//! Each input gets its own [`TempWorkspace`]. The phases run in order with a
//! cancel check at every boundary and before each page transform; the
//! workspace is removed on every exit path. A failing input is recorded and
//! the batch moves on; a cancel ends the batch.

use crate::backend::{BackendRegistry, Password};
use crate::config::{
    ConversionPhase, ConversionProgress, ConversionRequest, ConversionSummary, ConverterConfig,
    FailedFile, FileResult,
};
use crate::error::{ComicError, Result};
use crate::pack::{collect_pages, pack};
use crate::transform::{PageTransformer, ResizeSurface, TransformPlan};
use crate::workspace::TempWorkspace;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Cancels the running job of a [`Converter`] from anywhere.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    transformer: Arc<dyn PageTransformer>,
}

impl CancelHandle {
    /// Request cancellation. The transformer is told as well.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.transformer.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Clears the running flag when a job ends.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs one conversion job at a time.
pub struct Converter {
    config: ConverterConfig,
    registry: Arc<BackendRegistry>,
    transformer: Arc<dyn PageTransformer>,
    cancel: Arc<AtomicBool>,
    active: AtomicBool,
}

impl Converter {
    /// Converter with the built-in backends and a [`ResizeSurface`].
    pub fn new(config: ConverterConfig) -> Result<Self> {
        let surface: Arc<dyn PageTransformer> = Arc::new(ResizeSurface::new()?);
        Self::with_transformer(config, surface)
    }

    /// Converter with a custom page transformer.
    pub fn with_transformer(
        config: ConverterConfig,
        transformer: Arc<dyn PageTransformer>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing converter: {:?}, scale {}%, quality {}",
            config.options.output_format, config.options.scale, config.options.quality
        );
        Ok(Self {
            registry: Arc::new(BackendRegistry::new(config.render.clone())),
            config,
            transformer,
            cancel: Arc::new(AtomicBool::new(false)),
            active: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.cancel),
            transformer: Arc::clone(&self.transformer),
        }
    }

    /// Cancel the running job, if any.
    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Convert every input of `request` in order.
    ///
    /// # Errors
    ///
    /// `JobAlreadyRunning` if another batch is in progress on this converter.
    /// Per-file failures are reported in the summary, not as an error.
    pub async fn convert_batch<F>(
        &self,
        request: ConversionRequest,
        progress: F,
    ) -> Result<ConversionSummary>
    where
        F: Fn(ConversionProgress) + Send + Sync,
    {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ComicError::JobAlreadyRunning);
        }
        let _guard = ActiveGuard(&self.active);
        self.cancel.store(false, Ordering::Release);
        self.transformer.reset();

        let start = Instant::now();
        let password = Password::from(request.password.clone());
        let total_files = request.inputs.len();
        let mut summary = ConversionSummary {
            total: total_files,
            ..Default::default()
        };

        for (file_index, input) in request.inputs.iter().enumerate() {
            if self.is_canceled() {
                summary.canceled = true;
                break;
            }

            let current_file = input
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string();
            let report = |phase: ConversionPhase, pages_completed: usize, total_pages: Option<usize>| {
                progress(ConversionProgress {
                    file_index,
                    total_files,
                    current_file: current_file.clone(),
                    pages_completed,
                    total_pages,
                    phase,
                })
            };

            match self
                .convert_file(input, &request.output_dir, &password, &report)
                .await
            {
                Ok(result) => {
                    summary.attempted += 1;
                    report(
                        ConversionPhase::Completed,
                        result.page_count,
                        Some(result.page_count),
                    );
                    summary.successful.push(result);
                }
                Err(ComicError::Canceled) => {
                    info!("Conversion canceled during {:?}", input);
                    report(ConversionPhase::Canceled, 0, None);
                    summary.canceled = true;
                    break;
                }
                Err(e) => {
                    error!("Failed to convert {:?}: {}", input, e);
                    summary.attempted += 1;
                    summary.errors += 1;
                    report(ConversionPhase::Failed, 0, None);
                    summary.failed.push(FailedFile {
                        input_path: input.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        summary.total_duration = start.elapsed();
        info!(
            "Batch finished: {} of {} converted, {} failed, {} not started{}",
            summary.succeeded(),
            summary.total,
            summary.errors,
            summary.not_started(),
            if summary.canceled { " (canceled)" } else { "" }
        );
        Ok(summary)
    }

    fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.is_canceled() {
            Err(ComicError::Canceled)
        } else {
            Ok(())
        }
    }

    /// One input through every phase. The workspace is removed whatever
    /// the outcome.
    async fn convert_file<R>(
        &self,
        input: &Path,
        output_dir: &Path,
        password: &Password,
        report: &R,
    ) -> Result<FileResult>
    where
        R: Fn(ConversionPhase, usize, Option<usize>),
    {
        let start = Instant::now();
        let mut workspace = TempWorkspace::create()?;
        let outcome = self
            .run_phases(input, output_dir, password, workspace.path(), report)
            .await;

        report(ConversionPhase::CleaningUp, 0, None);
        workspace.cleanup();

        let (output_path, page_count) = outcome?;
        info!(
            "Converted {:?} to {:?} ({} pages) in {:?}",
            input,
            output_path,
            page_count,
            start.elapsed()
        );
        Ok(FileResult {
            input_path: input.to_path_buf(),
            output_path,
            page_count,
            duration: start.elapsed(),
        })
    }

    async fn run_phases<R>(
        &self,
        input: &Path,
        output_dir: &Path,
        password: &Password,
        workspace: &Path,
        report: &R,
    ) -> Result<(PathBuf, usize)>
    where
        R: Fn(ConversionPhase, usize, Option<usize>),
    {
        let options = self.config.options.clone();

        // Extract
        self.check_cancel()?;
        report(ConversionPhase::Extracting, 0, None);
        let extracted = {
            let registry = Arc::clone(&self.registry);
            let input = input.to_path_buf();
            let dest = workspace.to_path_buf();
            let password = password.clone();
            tokio::task::spawn_blocking(move || {
                let (kind, backend) = registry.for_path(&input)?;
                debug!("Extracting {:?} ({:?}) with {}", input, kind, backend.name());
                backend.extract_all(&input, &dest, &password)
            })
            .await??
        };
        if extracted == 0 {
            return Err(ComicError::extraction(input, "no page images found"));
        }
        debug!("Extracted {} pages from {:?}", extracted, input);

        // Transform
        self.check_cancel()?;
        let plan = TransformPlan::from_options(&options);
        let pending: Vec<PathBuf> = collect_pages(workspace)?
            .into_iter()
            .filter(|page| plan.needs_transform(page))
            .collect();
        if !pending.is_empty() {
            let total = pending.len();
            report(ConversionPhase::Transforming, 0, Some(total));
            for (done, page) in pending.into_iter().enumerate() {
                self.check_cancel()?;
                let transformer = Arc::clone(&self.transformer);
                tokio::task::spawn_blocking(move || transformer.transform(&page, &plan))
                    .await??;
                report(ConversionPhase::Transforming, done + 1, Some(total));
            }
        } else {
            debug!("Pages of {:?} need no transform", input);
        }

        // Pack
        self.check_cancel()?;
        let pages = collect_pages(workspace)?;
        let page_count = pages.len();
        report(ConversionPhase::Packing, 0, Some(page_count));
        let output_path = {
            let root = workspace.to_path_buf();
            let output_dir = output_dir.to_path_buf();
            let stem = output_stem(input);
            tokio::task::spawn_blocking(move || pack(&pages, &root, &output_dir, &stem, &options))
                .await??
        };
        Ok((output_path, page_count))
    }
}

/// Base name for the output of `input`.
fn output_stem(input: &Path) -> String {
    let name = if input.is_dir() {
        input.file_name()
    } else {
        input.file_stem()
    };
    name.map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "output".to_string())
}
