//! Pipeline orchestrator: one document job from source to combined output.
//!
//! ```text
//! resolve ──▶ extract ──▶ recognize (bounded pool) ──▶ assemble
//!             rasterize    PageProcessor × pages       merge, JSON, MD, DOCX, ZIP
//! ```
//!
//! Stages run strictly in sequence. Pages inside `recognize` complete in any
//! order; results are sorted by page number before assembly. A degraded page
//! never fails the job, while rasterization, artifact writes and assembly
//! failures do: the job is then marked failed in the [`ProgressRegistry`] and
//! the error is returned.
//!
//! Work directories are keyed by content hash. When the final artifact of an
//! earlier run of the same content is already on disk, the job finishes
//! straight away with those artifacts (see
//! [`PipelineConfig::reuse_results`]).

use crate::aggregate::{self, ArtifactPaths};
use crate::config::{PipelineConfig, PromptMode, WorkerPool};
use crate::document::{self, DocumentRenderer, DocxRenderer};
use crate::error::PipelineError;
use crate::layout::BBox;
use crate::pipeline::annotate::LabelFont;
use crate::pipeline::inference::{LlmVisionModel, VisionModel};
use crate::pipeline::input::{self, InputSource, ResolvedSource, SourceKind};
use crate::pipeline::page::{PageProcessor, PageResult, PageTask};
use crate::pipeline::render::{self, PdfiumRasterizer, Rasterizer};
use crate::progress::{ProgressRegistry, Stage};
use futures::stream::{self, StreamExt};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// A finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentJob {
    pub hash_id: String,
    /// Base name of the source.
    pub name: String,
    pub work_dir: PathBuf,
    /// Pages in the source document, recognised or not.
    pub total_pages: usize,
    /// Recognised pages in page order.
    pub pages: Vec<PageResult>,
    pub combined_json: PathBuf,
    pub combined_md: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docx: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<PathBuf>,
    pub processing_time_secs: f64,
    /// Loaded from an earlier run. `total_pages` then counts the pages in
    /// the combined JSON.
    #[serde(default)]
    pub cached: bool,
}

impl DocumentJob {
    /// Pages that fell back to raw text.
    pub fn degraded_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.filtered).count()
    }
}

/// Drives jobs through extract → recognize → assemble.
///
/// Collaborators are trait objects so tests and embedders can swap the
/// model, the rasterizer and the document renderer.
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    model: Arc<dyn VisionModel>,
    rasterizer: Arc<dyn Rasterizer>,
    renderer: Arc<dyn DocumentRenderer>,
    font: Arc<LabelFont>,
    registry: ProgressRegistry,
}

impl Orchestrator {
    /// Orchestrator with pdfium rasterization and DOCX rendering.
    pub fn new(config: PipelineConfig, model: Arc<dyn VisionModel>) -> Self {
        let font = LabelFont::load(config.label_font.as_deref());
        if !font.is_available() {
            debug!("No label font found, annotated images will carry boxes only");
        }
        Self {
            rasterizer: Arc::new(PdfiumRasterizer::new(config.max_render_side)),
            renderer: Arc::new(DocxRenderer),
            font: Arc::new(font),
            registry: ProgressRegistry::new(),
            model,
            config: Arc::new(config),
        }
    }

    /// Orchestrator whose model comes from the configured LLM provider.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let model = LlmVisionModel::from_config(&config)?;
        Ok(Self::new(config, Arc::new(model)))
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Share an existing registry, e.g. one per server.
    pub fn with_registry(mut self, registry: ProgressRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_label_font(mut self, font: LabelFont) -> Self {
        self.font = Arc::new(font);
        self
    }

    pub fn registry(&self) -> &ProgressRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one job to completion.
    pub async fn run(&self, source: InputSource) -> Result<DocumentJob, PipelineError> {
        let resolved = self.prepare(source).await?;
        self.execute(resolved, None).await
    }

    /// Run one job in grounding mode, reading only inside `region`
    /// (original-image pixels) on every page.
    ///
    /// Fails with [`PipelineError::InvalidConfig`] unless the configured
    /// prompt mode is [`PromptMode::GroundingOcr`].
    pub async fn run_grounded(
        &self,
        source: InputSource,
        region: BBox,
    ) -> Result<DocumentJob, PipelineError> {
        self.check_region(Some(&region))?;
        let resolved = self.prepare(source).await?;
        self.execute(resolved, Some(region)).await
    }

    /// Resolve and register `source`, then run the job in the background.
    ///
    /// Returns the job's hash, usable with [`ProgressRegistry::snapshot`]
    /// while the job runs, and the handle yielding its outcome. `region`
    /// behaves as in [`Orchestrator::run_grounded`].
    pub async fn submit(
        self: Arc<Self>,
        source: InputSource,
        region: Option<BBox>,
    ) -> Result<(String, JoinHandle<Result<DocumentJob, PipelineError>>), PipelineError> {
        self.check_region(region.as_ref())?;
        let resolved = self.prepare(source).await?;
        let hash_id = resolved.hash_id.clone();
        let handle = tokio::spawn(async move { self.execute(resolved, region).await });
        Ok((hash_id, handle))
    }

    fn check_region(&self, region: Option<&BBox>) -> Result<(), PipelineError> {
        match region {
            Some(bbox) if self.config.prompt_mode != PromptMode::GroundingOcr => {
                Err(PipelineError::InvalidConfig(format!(
                    "Region {bbox} needs prompt mode GroundingOcr, configured {:?}",
                    self.config.prompt_mode
                )))
            }
            _ => Ok(()),
        }
    }

    async fn prepare(&self, source: InputSource) -> Result<ResolvedSource, PipelineError> {
        let resolved = input::resolve(source, self.config.download_timeout_secs).await?;
        self.registry.begin(&resolved.hash_id)?;
        info!(hash_id = %resolved.hash_id, name = %resolved.name, "Job started");
        Ok(resolved)
    }

    async fn execute(
        &self,
        resolved: ResolvedSource,
        region: Option<BBox>,
    ) -> Result<DocumentJob, PipelineError> {
        let start = Instant::now();
        let hash_id = resolved.hash_id.clone();

        match self.stages(resolved, region, start).await {
            Ok(job) => {
                self.registry.finish(
                    &hash_id,
                    &job.name,
                    job.total_pages,
                    job.processing_time_secs,
                );
                info!(
                    hash_id = %hash_id,
                    pages = job.pages.len(),
                    degraded = job.degraded_pages(),
                    "Job completed in {:.1}s",
                    job.processing_time_secs
                );
                Ok(job)
            }
            Err(e) => {
                error!(hash_id = %hash_id, "Job failed: {e}");
                self.registry.fail(&hash_id, e.to_string());
                Err(e)
            }
        }
    }

    async fn stages(
        &self,
        resolved: ResolvedSource,
        region: Option<BBox>,
        start: Instant,
    ) -> Result<DocumentJob, PipelineError> {
        let hash_id = resolved.hash_id.clone();
        let paths = ArtifactPaths::new(&self.config.output_dir, &resolved.name, &hash_id);

        if self.config.reuse_results {
            if let Some(job) = self.load_cached(&resolved, &paths, start).await {
                return Ok(job);
            }
        }

        // ── Extract ──────────────────────────────────────────────────────
        let (pages, paginated) = self.extract(&resolved).await?;
        let total_pages = pages.len();

        tokio::fs::create_dir_all(&paths.work_dir)
            .await
            .map_err(|e| PipelineError::write(&paths.work_dir, e))?;

        // ── Recognize ────────────────────────────────────────────────────
        let mut pages: Vec<Option<RgbImage>> = pages.into_iter().map(Some).collect();
        let tasks: Vec<PageTask> = self
            .config
            .page_scope
            .to_indices(total_pages)
            .into_iter()
            .filter_map(|idx| {
                let image = pages.get_mut(idx)?.take()?;
                Some(PageTask {
                    page_no: idx,
                    image: Arc::new(image),
                    save_dir: paths.work_dir.clone(),
                    save_name: paths.page_stem(idx, paginated),
                    region,
                })
            })
            .collect();
        drop(pages);
        let results = self.recognize(&hash_id, tasks).await?;

        // ── Assemble ─────────────────────────────────────────────────────
        let (docx, bundle) = self.assemble(&hash_id, &paths, &results).await?;

        Ok(DocumentJob {
            hash_id,
            name: resolved.name.clone(),
            work_dir: paths.work_dir.clone(),
            total_pages,
            pages: results,
            combined_json: paths.combined_json(),
            combined_md: paths.combined_md(),
            docx,
            bundle,
            processing_time_secs: start.elapsed().as_secs_f64(),
            cached: false,
        })
    }

    /// The job as left on disk by an earlier run, if that run got as far as
    /// its final artifact. An unreadable combined JSON counts as a miss.
    async fn load_cached(
        &self,
        resolved: &ResolvedSource,
        paths: &ArtifactPaths,
        start: Instant,
    ) -> Option<DocumentJob> {
        let hash_id = &resolved.hash_id;
        let marker = if self.config.render_document {
            paths.docx()
        } else {
            paths.combined_md()
        };
        if !tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            return None;
        }

        let combined = paths.combined_json();
        let entries = match tokio::fs::read_to_string(&combined).await {
            Ok(raw) => serde_json::from_str::<Vec<serde_json::Value>>(&raw).ok(),
            Err(_) => None,
        };
        let Some(entries) = entries else {
            warn!(hash_id = %hash_id, "{} unreadable, processing again", combined.display());
            return None;
        };

        // Per-page records are informational; a missing file leaves them out.
        let pages: Vec<PageResult> = tokio::fs::read_to_string(paths.results_jsonl())
            .await
            .map(|raw| {
                raw.lines()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default();

        let existing = |p: PathBuf| p.exists().then_some(p);
        let docx = existing(paths.docx());
        let bundle = existing(paths.zip());

        for stage in [Stage::Extract, Stage::Recognize, Stage::Assemble] {
            self.registry
                .update(hash_id, stage, 100.0, "Loaded cached result");
        }
        info!(hash_id = %hash_id, pages = entries.len(), "Reusing results in {}", paths.work_dir.display());

        Some(DocumentJob {
            hash_id: hash_id.clone(),
            name: resolved.name.clone(),
            work_dir: paths.work_dir.clone(),
            total_pages: entries.len(),
            pages,
            combined_json: combined,
            combined_md: paths.combined_md(),
            docx,
            bundle,
            processing_time_secs: start.elapsed().as_secs_f64(),
            cached: true,
        })
    }

    /// Rasterize the source. Returns the pages and whether the source is
    /// paginated (PDF) rather than a single image.
    async fn extract(
        &self,
        resolved: &ResolvedSource,
    ) -> Result<(Vec<RgbImage>, bool), PipelineError> {
        let hash_id = &resolved.hash_id;
        self.registry
            .update(hash_id, Stage::Extract, 10.0, "Loading document");

        let (pages, paginated) = match &resolved.kind {
            SourceKind::Pdf(path) => {
                self.registry
                    .update(hash_id, Stage::Extract, 50.0, "Rendering PDF pages");
                let pages = self
                    .rasterizer
                    .rasterize(path, self.config.dpi, None)
                    .await?;
                (pages, true)
            }
            SourceKind::Image(image) if self.config.upscale_images => {
                let (image, dpi, max_side) =
                    (image.clone(), self.config.dpi, self.config.max_render_side);
                let image = tokio::task::spawn_blocking(move || {
                    render::upscale_image(image, dpi, max_side)
                })
                .await
                .map_err(|e| PipelineError::Internal(format!("Upscale task panicked: {e}")))?;
                (vec![image], false)
            }
            SourceKind::Image(image) => (vec![image.clone()], false),
        };

        if pages.is_empty() {
            return Err(PipelineError::Rasterization {
                detail: "document has no pages".into(),
            });
        }
        info!(hash_id = %hash_id, pages = pages.len(), "Extracted");
        self.registry.update(
            hash_id,
            Stage::Extract,
            100.0,
            format!("Extracted {} pages", pages.len()),
        );
        Ok((pages, paginated))
    }

    async fn recognize(
        &self,
        hash_id: &str,
        tasks: Vec<PageTask>,
    ) -> Result<Vec<PageResult>, PipelineError> {
        let total = tasks.len();
        let workers = self.config.pool_size(total);
        let mode = self.config.prompt_mode;
        self.registry.update(
            hash_id,
            Stage::Recognize,
            0.0,
            format!("Recognizing {total} pages with {workers} workers"),
        );
        debug!(hash_id = %hash_id, workers, pool = ?self.config.worker_pool, "Dispatching pages");

        let processor = PageProcessor::new(
            Arc::clone(&self.config),
            Arc::clone(&self.model),
            Arc::clone(&self.font),
        );

        let outcomes: Vec<Result<PageResult, PipelineError>> = match self.config.worker_pool {
            WorkerPool::Tasks => {
                let pending: Vec<_> = tasks
                    .into_iter()
                    .map(|task| {
                        let processor = processor.clone();
                        let registry = self.registry.clone();
                        let hash_id = hash_id.to_string();
                        async move {
                            registry.log(&hash_id, format!("Processing page {}", task.page_no + 1));
                            let result = processor.process(task, mode).await;
                            if result.is_ok() {
                                registry.page_done(&hash_id, total);
                            }
                            result
                        }
                    })
                    .collect();
                stream::iter(pending)
                    .buffer_unordered(workers)
                    .collect()
                    .await
            }
            WorkerPool::Threads => {
                let permits = Arc::new(Semaphore::new(workers));
                let mut set = JoinSet::new();
                for task in tasks {
                    let processor = processor.clone();
                    let registry = self.registry.clone();
                    let permits = Arc::clone(&permits);
                    let hash_id = hash_id.to_string();
                    set.spawn(async move {
                        let _permit = permits
                            .acquire_owned()
                            .await
                            .map_err(|e| PipelineError::Internal(e.to_string()))?;
                        registry.log(&hash_id, format!("Processing page {}", task.page_no + 1));
                        let result = processor.process(task, mode).await;
                        if result.is_ok() {
                            registry.page_done(&hash_id, total);
                        }
                        result
                    });
                }
                let mut outcomes = Vec::with_capacity(total);
                while let Some(joined) = set.join_next().await {
                    outcomes.push(joined.unwrap_or_else(|e| {
                        Err(PipelineError::Internal(format!("Page worker panicked: {e}")))
                    }));
                }
                outcomes
            }
        };

        let mut results = outcomes.into_iter().collect::<Result<Vec<_>, _>>()?;
        results.sort_by_key(|r| r.page_no);

        let degraded = results.iter().filter(|r| r.filtered).count();
        self.registry.update(
            hash_id,
            Stage::Recognize,
            100.0,
            format!("Recognized {total} pages ({degraded} degraded)"),
        );
        Ok(results)
    }

    async fn assemble(
        &self,
        hash_id: &str,
        paths: &ArtifactPaths,
        results: &[PageResult],
    ) -> Result<(Option<PathBuf>, Option<PathBuf>), PipelineError> {
        self.registry
            .update(hash_id, Stage::Assemble, 10.0, "Merging pages");
        let merged = aggregate::merge(results).await?;

        self.registry
            .update(hash_id, Stage::Assemble, 40.0, "Saving combined JSON");
        let json = serde_json::to_string_pretty(&merged.pages)
            .map_err(|e| PipelineError::Aggregation(format!("Combined JSON: {e}")))?;
        write_file(&paths.combined_json(), json.as_bytes()).await?;

        let mut jsonl = String::new();
        for result in results {
            let line = serde_json::to_string(result)
                .map_err(|e| PipelineError::Aggregation(format!("Page record: {e}")))?;
            jsonl.push_str(&line);
            jsonl.push('\n');
        }
        write_file(&paths.results_jsonl(), jsonl.as_bytes()).await?;

        self.registry
            .update(hash_id, Stage::Assemble, 60.0, "Saving combined Markdown");
        write_file(&paths.combined_md(), merged.markdown.as_bytes()).await?;

        if !self.config.render_document {
            self.registry
                .update(hash_id, Stage::Assemble, 100.0, "Assembled");
            return Ok((None, None));
        }

        self.registry
            .update(hash_id, Stage::Assemble, 75.0, "Rendering DOCX");
        let docx_path = paths.docx();
        {
            let renderer = Arc::clone(&self.renderer);
            let markdown = merged.markdown;
            let target = docx_path.clone();
            tokio::task::spawn_blocking(move || renderer.render(&markdown, &target))
                .await
                .map_err(|e| PipelineError::Internal(format!("DOCX task panicked: {e}")))??;
        }

        self.registry
            .update(hash_id, Stage::Assemble, 90.0, "Packaging ZIP");
        let zip_path = {
            let paths = paths.clone();
            tokio::task::spawn_blocking(move || document::bundle(&paths))
                .await
                .map_err(|e| PipelineError::Internal(format!("ZIP task panicked: {e}")))??
        };

        self.registry
            .update(hash_id, Stage::Assemble, 100.0, "Assembled");
        Ok((Some(docx_path), Some(zip_path)))
    }
}

async fn write_file(path: &Path, content: &[u8]) -> Result<(), PipelineError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| PipelineError::write(path, e))
}

// ── Job listing ──────────────────────────────────────────────────────────

/// A job found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub name: String,
    pub hash_id: String,
    /// Entries in the combined JSON; 0 when it is missing or unreadable.
    pub pages: usize,
}

/// Scan `output_dir` for job work directories (`<base>_<hash>`).
///
/// A missing `output_dir` lists nothing.
pub fn list_jobs(output_dir: &Path) -> Result<Vec<JobSummary>, PipelineError> {
    let entries = match std::fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PipelineError::InvalidInput {
                input: output_dir.display().to_string(),
                reason: e.to_string(),
            })
        }
    };

    let mut jobs = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let Some((name, hash_id)) = dir_name.rsplit_once('_') else {
            continue;
        };
        if name.is_empty() || hash_id.is_empty() {
            continue;
        }
        let combined = ArtifactPaths::new(output_dir, name, hash_id).combined_json();
        let pages = std::fs::read_to_string(&combined)
            .ok()
            .and_then(|raw| serde_json::from_str::<Vec<serde_json::Value>>(&raw).ok())
            .map_or(0, |v| v.len());
        jobs.push(JobSummary {
            name: name.to_string(),
            hash_id: hash_id.to_string(),
            pages,
        });
    }
    jobs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.hash_id.cmp(&b.hash_id)));
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_jobs_splits_on_last_underscore() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path(), "annual_report", "0badc0de");
        std::fs::create_dir_all(&paths.work_dir).unwrap();
        std::fs::write(paths.combined_json(), r#"[{"page":0,"cells":[]},{"page":1,"cells":[]}]"#)
            .unwrap();
        std::fs::create_dir_all(dir.path().join("scan_12345678")).unwrap();
        std::fs::create_dir_all(dir.path().join("nounderscore")).unwrap();
        std::fs::write(dir.path().join("stray_file"), "").unwrap();

        let jobs = list_jobs(dir.path()).unwrap();
        assert_eq!(
            jobs,
            vec![
                JobSummary {
                    name: "annual_report".into(),
                    hash_id: "0badc0de".into(),
                    pages: 2
                },
                JobSummary {
                    name: "scan".into(),
                    hash_id: "12345678".into(),
                    pages: 0
                },
            ]
        );
    }

    #[test]
    fn missing_output_dir_lists_nothing() {
        assert!(list_jobs(Path::new("/no/such/output")).unwrap().is_empty());
    }
}
