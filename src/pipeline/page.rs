//! Page processor: one page image in, persisted artifacts out.
//!
//! ```text
//! normalise ──▶ prompt ──▶ infer ──▶ parse/repair ──▶ annotate + markdown ──▶ persist
//! ```
//!
//! Recognition problems never escape as errors: an unsupported aspect ratio,
//! a failed or timed-out call, or an unusable reply all produce a degraded
//! [`PageResult`] (`filtered = true`) whose Markdown holds the reply or the
//! error text. Only failing to write artifacts is fatal, since the job could
//! not be assembled without them.

use crate::config::{PipelineConfig, PromptMode};
use crate::error::{PageError, PipelineError};
use crate::layout::{BBox, LayoutCell};
use crate::pipeline::annotate::{self, LabelFont};
use crate::pipeline::encode;
use crate::pipeline::inference::{infer_with_policy, VisionModel};
use crate::pipeline::markdown;
use crate::pipeline::parse::{self, ParseOutcome};
use crate::pipeline::transform::{to_normalized_space, PageGeometry};
use crate::prompts::build_prompt;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of one page. Content lives in the files it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based page index within the source document.
    pub page_no: usize,
    /// Height of the image sent to the model.
    pub input_height: u32,
    /// Width of the image sent to the model.
    pub input_width: u32,
    /// Structured cells, original-image pixels. Absent for degraded and
    /// plain-text pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_info_path: Option<PathBuf>,
    /// Annotated page image. Same presence rule as `layout_info_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_image_path: Option<PathBuf>,
    /// Page Markdown (or raw reply / error text when degraded).
    pub md_content_path: PathBuf,
    /// `true` when no usable layout could be obtained.
    pub filtered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
}

/// One unit of work for the processor.
#[derive(Debug, Clone)]
pub struct PageTask {
    pub page_no: usize,
    pub image: Arc<RgbImage>,
    /// Directory artifacts are written to.
    pub save_dir: PathBuf,
    /// File stem for this page's artifacts.
    pub save_name: String,
    /// Region for grounding mode, original-image pixels.
    pub region: Option<BBox>,
}

/// Processes pages against a shared model. Cheap to clone.
#[derive(Clone)]
pub struct PageProcessor {
    config: Arc<PipelineConfig>,
    model: Arc<dyn VisionModel>,
    font: Arc<LabelFont>,
}

impl PageProcessor {
    pub fn new(config: Arc<PipelineConfig>, model: Arc<dyn VisionModel>, font: Arc<LabelFont>) -> Self {
        Self { config, model, font }
    }

    /// Run the whole per-page pipeline for `task` in `mode`.
    pub async fn process(&self, task: PageTask, mode: PromptMode) -> Result<PageResult, PipelineError> {
        let start = Instant::now();
        let page = task.page_no + 1;
        let (orig_w, orig_h) = task.image.dimensions();
        let budget = self.config.size_budget();

        // ── 1. Normalise ─────────────────────────────────────────────────
        let (norm_h, norm_w) = match budget.apply(orig_h, orig_w) {
            Ok(size) => size,
            Err(e) => {
                let err = PageError::Normalization {
                    page,
                    detail: e.to_string(),
                };
                warn!("{err}");
                return self.degrade(&task, orig_h, orig_w, err.to_string(), err).await;
            }
        };
        let normalized = {
            let image = Arc::clone(&task.image);
            tokio::task::spawn_blocking(move || encode::resize(&image, norm_w, norm_h))
                .await
                .map_err(|e| PipelineError::Internal(format!("Resize task panicked: {e}")))?
        };
        debug!("Page {page}: {orig_w}x{orig_h} → {norm_w}x{norm_h}");

        // ── 2. Prompt ────────────────────────────────────────────────────
        let region = match (mode, task.region) {
            (PromptMode::GroundingOcr, Some(b)) => {
                to_normalized_space(&[b], orig_w, orig_h, norm_w, norm_h)?.first().copied()
            }
            _ => None,
        };
        let prompt = build_prompt(mode, region);

        // ── 3. Infer ─────────────────────────────────────────────────────
        let reply = infer_with_policy(
            self.model.as_ref(),
            page,
            &normalized,
            &prompt,
            Duration::from_secs(self.config.api_timeout_secs),
            &self.config.retry,
        )
        .await;
        let reply = match reply {
            Ok(text) => text,
            Err(err) => {
                warn!("Page {page} degraded: {err}");
                return self.degrade(&task, norm_h, norm_w, err.to_string(), err).await;
            }
        };

        // ── 4. Parse ─────────────────────────────────────────────────────
        let geometry = PageGeometry {
            orig_w,
            orig_h,
            input_w: norm_w,
            input_h: norm_h,
            budget,
        };
        let result = match parse::parse(&reply, mode, &geometry) {
            ParseOutcome::Raw(text) => {
                let md_path = task.save_dir.join(format!("{}.md", task.save_name));
                write_text(&md_path, &text).await?;
                PageResult {
                    page_no: task.page_no,
                    input_height: norm_h,
                    input_width: norm_w,
                    layout_info_path: None,
                    layout_image_path: None,
                    md_content_path: md_path,
                    filtered: false,
                    error: None,
                }
            }
            ParseOutcome::Degraded(text) => {
                warn!("Page {page}: reply is not a valid layout, keeping raw text");
                let err = PageError::OutputParse { page };
                return self.degrade(&task, norm_h, norm_w, text, err).await;
            }
            // ── 5 + 6. Render and persist ────────────────────────────────
            ParseOutcome::Cells(cells) => self.persist_layout(&task, mode, norm_h, norm_w, cells).await?,
        };

        debug!("Page {page}: done in {:?}", start.elapsed());
        Ok(result)
    }

    async fn persist_layout(
        &self,
        task: &PageTask,
        mode: PromptMode,
        norm_h: u32,
        norm_w: u32,
        cells: Vec<LayoutCell>,
    ) -> Result<PageResult, PipelineError> {
        let json_path = task.save_dir.join(format!("{}.json", task.save_name));
        let jpg_path = task.save_dir.join(format!("{}.jpg", task.save_name));
        let md_path = task.save_dir.join(format!("{}.md", task.save_name));

        let json = serde_json::to_string(&cells)
            .map_err(|e| PipelineError::Internal(format!("Cell serialisation failed: {e}")))?;
        write_text(&json_path, &json).await?;

        let image = Arc::clone(&task.image);
        let font = Arc::clone(&self.font);
        let skip_hf = self.config.skip_page_header_footer;
        let jpg = jpg_path.clone();
        let md_content = tokio::task::spawn_blocking(move || {
            let annotated = annotate::draw_layout(&image, &cells, &font);
            annotated
                .save_with_format(&jpg, ImageFormat::Jpeg)
                .map_err(|e| PipelineError::write(&jpg, std::io::Error::other(e)))?;
            Ok::<_, PipelineError>(if mode.produces_text() {
                markdown::assemble(&image, &cells, skip_hf)
            } else {
                String::new()
            })
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Render task panicked: {e}")))??;

        write_text(&md_path, &md_content).await?;

        Ok(PageResult {
            page_no: task.page_no,
            input_height: norm_h,
            input_width: norm_w,
            layout_info_path: Some(json_path),
            layout_image_path: Some(jpg_path),
            md_content_path: md_path,
            filtered: false,
            error: None,
        })
    }

    /// Persist `text` as the page's Markdown and mark the page filtered.
    async fn degrade(
        &self,
        task: &PageTask,
        input_height: u32,
        input_width: u32,
        text: String,
        error: PageError,
    ) -> Result<PageResult, PipelineError> {
        let md_path = task.save_dir.join(format!("{}.md", task.save_name));
        write_text(&md_path, &text).await?;
        Ok(PageResult {
            page_no: task.page_no,
            input_height,
            input_width,
            layout_info_path: None,
            layout_image_path: None,
            md_content_path: md_path,
            filtered: true,
            error: Some(error),
        })
    }
}

async fn write_text(path: &Path, content: &str) -> Result<(), PipelineError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| PipelineError::write(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::inference::InferenceFailure;
    use async_trait::async_trait;
    use image::Rgb;
    use std::sync::Mutex;

    /// Replies with a fixed text and records the prompt it saw.
    struct Scripted {
        reply: Result<String, InferenceFailure>,
        seen: Mutex<Vec<(u32, u32, String)>>,
    }

    impl Scripted {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl VisionModel for Scripted {
        async fn infer(&self, image: &RgbImage, prompt: &str) -> Result<String, InferenceFailure> {
            self.seen
                .lock()
                .unwrap()
                .push((image.width(), image.height(), prompt.to_string()));
            self.reply.clone()
        }
    }

    fn processor(model: Arc<dyn VisionModel>) -> PageProcessor {
        PageProcessor::new(Arc::new(PipelineConfig::default()), model, Arc::new(LabelFont::none()))
    }

    fn task(dir: &Path, w: u32, h: u32) -> PageTask {
        PageTask {
            page_no: 0,
            image: Arc::new(RgbImage::from_pixel(w, h, Rgb([255, 255, 255]))),
            save_dir: dir.to_path_buf(),
            save_name: "doc".into(),
            region: None,
        }
    }

    #[tokio::test]
    async fn title_reply_round_trips_to_original_space() {
        let dir = tempfile::tempdir().unwrap();
        let model = Scripted::ok(r#"[{"bbox":[0,0,101,39],"category":"Title","text":"Hello"}]"#);
        let result = processor(model.clone())
            .process(task(dir.path(), 800, 600), PromptMode::LayoutAll)
            .await
            .unwrap();

        assert!(!result.filtered);
        assert_eq!((result.input_width, result.input_height), (812, 588));
        let seen = model.seen.lock().unwrap();
        assert_eq!((seen[0].0, seen[0].1), (812, 588));

        let cells: Vec<LayoutCell> =
            serde_json::from_str(&std::fs::read_to_string(result.layout_info_path.unwrap()).unwrap())
                .unwrap();
        assert_eq!(cells[0].bbox, BBox::new(0, 0, 100, 40));
        assert_eq!(std::fs::read_to_string(&result.md_content_path).unwrap(), "Hello");
        assert!(result.layout_image_path.unwrap().exists());
    }

    #[tokio::test]
    async fn inference_failure_degrades_with_error_text() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(Scripted {
            reply: Err(InferenceFailure("connection refused".into())),
            seen: Mutex::new(Vec::new()),
        });
        let result = processor(model)
            .process(task(dir.path(), 300, 300), PromptMode::LayoutAll)
            .await
            .unwrap();

        assert!(result.filtered);
        assert!(result.layout_info_path.is_none());
        let md = std::fs::read_to_string(&result.md_content_path).unwrap();
        assert!(md.contains("connection refused"));
    }

    #[tokio::test]
    async fn prose_reply_is_kept_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let reply = "Sorry, I only see a blank page.";
        let result = processor(Scripted::ok(reply))
            .process(task(dir.path(), 300, 300), PromptMode::LayoutAll)
            .await
            .unwrap();
        assert!(result.filtered);
        assert_eq!(result.error, Some(PageError::OutputParse { page: 1 }));
        assert_eq!(std::fs::read_to_string(&result.md_content_path).unwrap(), reply);
    }

    #[tokio::test]
    async fn extreme_aspect_ratio_degrades_without_calling_model() {
        let dir = tempfile::tempdir().unwrap();
        let model = Scripted::ok("[]");
        let result = processor(model.clone())
            .process(task(dir.path(), 2010, 10), PromptMode::LayoutAll)
            .await
            .unwrap();
        assert!(result.filtered);
        assert!(matches!(result.error, Some(PageError::Normalization { .. })));
        assert!(model.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn layout_only_writes_empty_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let model = Scripted::ok(r#"[{"bbox":[10,10,100,100],"category":"Text"}]"#);
        let result = processor(model)
            .process(task(dir.path(), 300, 300), PromptMode::LayoutOnly)
            .await
            .unwrap();
        assert!(!result.filtered);
        assert!(result.layout_info_path.is_some());
        assert_eq!(std::fs::read_to_string(&result.md_content_path).unwrap(), "");
    }

    #[tokio::test]
    async fn ocr_mode_stores_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let result = processor(Scripted::ok("Line one\nLine two"))
            .process(task(dir.path(), 300, 300), PromptMode::Ocr)
            .await
            .unwrap();
        assert!(!result.filtered);
        assert!(result.layout_image_path.is_none());
        assert_eq!(
            std::fs::read_to_string(&result.md_content_path).unwrap(),
            "Line one\nLine two"
        );
    }

    #[tokio::test]
    async fn grounding_prompt_carries_normalised_region() {
        let dir = tempfile::tempdir().unwrap();
        let model = Scripted::ok("[]");
        let mut t = task(dir.path(), 800, 600);
        t.region = Some(BBox::new(0, 0, 100, 40));
        processor(model.clone())
            .process(t, PromptMode::GroundingOcr)
            .await
            .unwrap();
        let seen = model.seen.lock().unwrap();
        assert!(seen[0].2.ends_with("[0, 0, 101, 39]"), "prompt: {}", seen[0].2);
    }
}
