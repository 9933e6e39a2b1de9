//! # doclayout
//!
//! Turn PDFs and page images into structured layout, Markdown and DOCX using
//! a vision-language model.
//!
//! Each page is resized onto the model's alignment grid, sent with a layout
//! prompt, and the reply is parsed into [`LayoutCell`]s (bbox, category,
//! text). Boxes are mapped back onto the original page, an annotated image
//! and a Markdown rendering are written next to the cells, and the pages are
//! merged into one combined JSON, one Markdown document, a DOCX and a ZIP
//! bundle.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source (path / URL / image)
//!  │
//!  ├─ extract    rasterise pages via pdfium (spawn_blocking)
//!  ├─ recognize  bounded worker pool, one vision call per page
//!  │               normalize → prompt → infer → parse/repair → restore bboxes
//!  │               → annotated .jpg + .json cells + .md text
//!  └─ assemble   combined .json / .md, .jsonl, .docx, .zip
//! ```
//!
//! Progress of every job is observable through a shared [`ProgressRegistry`]
//! keyed by the source's content hash.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doclayout::{InputSource, Orchestrator, PipelineConfig, PromptMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / EDGEQUAKE_LLM_PROVIDER / …
//!     let config = PipelineConfig::builder()
//!         .prompt_mode(PromptMode::LayoutAll)
//!         .output_dir("output")
//!         .build()?;
//!     let orchestrator = Orchestrator::from_config(config)?;
//!     let job = orchestrator.run(InputSource::parse("report.pdf")?).await?;
//!     println!("{}", job.combined_md.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doclayout` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod aggregate;
pub mod config;
pub mod document;
pub mod error;
pub mod layout;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use aggregate::{ArtifactPaths, MergedDocument, PageEntry};
pub use config::{
    PageScope, PipelineConfig, PipelineConfigBuilder, PromptMode, ProviderChoice, RetryPolicy,
    WorkerPool,
};
pub use document::{DocumentRenderer, DocxRenderer};
pub use error::{PageError, PipelineError};
pub use layout::{BBox, Category, LayoutCell};
pub use orchestrator::{list_jobs, DocumentJob, JobSummary, Orchestrator};
pub use pipeline::inference::{InferenceFailure, LlmVisionModel, VisionModel};
pub use pipeline::input::InputSource;
pub use pipeline::normalize::{normalize, SizeBudget};
pub use pipeline::page::PageResult;
pub use pipeline::render::{PdfiumRasterizer, Rasterizer};
pub use progress::{JobProgress, ProgressRegistry, Stage, StageProgress};
