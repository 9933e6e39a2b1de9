//! Configuration types for document layout processing.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. One struct holds every knob so a config can
//! be shared across workers behind an `Arc` and logged as a whole.

use crate::error::PipelineError;
use crate::pipeline::normalize::{
    SizeBudget, DEFAULT_FACTOR, DEFAULT_MAX_PIXELS, DEFAULT_MIN_PIXELS,
};
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Model used when a provider is chosen without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Configuration for a document job.
///
/// # Example
/// ```rust
/// use doclayout::{PipelineConfig, PromptMode};
///
/// let config = PipelineConfig::builder()
///     .dpi(150)
///     .max_workers(8)
///     .prompt_mode(PromptMode::LayoutAll)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Rasterisation DPI for PDF pages. Range: 72–400. Default: 200.
    pub dpi: u32,

    /// Longest rendered side in pixels before falling back to 72 DPI. Default: 4500.
    pub max_render_side: u32,

    /// Scale image inputs by `dpi / 72` before recognition, as if they were
    /// printed and rendered like a PDF page. Capped by `max_render_side`.
    /// Default: false.
    pub upscale_images: bool,

    /// Alignment factor for normalised image sides. Default: 28.
    pub factor: u32,

    /// Lower pixel budget for the normalised image. Default: 3136.
    pub min_pixels: u64,

    /// Upper pixel budget for the normalised image. Default: 11 289 600.
    pub max_pixels: u64,

    /// Upper bound on concurrently processed pages. Default: 64.
    ///
    /// The actual pool size for a job is `min(page_count, max_workers)`.
    pub max_workers: usize,

    /// How pages are fanned out. Default: [`WorkerPool::Tasks`].
    pub worker_pool: WorkerPool,

    /// Which instruction the model receives. Default: [`PromptMode::LayoutAll`].
    pub prompt_mode: PromptMode,

    /// Which pages of a document are recognised. Default: all.
    pub page_scope: PageScope,

    /// Per inference call timeout in seconds. Default: 600.
    pub api_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Retry behaviour for failed inference calls. Default: no retries.
    pub retry: RetryPolicy,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens generated per page. Default: 16 384.
    pub max_tokens: usize,

    /// Model identifier passed to the provider factory.
    /// Falls back to `EDGEQUAKE_MODEL`, then [`DEFAULT_MODEL`].
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "ollama").
    /// Falls back to `EDGEQUAKE_LLM_PROVIDER`. See [`PipelineConfig::provider_choice`].
    pub provider_name: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Root directory for job work directories. Default: `./output`.
    pub output_dir: PathBuf,

    /// Leave Page-header / Page-footer cells out of the assembled text.
    pub skip_page_header_footer: bool,

    /// Render the combined DOCX and ZIP bundle during assembly. Default: true.
    pub render_document: bool,

    /// Font used to label cells on the annotated image.
    pub label_font: Option<PathBuf>,

    /// Return the artifacts of an earlier run of the same content instead of
    /// recognising it again. Default: true.
    pub reuse_results: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_render_side: 4500,
            upscale_images: false,
            factor: DEFAULT_FACTOR,
            min_pixels: DEFAULT_MIN_PIXELS,
            max_pixels: DEFAULT_MAX_PIXELS,
            max_workers: 64,
            worker_pool: WorkerPool::default(),
            prompt_mode: PromptMode::default(),
            page_scope: PageScope::default(),
            api_timeout_secs: 600,
            download_timeout_secs: 120,
            retry: RetryPolicy::default(),
            temperature: 0.1,
            max_tokens: 16_384,
            model: None,
            provider_name: None,
            provider: None,
            output_dir: PathBuf::from("output"),
            skip_page_header_footer: false,
            render_document: true,
            label_font: None,
            reuse_results: true,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("dpi", &self.dpi)
            .field("max_render_side", &self.max_render_side)
            .field("upscale_images", &self.upscale_images)
            .field("factor", &self.factor)
            .field("min_pixels", &self.min_pixels)
            .field("max_pixels", &self.max_pixels)
            .field("max_workers", &self.max_workers)
            .field("worker_pool", &self.worker_pool)
            .field("prompt_mode", &self.prompt_mode)
            .field("page_scope", &self.page_scope)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("retry", &self.retry)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("output_dir", &self.output_dir)
            .field("reuse_results", &self.reuse_results)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Alignment and pixel budget for page normalisation.
    pub fn size_budget(&self) -> SizeBudget {
        SizeBudget {
            factor: self.factor,
            min_pixels: self.min_pixels,
            max_pixels: self.max_pixels,
        }
    }

    /// Which provider this configuration asks for, reading the process
    /// environment for whatever the config leaves open.
    pub fn provider_choice(&self) -> ProviderChoice {
        self.provider_choice_with(|key| std::env::var(key).ok())
    }

    /// [`PipelineConfig::provider_choice`] against an arbitrary environment.
    ///
    /// A pre-built provider wins. Otherwise the provider name comes from the
    /// config or `EDGEQUAKE_LLM_PROVIDER`, and the model from the config,
    /// `EDGEQUAKE_MODEL` or [`DEFAULT_MODEL`]. With no name anywhere, an
    /// `OPENAI_API_KEY` selects OpenAI (local servers through
    /// `OPENAI_BASE_URL`), and failing that the provider is auto-detected.
    pub fn provider_choice_with(&self, env: impl Fn(&str) -> Option<String>) -> ProviderChoice {
        if let Some(ref provider) = self.provider {
            return ProviderChoice::Given(Arc::clone(provider));
        }
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let model = self
            .model
            .clone()
            .or_else(|| env("EDGEQUAKE_MODEL"))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let provider = self
            .provider_name
            .clone()
            .or_else(|| env("EDGEQUAKE_LLM_PROVIDER"))
            .or_else(|| env("OPENAI_API_KEY").map(|_| "openai".to_string()));

        match provider {
            Some(provider) => ProviderChoice::Named { provider, model },
            None => ProviderChoice::AutoDetect,
        }
    }

    /// Worker count for a job with `page_count` pages.
    pub fn pool_size(&self, page_count: usize) -> usize {
        page_count.min(self.max_workers).max(1)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_render_side(mut self, px: u32) -> Self {
        self.config.max_render_side = px;
        self
    }

    pub fn upscale_images(mut self, v: bool) -> Self {
        self.config.upscale_images = v;
        self
    }

    pub fn factor(mut self, factor: u32) -> Self {
        self.config.factor = factor;
        self
    }

    pub fn min_pixels(mut self, px: u64) -> Self {
        self.config.min_pixels = px;
        self
    }

    pub fn max_pixels(mut self, px: u64) -> Self {
        self.config.max_pixels = px;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n.max(1);
        self
    }

    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.config.worker_pool = pool;
        self
    }

    pub fn prompt_mode(mut self, mode: PromptMode) -> Self {
        self.config.prompt_mode = mode;
        self
    }

    pub fn page_scope(mut self, scope: PageScope) -> Self {
        self.config.page_scope = scope;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn skip_page_header_footer(mut self, v: bool) -> Self {
        self.config.skip_page_header_footer = v;
        self
    }

    pub fn render_document(mut self, v: bool) -> Self {
        self.config.render_document = v;
        self
    }

    pub fn label_font(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.label_font = Some(path.into());
        self
    }

    pub fn reuse_results(mut self, v: bool) -> Self {
        self.config.reuse_results = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.factor == 0 {
            return Err(PipelineError::InvalidConfig(
                "Alignment factor must be ≥ 1".into(),
            ));
        }
        if c.min_pixels < DEFAULT_MIN_PIXELS {
            return Err(PipelineError::InvalidConfig(format!(
                "min_pixels must be ≥ {DEFAULT_MIN_PIXELS}, got {}",
                c.min_pixels
            )));
        }
        if c.max_pixels > DEFAULT_MAX_PIXELS {
            return Err(PipelineError::InvalidConfig(format!(
                "max_pixels must be ≤ {DEFAULT_MAX_PIXELS}, got {}",
                c.max_pixels
            )));
        }
        if c.min_pixels >= c.max_pixels {
            return Err(PipelineError::InvalidConfig(format!(
                "min_pixels ({}) must be below max_pixels ({})",
                c.min_pixels, c.max_pixels
            )));
        }
        if c.max_render_side < 100 {
            return Err(PipelineError::InvalidConfig(format!(
                "max_render_side must be ≥ 100, got {}",
                c.max_render_side
            )));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Outcome of [`PipelineConfig::provider_choice`].
#[derive(Clone)]
pub enum ProviderChoice {
    /// `PipelineConfig::provider`, used as-is.
    Given(Arc<dyn LLMProvider>),
    /// Built by the provider factory.
    Named { provider: String, model: String },
    /// Whatever `ProviderFactory::from_env` finds.
    AutoDetect,
}

impl fmt::Debug for ProviderChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderChoice::Given(_) => f.write_str("Given(<dyn LLMProvider>)"),
            ProviderChoice::Named { provider, model } => f
                .debug_struct("Named")
                .field("provider", provider)
                .field("model", model)
                .finish(),
            ProviderChoice::AutoDetect => f.write_str("AutoDetect"),
        }
    }
}

/// The instruction sent with each page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PromptMode {
    /// Bounding boxes, categories and text for every layout element. (default)
    #[default]
    #[serde(rename = "prompt_layout_all_en")]
    LayoutAll,
    /// Bounding boxes and categories only.
    #[serde(rename = "prompt_layout_only_en")]
    LayoutOnly,
    /// Plain text extraction, no layout.
    #[serde(rename = "prompt_ocr")]
    Ocr,
    /// Text inside one caller-supplied bounding box.
    #[serde(rename = "prompt_grounding_ocr")]
    GroundingOcr,
}

impl PromptMode {
    /// Whether the model reply is expected to be a JSON layout.
    pub fn is_structured(self) -> bool {
        !matches!(self, PromptMode::Ocr)
    }

    /// Whether cell text is assembled into a page document.
    pub fn produces_text(self) -> bool {
        !matches!(self, PromptMode::LayoutOnly)
    }
}

/// Which pages of a document enter the recognise stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageScope {
    /// Every page. (default)
    #[default]
    All,
    /// Only the first page, for quick previews.
    FirstPage,
}

impl PageScope {
    /// Expand the scope into 0-based page indices.
    pub fn to_indices(self, total_pages: usize) -> Vec<usize> {
        match self {
            PageScope::All => (0..total_pages).collect(),
            PageScope::FirstPage => (0..total_pages.min(1)).collect(),
        }
    }
}

/// Execution model for page workers.
///
/// Both variants bound concurrency to [`PipelineConfig::pool_size`] and
/// hand results back unordered; the orchestrator restores page order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPool {
    /// Cooperative futures polled by the orchestrating task. (default)
    #[default]
    Tasks,
    /// One `tokio::spawn`ed task per page, spread across runtime threads.
    Threads,
}

/// How often a failed inference call is retried before the page degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first one. Default: 0.
    pub max_retries: u32,
    /// Initial backoff, doubled after every attempt. Default: 500.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Delay before `attempt` (1-based retry number).
    pub fn backoff_for(&self, attempt: u32) -> u64 {
        self.backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_budgets() {
        let c = PipelineConfig::default();
        assert_eq!(c.factor, 28);
        assert_eq!(c.min_pixels, 3136);
        assert_eq!(c.max_pixels, 11_289_600);
        assert_eq!(c.retry.max_retries, 0);
        assert!(c.render_document);
    }

    #[test]
    fn build_rejects_pixel_budget_outside_bounds() {
        assert!(PipelineConfig::builder().min_pixels(100).build().is_err());
        assert!(PipelineConfig::builder()
            .max_pixels(20_000_000)
            .build()
            .is_err());
        assert!(PipelineConfig::builder()
            .min_pixels(10_000)
            .max_pixels(9_000)
            .build()
            .is_err());
    }

    #[test]
    fn pool_size_is_bounded_by_pages_and_workers() {
        let c = PipelineConfig::builder().max_workers(4).build().unwrap();
        assert_eq!(c.pool_size(2), 2);
        assert_eq!(c.pool_size(10), 4);
        assert_eq!(c.pool_size(0), 1);
    }

    #[test]
    fn page_scope_indices() {
        assert_eq!(PageScope::All.to_indices(3), vec![0, 1, 2]);
        assert_eq!(PageScope::FirstPage.to_indices(3), vec![0]);
        assert!(PageScope::FirstPage.to_indices(0).is_empty());
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy {
            max_retries: 3,
            backoff_ms: 500,
        };
        assert_eq!(p.backoff_for(1), 500);
        assert_eq!(p.backoff_for(2), 1000);
        assert_eq!(p.backoff_for(3), 2000);
    }

    fn named(provider: &str, model: &str) -> (String, String) {
        (provider.to_string(), model.to_string())
    }

    fn choice(config: &PipelineConfig, vars: &[(&str, &str)]) -> Option<(String, String)> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        match config.provider_choice_with(|key| {
            vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        }) {
            ProviderChoice::Named { provider, model } => Some((provider, model)),
            ProviderChoice::AutoDetect => None,
            ProviderChoice::Given(_) => panic!("no provider was given"),
        }
    }

    #[test]
    fn configured_provider_beats_environment() {
        let c = PipelineConfig::builder()
            .provider_name("ollama")
            .model("qwen2.5vl")
            .build()
            .unwrap();
        let env = [("EDGEQUAKE_LLM_PROVIDER", "gemini"), ("EDGEQUAKE_MODEL", "flash")];
        assert_eq!(choice(&c, &env), Some(named("ollama", "qwen2.5vl")));
    }

    #[test]
    fn environment_fills_what_config_leaves_open() {
        let c = PipelineConfig::builder().model("gpt-4.1").build().unwrap();
        let env = [("EDGEQUAKE_LLM_PROVIDER", "azure"), ("EDGEQUAKE_MODEL", "ignored")];
        assert_eq!(choice(&c, &env), Some(named("azure", "gpt-4.1")));

        let c = PipelineConfig::default();
        assert_eq!(
            choice(&c, &[("EDGEQUAKE_LLM_PROVIDER", "anthropic")]),
            Some(named("anthropic", DEFAULT_MODEL))
        );
    }

    #[test]
    fn openai_key_selects_openai_then_auto_detect() {
        let c = PipelineConfig::default();
        assert_eq!(
            choice(&c, &[("OPENAI_API_KEY", "sk-test")]),
            Some(named("openai", DEFAULT_MODEL))
        );
        assert_eq!(choice(&c, &[("OPENAI_API_KEY", "  ")]), None);
        assert_eq!(choice(&c, &[]), None);
    }

    #[test]
    fn prompt_mode_serialises_with_wire_names() {
        let s = serde_json::to_string(&PromptMode::GroundingOcr).unwrap();
        assert_eq!(s, "\"prompt_grounding_ocr\"");
        assert!(PromptMode::LayoutOnly.is_structured());
        assert!(!PromptMode::Ocr.is_structured());
        assert!(!PromptMode::LayoutOnly.produces_text());
    }
}
