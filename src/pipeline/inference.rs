//! Vision-model calls: one normalised page image plus a prompt in, text out.
//!
//! The pipeline talks to the model through the [`VisionModel`] trait so the
//! page processor and orchestrator can be exercised with scripted fakes.
//! [`LlmVisionModel`] is the production implementation on top of
//! `edgequake-llm`, which covers OpenAI-compatible servers (vLLM, SGLang),
//! Ollama and the hosted providers.
//!
//! ## Retry Strategy
//!
//! No retries by default: a failed call degrades its page and the job moves
//! on. When [`RetryPolicy::max_retries`] is raised, attempts back off
//! exponentially (`backoff_ms * 2^(attempt-1)`), so 500 ms with 3 retries
//! waits 500 ms → 1 s → 2 s.

use crate::config::{PipelineConfig, ProviderChoice, RetryPolicy};
use crate::error::{PageError, PipelineError};
use crate::pipeline::encode;
use crate::prompts::with_image_placeholder;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// A failed inference call: network error, non-success status, bad payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct InferenceFailure(pub String);

/// Black-box recogniser: image and prompt in, free-form text out.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn infer(&self, image: &RgbImage, prompt: &str) -> Result<String, InferenceFailure>;
}

/// [`VisionModel`] backed by an `edgequake-llm` provider.
pub struct LlmVisionModel {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
        }
    }

    /// Resolve the provider from `config` and wrap it.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(resolve_provider(config)?, config))
    }
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    async fn infer(&self, image: &RgbImage, prompt: &str) -> Result<String, InferenceFailure> {
        let image_data = encode::encode_page(image)
            .map_err(|e| InferenceFailure(format!("image encoding failed: {e}")))?;

        // The image travels as an attachment of the single user turn; the
        // placeholder tokens mark where the recogniser expects it.
        let messages = vec![ChatMessage::user_with_images(
            with_image_placeholder(prompt),
            vec![image_data],
        )];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| InferenceFailure(e.to_string()))?;

        debug!(
            "{} input tokens, {} output tokens",
            response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }
}

/// Call `model` under a per-attempt `limit`, retrying per `policy`.
///
/// Never panics and never returns a job-level error: every failure becomes a
/// [`PageError`] for page `page` (1-based).
pub async fn infer_with_policy(
    model: &dyn VisionModel,
    page: usize,
    image: &RgbImage,
    prompt: &str,
    limit: Duration,
    policy: &RetryPolicy,
) -> Result<String, PageError> {
    let start = Instant::now();
    let mut last_err = PageError::Inference {
        page,
        retries: 0,
        detail: "not attempted".into(),
    };

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let backoff = policy.backoff_for(attempt);
            warn!(
                "Page {}: retry {}/{} after {}ms",
                page, attempt, policy.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match timeout(limit, model.infer(image, prompt)).await {
            Ok(Ok(text)) => {
                debug!("Page {}: reply in {:?}", page, start.elapsed());
                return Ok(text);
            }
            Ok(Err(e)) => {
                warn!("Page {}: attempt {} failed: {}", page, attempt + 1, e);
                last_err = PageError::Inference {
                    page,
                    retries: attempt,
                    detail: e.0,
                };
            }
            Err(_) => {
                warn!("Page {}: attempt {} timed out", page, attempt + 1);
                last_err = PageError::Timeout {
                    page,
                    secs: limit.as_secs(),
                };
            }
        }
    }

    Err(last_err)
}

// ── Provider resolution ──────────────────────────────────────────────────

/// Build the provider selected by [`PipelineConfig::provider_choice`].
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    let choice = config.provider_choice();
    debug!("Vision provider: {choice:?}");
    match choice {
        ProviderChoice::Given(provider) => Ok(provider),
        ProviderChoice::Named { provider, model } => {
            ProviderFactory::create_llm_provider(&provider, &model).map_err(|e| {
                PipelineError::ProviderNotConfigured {
                    hint: format!("model {model}: {e}"),
                    provider,
                }
            })
        }
        ProviderChoice::AutoDetect => ProviderFactory::from_env()
            .map(|(llm, _embedding)| llm)
            .map_err(|e| PipelineError::ProviderNotConfigured {
                provider: "auto".to_string(),
                hint: format!(
                    "nothing detected in the environment ({e}). Set OPENAI_API_KEY, \
                     EDGEQUAKE_LLM_PROVIDER or pass --provider"
                ),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times, then answers.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl VisionModel for Flaky {
        async fn infer(&self, _: &RgbImage, prompt: &str) -> Result<String, InferenceFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(InferenceFailure("HTTP 503".into()))
            } else {
                Ok(format!("ok: {prompt}"))
            }
        }
    }

    struct Stalled;

    #[async_trait]
    impl VisionModel for Stalled {
        async fn infer(&self, _: &RgbImage, _: &str) -> Result<String, InferenceFailure> {
            sleep(Duration::from_secs(30)).await;
            Ok(String::new())
        }
    }

    fn img() -> RgbImage {
        RgbImage::new(28, 28)
    }

    #[tokio::test]
    async fn no_retry_by_default() {
        let model = Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        };
        let err = infer_with_policy(&model, 2, &img(), "p", Duration::from_secs(5), &RetryPolicy::none())
            .await
            .unwrap_err();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, PageError::Inference { page: 2, retries: 0, .. }));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let model = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_ms: 1,
        };
        let text = infer_with_policy(&model, 1, &img(), "p", Duration::from_secs(5), &policy)
            .await
            .unwrap();
        assert_eq!(text, "ok: p");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stalled_call_times_out() {
        let err = infer_with_policy(
            &Stalled,
            4,
            &img(),
            "p",
            Duration::from_millis(50),
            &RetryPolicy::none(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PageError::Timeout { page: 4, .. }));
    }
}
