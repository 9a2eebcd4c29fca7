//! LLM boundary: one request/response contract for every model call.
//!
//! Stages never talk to a provider directly. They build a
//! [`CompletionRequest`] (system prompt, user prompt, optional image, a
//! structured-output flag) and hand it to [`LlmClient::complete`], which
//!
//! 1. waits for a slot on the shared [`LlmGate`] (concurrency cap plus an
//!    optional requests-per-minute budget),
//! 2. calls the [`CompletionService`] under a per-call timeout,
//! 3. retries transient failures through the shared [`RetryPolicy`],
//! 4. meters calls, retries and tokens into [`LlmUsage`].
//!
//! The gate slot is released before backing off, so a unit waiting to retry
//! never holds capacity another unit could use.
//!
//! [`CompletionService`] is the seam: production wraps an
//! [`edgequake_llm::LLMProvider`] in [`ProviderService`]; tests script
//! responses.

use crate::config::PipelineConfig;
use crate::error::Pdf2KbError;
use crate::pipeline::retry::{Exhausted, RetryPolicy};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

/// Model used when neither the caller nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Appended to the user prompt of structured requests.
const JSON_ONLY: &str = "Respond with a single JSON object and nothing else.";

/// One model call.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// System prompt. For structure/chunking/enrichment calls this is the
    /// shared document prefix and must be byte-identical across those calls.
    pub system: String,
    pub user: String,
    /// Present for vision calls.
    pub image: Option<ImageData>,
    /// Ask for a parseable JSON answer.
    pub structured: bool,
    /// Per-request override of the configured output budget.
    pub max_tokens: Option<usize>,
}

impl CompletionRequest {
    pub fn text(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            ..Self::default()
        }
    }

    pub fn structured(mut self) -> Self {
        self.structured = true;
        self
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.image = Some(image);
        self
    }
}

/// A model answer plus its token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Why a single call failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmCallError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("{0}")]
    Transient(String),
    /// Bad credentials, invalid request. Not retried.
    #[error("{0}")]
    Permanent(String),
}

impl LlmCallError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmCallError::Permanent(_))
    }

    /// Map a provider error message onto the retry taxonomy.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
            LlmCallError::RateLimited(message.to_string())
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("invalid_api_key")
        {
            LlmCallError::Permanent(message.to_string())
        } else {
            LlmCallError::Transient(message.to_string())
        }
    }
}

/// Text/vision completion backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmCallError>;
}

/// [`CompletionService`] over an `edgequake_llm` provider.
pub struct ProviderService {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl ProviderService {
    pub fn new(provider: Arc<dyn LLMProvider>, temperature: f32, max_tokens: usize) -> Self {
        Self {
            provider,
            temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl CompletionService for ProviderService {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmCallError> {
        let user = if request.structured {
            format!("{}\n\n{}", request.user, JSON_ONLY)
        } else {
            request.user.clone()
        };

        let mut messages = vec![ChatMessage::system(request.system.as_str())];
        match &request.image {
            Some(image) => messages.push(ChatMessage::user_with_images(
                user.as_str(),
                vec![image.clone()],
            )),
            None => messages.push(ChatMessage::user(user.as_str())),
        }

        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(request.max_tokens.unwrap_or(self.max_tokens)),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| LlmCallError::classify(&e.to_string()))?;

        Ok(Completion {
            text: response.content,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }
}

// ── Gate ─────────────────────────────────────────────────────────────────

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Concurrency cap and request budget shared by every LLM-calling stage.
pub struct LlmGate {
    permits: Semaphore,
    limiter: Option<DirectLimiter>,
}

impl LlmGate {
    pub fn new(concurrency: usize, requests_per_minute: Option<u32>) -> Self {
        let limiter = requests_per_minute.map(|rpm| {
            let rpm = NonZeroU32::new(rpm).unwrap_or(nonzero!(1u32));
            RateLimiter::direct(Quota::per_minute(rpm))
        });
        Self {
            permits: Semaphore::new(concurrency.max(1)),
            limiter,
        }
    }

    async fn admit(&self) -> Result<SemaphorePermit<'_>, LlmCallError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmCallError::Permanent("LLM gate closed".into()))?;
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        Ok(permit)
    }
}

// ── Usage ────────────────────────────────────────────────────────────────

/// Call and token totals for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Attempts sent to the service, retries included.
    pub calls: u64,
    pub retries: u64,
    /// Units whose retry budget ran out.
    pub failed: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Default)]
struct UsageMeter {
    calls: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl UsageMeter {
    fn snapshot(&self) -> LlmUsage {
        LlmUsage {
            calls: self.calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────

/// Gated, timed, retrying access to the text and vision services.
pub struct LlmClient {
    text: Arc<dyn CompletionService>,
    vision: Arc<dyn CompletionService>,
    gate: LlmGate,
    policy: RetryPolicy,
    timeout: Duration,
    usage: UsageMeter,
}

impl LlmClient {
    pub fn new(
        text: Arc<dyn CompletionService>,
        vision: Arc<dyn CompletionService>,
        gate: LlmGate,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            text,
            vision,
            gate,
            policy,
            timeout,
            usage: UsageMeter::default(),
        }
    }

    /// Build the client from the pipeline configuration, resolving a
    /// provider unless a service was injected.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, Pdf2KbError> {
        let (text, vision) = resolve_services(config)?;
        Ok(Self::new(
            text,
            vision,
            LlmGate::new(config.llm_concurrency, config.requests_per_minute),
            config.retry_policy(),
            Duration::from_secs(config.api_timeout_secs),
        ))
    }

    /// Send `request`, retrying transient failures. Vision requests go to the
    /// vision service.
    pub async fn complete(
        &self,
        label: &str,
        request: &CompletionRequest,
    ) -> Result<Completion, Exhausted<LlmCallError>> {
        let service = if request.image.is_some() {
            &self.vision
        } else {
            &self.text
        };

        let result = self
            .policy
            .run(
                label,
                |attempt| async move {
                    if attempt > 0 {
                        self.usage.retries.fetch_add(1, Ordering::Relaxed);
                    }
                    let _permit = self.gate.admit().await?;
                    self.usage.calls.fetch_add(1, Ordering::Relaxed);
                    match tokio::time::timeout(self.timeout, service.complete(request)).await {
                        Ok(inner) => inner,
                        Err(_) => Err(LlmCallError::Timeout(self.timeout)),
                    }
                },
                LlmCallError::is_retryable,
            )
            .await;

        match &result {
            Ok(c) => {
                self.usage.input_tokens.fetch_add(c.input_tokens, Ordering::Relaxed);
                self.usage.output_tokens.fetch_add(c.output_tokens, Ordering::Relaxed);
                debug!(
                    "{}: {} input tokens, {} output tokens",
                    label, c.input_tokens, c.output_tokens
                );
            }
            Err(_) => {
                self.usage.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    pub fn usage(&self) -> LlmUsage {
        self.usage.snapshot()
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Pdf2KbError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Pdf2KbError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the text provider, from most-specific to least-specific:
///
/// 1. pre-built provider (`config.provider`)
/// 2. named provider + model (`config.provider_name`)
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
/// 4. OpenAI when `OPENAI_API_KEY` is set
/// 5. `ProviderFactory::from_env()` auto-detection
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, Pdf2KbError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            let model = config.model.clone().unwrap_or(model);
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2KbError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Provider name the vision model is created under when it differs from
/// the text model.
fn vision_provider_name(config: &PipelineConfig) -> String {
    if let Some(ref name) = config.provider_name {
        return name.clone();
    }
    match std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        Ok(p) if !p.is_empty() => p,
        _ => "openai".to_string(),
    }
}

/// Text and vision services for a run. Injected services win; otherwise
/// both wrap providers resolved from the configuration.
pub fn resolve_services(
    config: &PipelineConfig,
) -> Result<(Arc<dyn CompletionService>, Arc<dyn CompletionService>), Pdf2KbError> {
    if let Some(ref text) = config.completion_service {
        let vision = config
            .vision_service
            .clone()
            .unwrap_or_else(|| Arc::clone(text));
        return Ok((Arc::clone(text), vision));
    }

    let provider = resolve_provider(config)?;
    let text: Arc<dyn CompletionService> = Arc::new(ProviderService::new(
        Arc::clone(&provider),
        config.temperature,
        config.max_tokens,
    ));

    let vision: Arc<dyn CompletionService> = match (&config.vision_service, &config.vision_model) {
        (Some(svc), _) => Arc::clone(svc),
        (None, Some(model)) if config.provider.is_none() => {
            let vp = create_provider(&vision_provider_name(config), model)?;
            Arc::new(ProviderService::new(vp, config.temperature, config.max_tokens))
        }
        _ => Arc::clone(&text),
    };

    Ok((text, vision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Flaky {
        fail_first: usize,
        error: LlmCallError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionService for Flaky {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmCallError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(Completion {
                    text: "ok".into(),
                    input_tokens: 10,
                    output_tokens: 2,
                })
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl CompletionService for Slow {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmCallError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Completion::default())
        }
    }

    fn client(service: Arc<dyn CompletionService>, retries: u32, timeout: Duration) -> LlmClient {
        LlmClient::new(
            Arc::clone(&service),
            service,
            LlmGate::new(2, None),
            RetryPolicy::new(retries, 1),
            timeout,
        )
    }

    #[test]
    fn classify_maps_status_codes() {
        assert!(matches!(
            LlmCallError::classify("HTTP 429 Too Many Requests"),
            LlmCallError::RateLimited(_)
        ));
        assert!(matches!(
            LlmCallError::classify("401 Unauthorized"),
            LlmCallError::Permanent(_)
        ));
        assert!(matches!(
            LlmCallError::classify("502 bad gateway"),
            LlmCallError::Transient(_)
        ));
        assert!(LlmCallError::Timeout(Duration::from_secs(3)).is_retryable());
        assert!(!LlmCallError::Permanent("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_and_metered() {
        let svc = Arc::new(Flaky {
            fail_first: 2,
            error: LlmCallError::Transient("503".into()),
            calls: AtomicUsize::new(0),
        });
        let c = client(svc.clone(), 3, Duration::from_secs(5));
        let out = c
            .complete("unit", &CompletionRequest::text("sys", "user"))
            .await
            .unwrap();
        assert_eq!(out.text, "ok");
        let usage = c.usage();
        assert_eq!(usage.calls, 3);
        assert_eq!(usage.retries, 2);
        assert_eq!(usage.failed, 0);
        assert_eq!(usage.input_tokens, 10);
    }

    #[tokio::test]
    async fn permanent_failures_fail_fast() {
        let svc = Arc::new(Flaky {
            fail_first: 100,
            error: LlmCallError::Permanent("invalid api key".into()),
            calls: AtomicUsize::new(0),
        });
        let c = client(svc.clone(), 3, Duration::from_secs(5));
        let err = c
            .complete("unit", &CompletionRequest::text("sys", "user"))
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(svc.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.usage().failed, 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let c = client(Arc::new(Slow), 1, Duration::from_millis(20));
        let err = c
            .complete("unit", &CompletionRequest::text("sys", "user"))
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last, LlmCallError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn gate_with_rpm_admits_within_budget() {
        let gate = LlmGate::new(1, Some(120));
        let p = gate.admit().await.unwrap();
        drop(p);
        let _p = gate.admit().await.unwrap();
    }
}
