//! Configuration for a pipeline run.
//!
//! Everything a stage needs (store location, models, concurrency limits,
//! retry budgets, plausibility thresholds) is carried by one
//! [`PipelineConfig`] value threaded through the orchestrator. Nothing below
//! the CLI reads process environment on its own, except provider
//! auto-detection when no provider was configured.
//!
//! Build it with [`PipelineConfig::builder()`]; setters clamp to sane ranges
//! and [`PipelineConfigBuilder::build`] rejects combinations that cannot work.

use crate::error::Pdf2KbError;
use crate::pipeline::llm::CompletionService;
use crate::pipeline::parser::PdfParser;
use crate::pipeline::retry::RetryPolicy;
use crate::progress::ProgressCallback;
use crate::schema::Stage;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one pipeline run.
///
/// # Example
/// ```rust
/// use edgequake_pdf2kb::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .store_dir("kb_store")
///     .resume(true)
///     .llm_concurrency(4)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert!(config.resume);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of the schema store. Default: `kb_store`.
    pub store_dir: PathBuf,

    /// Continue a stored record instead of starting over. Default: false.
    ///
    /// Without it an existing record for the same document id is discarded.
    pub resume: bool,

    /// Reset this stage and everything downstream before running. Implies
    /// `resume` for the stages upstream of it.
    pub rerun_from: Option<Stage>,

    /// Text model, e.g. "gpt-4.1-nano". If None, uses the provider default.
    pub model: Option<String>,

    /// Vision model for image description. If None, the text model is used.
    pub vision_model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Completion backend for text calls. Takes precedence over every
    /// provider setting.
    pub completion_service: Option<Arc<dyn CompletionService>>,

    /// Completion backend for vision calls. Defaults to the text backend.
    pub vision_service: Option<Arc<dyn CompletionService>>,

    /// PDF parser. Defaults to the pdfium parser.
    pub parser: Option<Arc<dyn PdfParser>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Output token budget per call. Default: 4096.
    pub max_tokens: usize,

    /// Concurrent LLM calls across all stages. Default: 8.
    pub llm_concurrency: usize,

    /// Concurrent chapter requests in the chunking stage. Default: 3.
    ///
    /// Applied on top of `llm_concurrency`.
    pub chunking_concurrency: usize,

    /// Request budget per minute shared by all LLM stages. Default: none.
    pub requests_per_minute: Option<u32>,

    /// Extraction workers. Default: available cores minus `reserved_cores`.
    pub extraction_workers: Option<usize>,

    /// Cores left free for the host when sizing extraction. Default: 1.
    pub reserved_cores: usize,

    /// Retries per LLM call after the first attempt. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call LLM timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Retries of a transiently failing page extraction. Default: 3.
    pub extraction_retries: u32,

    /// Repaired text shorter than this fraction of the raw text (in
    /// non-whitespace characters) is rejected. Default: 0.5.
    pub repair_min_ratio: f32,

    /// Allowed relative deviation between a chapter span and its LLM chunks
    /// (in non-whitespace characters). Default: 0.15.
    pub chunk_length_tolerance: f32,

    /// Upper bound for a single fallback chunk in bytes. Default: 1500.
    pub fallback_max_chunk_chars: usize,

    /// Images smaller than this on either side are ignored. Default: 64.
    pub min_image_px: u32,

    /// Cap on the page text sent with each media item, in chars, centred on
    /// the caption. `None` sends the whole page. Default: `None`.
    pub media_context_chars: Option<usize>,

    /// Run the chapter/question stage. Default: true.
    pub enrich: bool,

    /// Questions requested per chapter. Default: 5.
    pub chapter_questions: usize,

    /// Questions requested per chunk. Default: 2.
    pub chunk_questions: usize,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Receives per-stage and per-unit events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("kb_store"),
            resume: false,
            rerun_from: None,
            model: None,
            vision_model: None,
            provider_name: None,
            provider: None,
            completion_service: None,
            vision_service: None,
            parser: None,
            temperature: 0.1,
            max_tokens: 4096,
            llm_concurrency: 8,
            chunking_concurrency: 3,
            requests_per_minute: None,
            extraction_workers: None,
            reserved_cores: 1,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            extraction_retries: 3,
            repair_min_ratio: 0.5,
            chunk_length_tolerance: 0.15,
            fallback_max_chunk_chars: 1500,
            min_image_px: 64,
            media_context_chars: None,
            enrich: true,
            chapter_questions: 5,
            chunk_questions: 2,
            password: None,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("store_dir", &self.store_dir)
            .field("resume", &self.resume)
            .field("rerun_from", &self.rerun_from)
            .field("model", &self.model)
            .field("vision_model", &self.vision_model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "completion_service",
                &self.completion_service.as_ref().map(|_| "<dyn CompletionService>"),
            )
            .field("parser", &self.parser.as_ref().map(|_| "<dyn PdfParser>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("llm_concurrency", &self.llm_concurrency)
            .field("chunking_concurrency", &self.chunking_concurrency)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("extraction_workers", &self.extraction_workers())
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("enrich", &self.enrich)
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

    /// Extraction pool size: the explicit setting, else available cores
    /// minus the reserved margin, never below one.
    pub fn extraction_workers(&self) -> usize {
        if let Some(n) = self.extraction_workers {
            return n.max(1);
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.saturating_sub(self.reserved_cores).max(1)
    }

    /// Backoff policy for LLM calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_backoff_ms)
    }

    /// Backoff policy for page extraction.
    pub fn extraction_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.extraction_retries, self.retry_backoff_ms.min(200))
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.store_dir = dir.into();
        self
    }

    pub fn resume(mut self, v: bool) -> Self {
        self.config.resume = v;
        self
    }

    pub fn rerun_from(mut self, stage: Stage) -> Self {
        self.config.rerun_from = Some(stage);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn vision_model(mut self, model: impl Into<String>) -> Self {
        self.config.vision_model = Some(model.into());
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

    pub fn completion_service(mut self, service: Arc<dyn CompletionService>) -> Self {
        self.config.completion_service = Some(service);
        self
    }

    pub fn vision_service(mut self, service: Arc<dyn CompletionService>) -> Self {
        self.config.vision_service = Some(service);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn PdfParser>) -> Self {
        self.config.parser = Some(parser);
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

    pub fn llm_concurrency(mut self, n: usize) -> Self {
        self.config.llm_concurrency = n.max(1);
        self
    }

    pub fn chunking_concurrency(mut self, n: usize) -> Self {
        self.config.chunking_concurrency = n.max(1);
        self
    }

    pub fn requests_per_minute(mut self, rpm: u32) -> Self {
        self.config.requests_per_minute = Some(rpm.max(1));
        self
    }

    pub fn extraction_workers(mut self, n: usize) -> Self {
        self.config.extraction_workers = Some(n.max(1));
        self
    }

    pub fn reserved_cores(mut self, n: usize) -> Self {
        self.config.reserved_cores = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn extraction_retries(mut self, n: u32) -> Self {
        self.config.extraction_retries = n;
        self
    }

    pub fn repair_min_ratio(mut self, ratio: f32) -> Self {
        self.config.repair_min_ratio = ratio;
        self
    }

    pub fn chunk_length_tolerance(mut self, tolerance: f32) -> Self {
        self.config.chunk_length_tolerance = tolerance;
        self
    }

    pub fn fallback_max_chunk_chars(mut self, n: usize) -> Self {
        self.config.fallback_max_chunk_chars = n;
        self
    }

    pub fn min_image_px(mut self, px: u32) -> Self {
        self.config.min_image_px = px;
        self
    }

    pub fn media_context_chars(mut self, n: usize) -> Self {
        self.config.media_context_chars = Some(n);
        self
    }

    pub fn enrich(mut self, v: bool) -> Self {
        self.config.enrich = v;
        self
    }

    pub fn chapter_questions(mut self, n: usize) -> Self {
        self.config.chapter_questions = n;
        self
    }

    pub fn chunk_questions(mut self, n: usize) -> Self {
        self.config.chunk_questions = n;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Pdf2KbError> {
        let c = &self.config;
        if !(c.repair_min_ratio > 0.0 && c.repair_min_ratio <= 1.0) {
            return Err(Pdf2KbError::InvalidConfig(format!(
                "repair_min_ratio must be in (0, 1], got {}",
                c.repair_min_ratio
            )));
        }
        if !(0.0..1.0).contains(&c.chunk_length_tolerance) {
            return Err(Pdf2KbError::InvalidConfig(format!(
                "chunk_length_tolerance must be in [0, 1), got {}",
                c.chunk_length_tolerance
            )));
        }
        if c.fallback_max_chunk_chars < 100 {
            return Err(Pdf2KbError::InvalidConfig(format!(
                "fallback_max_chunk_chars must be ≥ 100, got {}",
                c.fallback_max_chunk_chars
            )));
        }
        if c.max_tokens == 0 {
            return Err(Pdf2KbError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.store_dir.as_os_str().is_empty() {
            return Err(Pdf2KbError::InvalidConfig("store_dir must not be empty".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let c = PipelineConfig::default();
        assert_eq!(c.llm_concurrency, 8);
        assert_eq!(c.chunking_concurrency, 3);
        assert_eq!(c.extraction_retries, 3);
        assert_eq!(c.repair_min_ratio, 0.5);
        assert!(c.enrich);
        assert!(!c.resume);
    }

    #[test]
    fn workers_leave_a_core_free() {
        let c = PipelineConfig::default();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(c.extraction_workers(), cores.saturating_sub(1).max(1));

        let c = PipelineConfig::builder()
            .reserved_cores(10_000)
            .build()
            .unwrap();
        assert_eq!(c.extraction_workers(), 1);

        let c = PipelineConfig::builder().extraction_workers(3).build().unwrap();
        assert_eq!(c.extraction_workers(), 3);
    }

    #[test]
    fn setters_clamp() {
        let c = PipelineConfig::builder()
            .llm_concurrency(0)
            .chunking_concurrency(0)
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.llm_concurrency, 1);
        assert_eq!(c.chunking_concurrency, 1);
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn build_rejects_bad_thresholds() {
        let err = PipelineConfig::builder()
            .repair_min_ratio(0.0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("repair_min_ratio"));

        let err = PipelineConfig::builder()
            .chunk_length_tolerance(1.5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("chunk_length_tolerance"));

        assert!(PipelineConfig::builder()
            .fallback_max_chunk_chars(10)
            .build()
            .is_err());
    }

    #[test]
    fn debug_hides_injected_services() {
        let c = PipelineConfig::builder().rerun_from(Stage::Chunking).build().unwrap();
        let s = format!("{c:?}");
        assert!(s.contains("Chunking"));
        assert!(s.contains("completion_service: None"));
    }
}
