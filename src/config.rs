//! Configuration types for exam-to-JSON extraction.
//!
//! Every knob lives in [`ExtractionConfig`], built through
//! [`ExtractionConfigBuilder`]. One struct makes it easy to share a config
//! across the worker pool, print it with `{:?}` when debugging a run, and diff
//! two runs that produced different question sets.

use crate::error::Exam2JsonError;
use crate::pipeline::structure::{CancelFlag, StructuringAdapter};
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default question-marker pattern: `QUESTÃO 01`, `Questao 7`, `QUESTÃO Nº 12`.
///
/// Group 1 must capture the numeric identifier.
pub const DEFAULT_MARKER_PATTERN: &str = r"(?i)\bQUEST(?:Ã|ã|A|a)O\s*(?:N\s*[º°o.]?\s*)?(\d{1,3})\b";

/// Configuration for one exam extraction run.
///
/// # Example
/// ```rust
/// use edgequake_exam2json::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .concurrency(8)
///     .max_retries(1)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Concurrent Structuring Adapter calls. Default: 10.
    pub concurrency: usize,

    /// Adapter calls started per minute, retries included. 0 disables the
    /// limit. Default: 50.
    pub requests_per_minute: u32,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "gemini").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed Structuring Adapter. Takes precedence over every
    /// provider setting; the pipeline never touches an LLM directly.
    pub adapter: Option<Arc<dyn StructuringAdapter>>,

    /// Sampling temperature. Default: 0.0 (transcription, not creativity).
    pub temperature: f32,

    /// Maximum tokens per structured question. Default: 4096.
    pub max_tokens: usize,

    /// Retries after a failed adapter call. Default: 1 (retry once, with a
    /// restated request).
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call adapter timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Custom system prompt. If None, uses [`crate::prompts::structure_system_prompt`].
    pub system_prompt: Option<String>,

    /// Pages of the exam booklet to read. Default: all.
    pub exam_pages: PageSelection,

    /// Pages of the answer key to read. Default: all.
    pub answer_key_pages: PageSelection,

    /// Image relevance thresholds.
    pub image_filter: ImageFilterConfig,

    /// Question-marker regex; group 1 captures the identifier.
    pub marker_pattern: String,

    /// Allowed option keys, in order. Default: A–E.
    pub option_keys: Vec<char>,

    /// Send each question's images to the adapter as JPEG attachments.
    /// Default: false (text is enough for most exams and far cheaper).
    pub attach_images: bool,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Per-question progress events.
    pub progress_callback: Option<ProgressCallback>,

    /// Run-level cancellation. When set, no new adapter calls are issued.
    pub cancel: Option<CancelFlag>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            requests_per_minute: 50,
            model: None,
            provider_name: None,
            provider: None,
            adapter: None,
            temperature: 0.0,
            max_tokens: 4096,
            max_retries: 1,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            password: None,
            system_prompt: None,
            exam_pages: PageSelection::default(),
            answer_key_pages: PageSelection::default(),
            image_filter: ImageFilterConfig::default(),
            marker_pattern: DEFAULT_MARKER_PATTERN.to_string(),
            option_keys: vec!['A', 'B', 'C', 'D', 'E'],
            attach_images: false,
            download_timeout_secs: 120,
            progress_callback: None,
            cancel: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("concurrency", &self.concurrency)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("adapter", &self.adapter.as_ref().map(|_| "<dyn StructuringAdapter>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("exam_pages", &self.exam_pages)
            .field("answer_key_pages", &self.answer_key_pages)
            .field("image_filter", &self.image_filter)
            .field("marker_pattern", &self.marker_pattern)
            .field("option_keys", &self.option_keys)
            .field("attach_images", &self.attach_images)
            .finish()
    }
}

impl ExtractionConfig {
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    /// 0 disables the limit.
    pub fn requests_per_minute(mut self, rpm: u32) -> Self {
        self.config.requests_per_minute = rpm;
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

    pub fn adapter(mut self, adapter: Arc<dyn StructuringAdapter>) -> Self {
        self.config.adapter = Some(adapter);
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

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn exam_pages(mut self, selection: PageSelection) -> Self {
        self.config.exam_pages = selection;
        self
    }

    pub fn answer_key_pages(mut self, selection: PageSelection) -> Self {
        self.config.answer_key_pages = selection;
        self
    }

    pub fn image_filter(mut self, filter: ImageFilterConfig) -> Self {
        self.config.image_filter = filter;
        self
    }

    pub fn marker_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.marker_pattern = pattern.into();
        self
    }

    pub fn option_keys(mut self, keys: impl IntoIterator<Item = char>) -> Self {
        self.config.option_keys = keys.into_iter().map(|c| c.to_ascii_uppercase()).collect();
        self
    }

    pub fn attach_images(mut self, v: bool) -> Self {
        self.config.attach_images = v;
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

    pub fn cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.config.cancel = Some(flag);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, Exam2JsonError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(Exam2JsonError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.api_timeout_secs == 0 {
            return Err(Exam2JsonError::InvalidConfig("API timeout must be ≥ 1s".into()));
        }
        let marker = Regex::new(&c.marker_pattern).map_err(|e| {
            Exam2JsonError::InvalidConfig(format!("Invalid marker pattern: {e}"))
        })?;
        if marker.captures_len() < 2 {
            return Err(Exam2JsonError::InvalidConfig(
                "Marker pattern needs a capture group for the question number".into(),
            ));
        }
        validate_option_keys(&c.option_keys)?;
        c.image_filter.validate()?;
        Ok(self.config)
    }
}

fn validate_option_keys(keys: &[char]) -> Result<(), Exam2JsonError> {
    if keys.len() < 2 {
        return Err(Exam2JsonError::InvalidConfig(
            "At least two option keys are required".into(),
        ));
    }
    if let Some(bad) = keys.iter().find(|k| !k.is_ascii_uppercase()) {
        return Err(Exam2JsonError::InvalidConfig(format!(
            "Option key '{bad}' is not a letter"
        )));
    }
    let mut sorted = keys.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != keys.len() {
        return Err(Exam2JsonError::InvalidConfig("Option keys must be unique".into()));
    }
    Ok(())
}

// ── Image filter thresholds ──────────────────────────────────────────────

/// Thresholds for the image relevance gates.
///
/// Defaults reject icons, page-border slivers, flat fills and anything that
/// appears more than once in the booklet (logos, headers, watermarks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFilterConfig {
    /// Minimum width in pixels. Default: 300.
    pub min_width: u32,
    /// Minimum height in pixels. Default: 300.
    pub min_height: u32,
    /// Lowest accepted width/height ratio. Default: 0.25.
    pub min_aspect_ratio: f32,
    /// Highest accepted width/height ratio. Default: 4.0.
    pub max_aspect_ratio: f32,
    /// Minimum distinct RGB colours (counting stops at 10 000). Default: 50.
    pub min_unique_colors: usize,
    /// Minimum standard deviation of luminance (0–255). Default: 4.0.
    pub min_luma_stddev: f32,
    /// An image whose fingerprint occurs more often than this in the document
    /// is page furniture. Default: 1.
    pub max_repetitions: usize,
}

impl Default for ImageFilterConfig {
    fn default() -> Self {
        Self {
            min_width: 300,
            min_height: 300,
            min_aspect_ratio: 0.25,
            max_aspect_ratio: 4.0,
            min_unique_colors: 50,
            min_luma_stddev: 4.0,
            max_repetitions: 1,
        }
    }
}

impl ImageFilterConfig {
    fn validate(&self) -> Result<(), Exam2JsonError> {
        if !(self.min_aspect_ratio > 0.0 && self.min_aspect_ratio <= self.max_aspect_ratio) {
            return Err(Exam2JsonError::InvalidConfig(format!(
                "Aspect ratio bounds are inverted or non-positive: {}..{}",
                self.min_aspect_ratio, self.max_aspect_ratio
            )));
        }
        if self.max_repetitions == 0 {
            return Err(Exam2JsonError::InvalidConfig(
                "max_repetitions must be ≥ 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Specifies which pages of a PDF to read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Every page (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let in_range = |p: &usize| *p >= 1 && *p <= total_pages;
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => std::iter::once(*p).filter(in_range).map(|p| p - 1).collect(),
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages.iter().filter(|p| in_range(p)).map(|p| p - 1).collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}
