//! Structuring Adapter: raw question text → candidate structured fields.
//!
//! The pipeline only knows the [`StructuringAdapter`] trait. The default
//! implementation, [`LlmStructuringAdapter`], asks an `edgequake_llm`
//! provider for a JSON object; tests plug in deterministic mocks.
//!
//! ## Worker pool
//!
//! [`structure_all`] drives one request per question through
//! `buffer_unordered(concurrency)`. Each attempt runs under a per-call
//! timeout; failures are retried `max_retries` times with exponential
//! backoff (`retry_backoff_ms * 2^(attempt-1)`) and a restated prompt.
//! With `requests_per_minute` set, every attempt also waits for a
//! `governor` token first, so bursts never exceed the provider's quota.
//! A [`CancelFlag`] is checked before every attempt: once set, no new call
//! is issued and the question is reported as cancelled. Results are sorted
//! by identifier before they are returned, never left in completion order.

use crate::config::ExtractionConfig;
use crate::error::{AdapterError, QuestionError};
use crate::progress::ProgressCallback;
use crate::prompts::{structure_system_prompt, structure_user_message, RESTATE_INSTRUCTION};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

// ── Cancellation ─────────────────────────────────────────────────────────

/// Run-level cancellation shared between the caller and the worker pool.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Contract ─────────────────────────────────────────────────────────────

/// The output shape the adapter must honour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionSchema {
    /// Allowed option keys, in order.
    pub option_keys: Vec<char>,
}

/// One call to the adapter.
#[derive(Debug, Clone)]
pub struct StructuringRequest {
    pub question_id: u32,
    /// Marker line plus block body.
    pub block_text: String,
    pub schema: QuestionSchema,
    /// Correct option from the answer key, when one was parsed.
    pub answer_hint: Option<char>,
    /// JPEG attachments of the question's images (empty unless enabled).
    pub attachments: Vec<ImageData>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Set on retries: the adapter should restate the task more strictly.
    pub restated: bool,
}

/// Candidate fields as returned by the adapter. Everything is optional; the
/// validator decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StructuredFields {
    #[serde(deserialize_with = "nullable_string")]
    pub question: String,
    #[serde(deserialize_with = "loose_bool")]
    pub image: bool,
    pub images: Vec<String>,
    #[serde(deserialize_with = "nullable_string")]
    pub passage_text: String,
    #[serde(deserialize_with = "string_list")]
    pub sources: Vec<String>,
    #[serde(deserialize_with = "nullable_string")]
    pub statement: String,
    #[serde(deserialize_with = "options_map")]
    pub options: BTreeMap<String, String>,
    #[serde(deserialize_with = "nullable_string")]
    pub correct_option: String,
}

/// A successful adapter call.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterReply {
    pub fields: StructuredFields,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Turns one question block into candidate structured fields.
///
/// Implementations must be cheap to share across tasks; the pool calls
/// `structure` concurrently for independent questions.
pub trait StructuringAdapter: Send + Sync {
    fn structure<'a>(
        &'a self,
        request: &'a StructuringRequest,
    ) -> BoxFuture<'a, Result<AdapterReply, AdapterError>>;
}

// ── LLM-backed adapter ───────────────────────────────────────────────────

/// [`StructuringAdapter`] backed by any `edgequake_llm` provider.
pub struct LlmStructuringAdapter {
    provider: Arc<dyn LLMProvider>,
    system_prompt: Option<String>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmStructuringAdapter {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn build_messages(&self, request: &StructuringRequest) -> Vec<ChatMessage> {
        let system = self
            .system_prompt
            .clone()
            .unwrap_or_else(|| structure_system_prompt(&request.schema.option_keys));
        let mut messages = vec![ChatMessage::system(system)];
        if request.restated {
            messages.push(ChatMessage::system(RESTATE_INSTRUCTION));
        }
        messages.push(ChatMessage::user_with_images(
            structure_user_message(&request.block_text, request.answer_hint),
            request.attachments.clone(),
        ));
        messages
    }
}

impl StructuringAdapter for LlmStructuringAdapter {
    fn structure<'a>(
        &'a self,
        request: &'a StructuringRequest,
    ) -> BoxFuture<'a, Result<AdapterReply, AdapterError>> {
        Box::pin(async move {
            let messages = self.build_messages(request);
            let options = CompletionOptions {
                temperature: Some(self.temperature),
                max_tokens: Some(self.max_tokens),
                ..Default::default()
            };

            let response = self
                .provider
                .chat(&messages, Some(&options))
                .await
                .map_err(|e| AdapterError::Provider(e.to_string()))?;

            debug!(
                "QUESTÃO {:02}: {} input tokens, {} output tokens",
                request.question_id, response.prompt_tokens, response.completion_tokens
            );

            Ok(AdapterReply {
                fields: parse_reply(&response.content)?,
                input_tokens: response.prompt_tokens,
                output_tokens: response.completion_tokens,
            })
        })
    }
}

// ── Reply parsing ────────────────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n?(.*?)\n?```\s*$").unwrap());

/// Parse an adapter reply into fields.
///
/// Accepts a bare object, a fenced object, prose around one object, or a
/// one-element array. Anything else is a schema error.
pub fn parse_reply(content: &str) -> Result<StructuredFields, AdapterError> {
    let trimmed = content.trim();
    let body = RE_FENCED
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str().trim());

    let value: serde_json::Value = serde_json::from_str(body)
        .or_else(|_| {
            let start = body.find('{').ok_or(())?;
            let end = body.rfind('}').ok_or(())?;
            if end <= start {
                return Err(());
            }
            serde_json::from_str(&body[start..=end]).map_err(|_| ())
        })
        .map_err(|_| AdapterError::Schema("reply is not a JSON object".into()))?;

    let object = match value {
        serde_json::Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    };
    if !object.is_object() {
        return Err(AdapterError::Schema(format!(
            "expected a JSON object, got {}",
            json_kind(&object)
        )));
    }
    serde_json::from_value(object).map_err(|e| AdapterError::Schema(e.to_string()))
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn value_to_text(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn nullable_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(value_to_text(serde_json::Value::deserialize(d)?))
}

fn loose_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "sim" | "yes"),
        _ => false,
    })
}

fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::Array(items) => items.into_iter().map(value_to_text).collect(),
        serde_json::Value::Null => Vec::new(),
        other => vec![value_to_text(other)],
    })
}

#[derive(Deserialize)]
struct OptionItem {
    #[serde(alias = "key", alias = "letter")]
    label: String,
    #[serde(default, deserialize_with = "nullable_string")]
    text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OptionsRepr {
    Map(BTreeMap<String, serde_json::Value>),
    List(Vec<OptionItem>),
}

fn options_map<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, String>, D::Error> {
    Ok(match Option::<OptionsRepr>::deserialize(d)? {
        Some(OptionsRepr::Map(m)) => m.into_iter().map(|(k, v)| (k, value_to_text(v))).collect(),
        Some(OptionsRepr::List(items)) => items.into_iter().map(|i| (i.label, i.text)).collect(),
        None => BTreeMap::new(),
    })
}

// ── Worker pool ──────────────────────────────────────────────────────────

/// Outcome for one question after all attempts.
#[derive(Debug, Clone)]
pub struct StructuringResult {
    pub question: u32,
    pub attempts: u32,
    pub outcome: Result<AdapterReply, QuestionError>,
}

/// Structure every request with bounded concurrency.
///
/// Returns one result per request, sorted by question identifier.
pub async fn structure_all(
    adapter: Arc<dyn StructuringAdapter>,
    requests: Vec<StructuringRequest>,
    config: &ExtractionConfig,
) -> Vec<StructuringResult> {
    let total = requests.len();
    let start = Instant::now();
    let limiter = rate_limiter(config.requests_per_minute);
    let limiter = limiter.as_ref();

    let mut results: Vec<StructuringResult> = stream::iter(requests.into_iter().map(|request| {
        let adapter = Arc::clone(&adapter);
        let cancel = config.cancel.clone();
        let progress = config.progress_callback.clone();
        async move {
            structure_one(
                adapter.as_ref(),
                request,
                config,
                Pacing {
                    limiter,
                    cancel: cancel.as_ref(),
                },
                progress.as_ref(),
                total,
            )
            .await
        }
    }))
    .buffer_unordered(config.concurrency.max(1))
    .collect()
    .await;

    results.sort_by_key(|r| r.question);
    info!(
        "Structured {}/{} questions in {}ms",
        results.iter().filter(|r| r.outcome.is_ok()).count(),
        total,
        start.elapsed().as_millis()
    );
    results
}

/// Per-minute quota with a burst of the whole minute; `None` for 0.
fn rate_limiter(requests_per_minute: u32) -> Option<DefaultDirectRateLimiter> {
    NonZeroU32::new(requests_per_minute).map(|rpm| RateLimiter::direct(Quota::per_minute(rpm)))
}

/// What an attempt waits on before it may call the adapter.
#[derive(Clone, Copy)]
struct Pacing<'a> {
    limiter: Option<&'a DefaultDirectRateLimiter>,
    cancel: Option<&'a CancelFlag>,
}

async fn structure_one(
    adapter: &dyn StructuringAdapter,
    mut request: StructuringRequest,
    config: &ExtractionConfig,
    pacing: Pacing<'_>,
    progress: Option<&ProgressCallback>,
    total: usize,
) -> StructuringResult {
    let question = request.question_id;
    let secs = config.api_timeout_secs;
    let per_call = Duration::from_secs(secs);
    let is_cancelled = || pacing.cancel.is_some_and(CancelFlag::is_cancelled);

    let mut attempts = 0u32;
    let mut timeouts = 0u32;
    let mut last_err: Option<AdapterError> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "QUESTÃO {:02}: retry {}/{} after {}ms",
                question, attempt, config.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
            request.restated = true;
        }
        if let Some(limiter) = pacing.limiter {
            limiter.until_ready().await;
        }
        if is_cancelled() {
            debug!("QUESTÃO {:02}: cancelled before attempt {}", question, attempt + 1);
            return StructuringResult {
                question,
                attempts,
                outcome: Err(QuestionError::Cancelled { question }),
            };
        }
        if attempt == 0 {
            if let Some(cb) = progress {
                cb.on_question_start(question, total);
            }
        }

        request.attempt = attempt + 1;
        attempts += 1;
        let result = match timeout(per_call, adapter.structure(&request)).await {
            Ok(r) => r,
            Err(_) => Err(AdapterError::Timeout { secs }),
        };

        match result {
            Ok(reply) => {
                return StructuringResult {
                    question,
                    attempts,
                    outcome: Ok(reply),
                }
            }
            Err(e) => {
                warn!("QUESTÃO {:02}: attempt {} failed: {}", question, attempts, e);
                if matches!(e, AdapterError::Timeout { .. }) {
                    timeouts += 1;
                }
                last_err = Some(e);
            }
        }
    }

    let outcome = if timeouts == attempts {
        QuestionError::Timeout {
            question,
            attempts,
            secs,
        }
    } else {
        QuestionError::AdapterFailed {
            question,
            attempts,
            detail: last_err.map_or_else(|| "unknown error".to_string(), |e| e.to_string()),
        }
    };
    StructuringResult {
        question,
        attempts,
        outcome: Err(outcome),
    }
}
