//! Top-level entry points: exam PDF (+ optional answer key) → [`ExamOutput`].
//!
//! [`convert_exam`] handles the document side (resolve, extract) and hands
//! the extracted pages to [`process_pages`], the pure core that segments,
//! filters, associates, structures, validates and assembles. Tests drive
//! `process_pages` directly with synthetic pages and mock adapters.

use crate::config::ExtractionConfig;
use crate::error::{Exam2JsonError, QuestionError};
use crate::output::{ExamOutput, FlagKind, ImageArtifact, QuestionEntry, RejectionRecord, ReviewFlag, RunStats};
use crate::pipeline::answer_key::{parse_answer_key, split_embedded_key, AnswerKey};
use crate::pipeline::assemble::assemble;
use crate::pipeline::associate::{associate, ImageAssociation};
use crate::pipeline::extract::{extract_pages, RawImage, RawPage};
use crate::pipeline::images::filter_images;
use crate::pipeline::input::{resolve_document, DocumentKind};
use crate::pipeline::normalize::normalize_pages;
use crate::pipeline::segment::{QuestionBlock, Segmenter};
use crate::pipeline::structure::{
    structure_all, LlmStructuringAdapter, QuestionSchema, StructuringAdapter, StructuringRequest,
    StructuringResult,
};
use crate::pipeline::validate::{canonical_label, Validator};
use crate::pipeline::encode;
use edgequake_llm::{ImageData, LLMProvider, ProviderFactory};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// File name of the question array inside an output directory.
pub const QUESTIONS_FILE: &str = "questions.json";

/// Convert an exam PDF (file path or HTTP/HTTPS URL) to structured questions.
///
/// `answer_key` is an optional second document whose answers override the
/// adapter's choice of correct option. Without one, a `GABARITO` section
/// printed after the last question serves as the key.
///
/// # Returns
/// `Ok(ExamOutput)` even when some questions were rejected; check
/// `output.stats.rejected` or call [`ExamOutput::into_result`].
///
/// # Errors
/// Only document-level failures are fatal: unreadable input, no extractable
/// text, no question markers, or no usable provider.
pub async fn convert_exam(
    exam: impl AsRef<str>,
    answer_key: Option<&str>,
    config: &ExtractionConfig,
) -> Result<ExamOutput, Exam2JsonError> {
    let total_start = Instant::now();
    let exam = exam.as_ref();
    info!("Starting extraction: {}", exam);

    // ── Step 1: Resolve inputs ───────────────────────────────────────────
    let exam_doc = resolve_document(exam, DocumentKind::Exam, config.download_timeout_secs).await?;
    let key_doc = match answer_key {
        Some(key) => Some(
            resolve_document(key, DocumentKind::AnswerKey, config.download_timeout_secs).await?,
        ),
        None => None,
    };

    // ── Step 2: Get/create adapter ───────────────────────────────────────
    let adapter = resolve_adapter(config).await?;

    // ── Step 3: Extract pages ────────────────────────────────────────────
    let exam_pages = extract_pages(
        exam_doc.path(),
        DocumentKind::Exam,
        config.password.as_deref(),
        &config.exam_pages,
        true,
    )
    .await?;

    let key_pages = match &key_doc {
        Some(doc) => Some(
            extract_pages(
                doc.path(),
                DocumentKind::AnswerKey,
                config.password.as_deref(),
                &config.answer_key_pages,
                false,
            )
            .await?,
        ),
        None => None,
    };

    // ── Step 4: Run the pipeline ─────────────────────────────────────────
    let mut output = process_pages(&exam_pages, key_pages.as_deref(), adapter, config).await?;
    output.stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    info!(
        "Extraction complete: {}/{} questions structured, {}ms total",
        output.stats.structured, output.stats.total_questions, output.stats.total_duration_ms
    );
    Ok(output)
}

/// Run the pipeline over already extracted pages.
///
/// Deterministic for a deterministic adapter: the same pages always yield
/// the same blocks, image references and entry order.
pub async fn process_pages(
    exam: &[RawPage],
    answer_key: Option<&[RawPage]>,
    adapter: Arc<dyn StructuringAdapter>,
    config: &ExtractionConfig,
) -> Result<ExamOutput, Exam2JsonError> {
    let start = Instant::now();
    let mut flags: Vec<ReviewFlag> = Vec::new();

    // ── Step 1: Normalise and segment ────────────────────────────────────
    let mut text = normalize_pages(exam, DocumentKind::Exam)?;
    let embedded_key = match answer_key {
        Some(_) => None,
        None => split_embedded_key(&mut text, &config.option_keys),
    };
    let segmenter = Segmenter::new(&config.marker_pattern, &config.option_keys)?;
    let mut segmentation = segmenter.segment(&text, DocumentKind::Exam)?;
    segmenter.anchor_markers(&mut segmentation.blocks, exam);
    let blocks = segmentation.blocks;
    flags.append(&mut segmentation.flags);

    // ── Step 2: Filter and associate images ──────────────────────────────
    let raw_images: Vec<RawImage> = exam.iter().flat_map(|p| p.images.iter().cloned()).collect();
    let report = filter_images(&raw_images, &config.image_filter);
    for (img, why) in &report.rejected {
        debug!("Page {} image {} dropped: {}", img.page + 1, img.sequence + 1, why);
    }
    let mut association = associate(&blocks, &report.candidates);
    flags.append(&mut association.flags);

    // ── Step 3: Answer key ───────────────────────────────────────────────
    let key = match answer_key {
        Some(pages) => Some(load_answer_key(pages, config, &mut flags)),
        None => embedded_key,
    };

    // ── Step 4: Structure ────────────────────────────────────────────────
    let total = blocks.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_run_start(total);
    }
    let requests = build_requests(&blocks, &association, key.as_ref(), config);
    let adapter_start = Instant::now();
    let results = structure_all(adapter, requests, config).await;
    let adapter_duration_ms = adapter_start.elapsed().as_millis() as u64;

    // ── Step 5: Validate ─────────────────────────────────────────────────
    let validator = Validator::new(&config.option_keys, key.as_ref());
    let mut by_id: BTreeMap<u32, StructuringResult> =
        results.into_iter().map(|r| (r.question, r)).collect();
    let (mut input_tokens, mut output_tokens) = (0u64, 0u64);
    let mut entries: Vec<(u32, QuestionEntry)> = Vec::with_capacity(total);

    for block in &blocks {
        let outcome = match by_id.remove(&block.id) {
            Some(r) => r.outcome,
            None => Err(QuestionError::Cancelled { question: block.id }),
        };
        let entry = match outcome {
            Ok(reply) => {
                input_tokens += reply.input_tokens as u64;
                output_tokens += reply.output_tokens as u64;
                let mut validated =
                    validator.validate(block, &reply.fields, association.references(block.id));
                flags.append(&mut validated.flags);
                match validated.outcome {
                    Ok(question) => QuestionEntry::Structured(question),
                    Err(e) => reject(block, e),
                }
            }
            Err(e) => reject(block, e),
        };

        if let Some(ref cb) = config.progress_callback {
            match &entry {
                QuestionEntry::Structured(_) => cb.on_question_complete(block.id, total),
                QuestionEntry::Rejected(r) => cb.on_question_rejected(block.id, total, &r.reason),
            }
        }
        entries.push((block.id, entry));
    }

    // ── Step 6: Assemble ─────────────────────────────────────────────────
    let mut assembly = assemble(entries);
    flags.append(&mut assembly.flags);
    let images = collect_artifacts(&assembly.questions, &association);

    let stats = RunStats {
        total_questions: assembly.questions.len(),
        structured: assembly.structured_count(),
        rejected: assembly.rejected_count(),
        images_extracted: raw_images.len(),
        images_retained: report.candidates.len(),
        images_assigned: association.assigned_count(),
        total_input_tokens: input_tokens,
        total_output_tokens: output_tokens,
        total_duration_ms: start.elapsed().as_millis() as u64,
        adapter_duration_ms,
    };

    if let Some(ref cb) = config.progress_callback {
        cb.on_run_complete(stats.total_questions, stats.structured);
    }
    if stats.rejected > 0 {
        warn!("{} of {} questions rejected", stats.rejected, stats.total_questions);
    }

    Ok(ExamOutput {
        questions: assembly.questions,
        flags,
        stats,
        images,
    })
}

/// Convert an exam and write `questions.json` plus the question images
/// into `out_dir`.
pub async fn convert_exam_to_dir(
    exam: impl AsRef<str>,
    answer_key: Option<&str>,
    out_dir: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExamOutput, Exam2JsonError> {
    let output = convert_exam(exam, answer_key, config).await?;
    let dir = out_dir.as_ref();
    write_output(&output, &dir.join(QUESTIONS_FILE), dir).await?;
    Ok(output)
}

/// Persist an [`ExamOutput`]: the question array at `json_path` and one
/// JPEG per image reference under `images_dir`.
///
/// The JSON file is written atomically (temp file + rename).
pub async fn write_output(
    output: &ExamOutput,
    json_path: &Path,
    images_dir: &Path,
) -> Result<(), Exam2JsonError> {
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| Exam2JsonError::OutputWriteFailed { path, source }
    };

    if let Some(parent) = json_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(write_err(json_path))?;
    }
    if !output.images.is_empty() {
        tokio::fs::create_dir_all(images_dir)
            .await
            .map_err(write_err(images_dir))?;
    }

    for artifact in &output.images {
        let path = images_dir.join(&artifact.reference);
        let bytes = encode::encode_jpeg(&artifact.image).map_err(|e| {
            Exam2JsonError::Internal(format!("JPEG encoding failed for {}: {e}", artifact.reference))
        })?;
        tokio::fs::write(&path, bytes).await.map_err(write_err(&path))?;
    }

    let json = output.questions_json()?;
    let tmp_path = json_path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json)
        .await
        .map_err(write_err(json_path))?;
    tokio::fs::rename(&tmp_path, json_path)
        .await
        .map_err(write_err(json_path))?;

    info!(
        "Wrote {} questions to {} and {} images to {}",
        output.questions.len(),
        json_path.display(),
        output.images.len(),
        images_dir.display()
    );
    Ok(())
}

/// Synchronous wrapper around [`convert_exam`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_exam_sync(
    exam: impl AsRef<str>,
    answer_key: Option<&str>,
    config: &ExtractionConfig,
) -> Result<ExamOutput, Exam2JsonError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Exam2JsonError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert_exam(exam, answer_key, config))
}

/// Convert exam PDF bytes held in memory.
///
/// The bytes are written to managed temp files that are removed on return.
///
/// # Example
/// ```rust,no_run
/// use edgequake_exam2json::{convert_exam_from_bytes, ExtractionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let exam = std::fs::read("prova.pdf")?;
/// let key = std::fs::read("gabarito.pdf")?;
/// let config = ExtractionConfig::default();
/// let output = convert_exam_from_bytes(&exam, Some(key.as_slice()), &config).await?;
/// println!("{}", output.questions_json()?);
/// # Ok(())
/// # }
/// ```
pub async fn convert_exam_from_bytes(
    exam: &[u8],
    answer_key: Option<&[u8]>,
    config: &ExtractionConfig,
) -> Result<ExamOutput, Exam2JsonError> {
    let exam_tmp = bytes_to_tempfile(exam)?;
    let key_tmp = answer_key.map(bytes_to_tempfile).transpose()?;
    let exam_path = exam_tmp.path().to_string_lossy().to_string();
    let key_path = key_tmp
        .as_ref()
        .map(|t| t.path().to_string_lossy().to_string());
    // The temp files are deleted when they drop, after `convert_exam` returns
    convert_exam(&exam_path, key_path.as_deref(), config).await
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn bytes_to_tempfile(bytes: &[u8]) -> Result<tempfile::NamedTempFile, Exam2JsonError> {
    let mut tmp = tempfile::NamedTempFile::new()
        .map_err(|e| Exam2JsonError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| Exam2JsonError::Internal(format!("tempfile write: {e}")))?;
    Ok(tmp)
}

fn reject(block: &QuestionBlock, error: QuestionError) -> QuestionEntry {
    warn!("{}: rejected: {}", canonical_label(block.id), error);
    QuestionEntry::Rejected(RejectionRecord::new(
        canonical_label(block.id),
        error,
        block.adapter_text(),
    ))
}

/// Parse the answer-key pages. An unusable document yields an empty key and
/// a flag; the exam proceeds without it.
fn load_answer_key(
    pages: &[RawPage],
    config: &ExtractionConfig,
    flags: &mut Vec<ReviewFlag>,
) -> AnswerKey {
    let key = match normalize_pages(pages, DocumentKind::AnswerKey) {
        Ok(text) => parse_answer_key(&text, &config.option_keys),
        Err(e) => {
            warn!("Answer key unusable: {}", e);
            AnswerKey::default()
        }
    };
    if key.is_empty() {
        flags.push(ReviewFlag::new(
            None,
            FlagKind::AnswerKeyEmpty,
            "answer-key document produced no entries; correct options come from the adapter",
        ));
    }
    key
}

fn build_requests(
    blocks: &[QuestionBlock],
    association: &ImageAssociation,
    key: Option<&AnswerKey>,
    config: &ExtractionConfig,
) -> Vec<StructuringRequest> {
    let schema = QuestionSchema {
        option_keys: config.option_keys.clone(),
    };
    blocks
        .iter()
        .map(|block| StructuringRequest {
            question_id: block.id,
            block_text: block.adapter_text(),
            schema: schema.clone(),
            answer_hint: key.and_then(|k| k.get(block.id)),
            attachments: if config.attach_images {
                attachments_for(block.id, association)
            } else {
                Vec::new()
            },
            attempt: 0,
            restated: false,
        })
        .collect()
}

fn attachments_for(question: u32, association: &ImageAssociation) -> Vec<ImageData> {
    association
        .assignments
        .get(&question)
        .into_iter()
        .flatten()
        .filter_map(|a| match encode::encode_attachment(&a.image.image) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Failed to encode {}: {}", a.reference, e);
                None
            }
        })
        .collect()
}

/// Pixel data for every image referenced by a structured entry.
fn collect_artifacts(questions: &[QuestionEntry], association: &ImageAssociation) -> Vec<ImageArtifact> {
    questions
        .iter()
        .filter_map(QuestionEntry::as_structured)
        .flat_map(|q| q.images.iter())
        .filter_map(|reference| {
            association
                .assignments
                .values()
                .flatten()
                .find(|a| &a.reference == reference)
                .map(|a| ImageArtifact {
                    reference: a.reference.clone(),
                    image: Arc::clone(&a.image.image),
                })
        })
        .collect()
}

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, Exam2JsonError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Exam2JsonError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the Structuring Adapter, from most-specific to least-specific:
///
/// 1. **Pre-built adapter** (`config.adapter`), used as-is.
/// 2. **Pre-built provider** (`config.provider`), wrapped in
///    [`LlmStructuringAdapter`].
/// 3. **Named provider + model** (`config.provider_name`).
/// 4. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 5. **`OPENAI_API_KEY`** present → OpenAI.
/// 6. **Full auto-detection** (`ProviderFactory::from_env`).
pub async fn resolve_adapter(
    config: &ExtractionConfig,
) -> Result<Arc<dyn StructuringAdapter>, Exam2JsonError> {
    if let Some(ref adapter) = config.adapter {
        return Ok(Arc::clone(adapter));
    }
    let provider = resolve_provider(config)?;
    Ok(Arc::new(LlmStructuringAdapter::new(provider, config)))
}

fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, Exam2JsonError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let default_model = || config.model.as_deref().unwrap_or("gpt-4.1-mini");

    if let Some(ref name) = config.provider_name {
        return create_provider(name, default_model());
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", default_model());
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Exam2JsonError::ProviderNotConfigured {
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
