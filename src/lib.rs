//! # edgequake-exam2json
//!
//! Turn exam PDFs (multiple-choice booklets) into one JSON record per
//! question, with the question's images extracted alongside.
//!
//! ## Why this crate?
//!
//! Exam booklets mix prose passages, cited sources, figures and five-option
//! answer lists across page boundaries. Sending whole pages to a model loses
//! track of which figure belongs to which question. This crate cuts the text
//! deterministically at the question markers, keeps only images that carry
//! content, binds each one to exactly one question by layout, and asks the
//! model only to split a single question into fields. Everything the model
//! returns is checked, and an answer key beats the model's guess.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF (+ answer key PDF)
//!  │
//!  ├─ 1. Input      resolve local file or download from URL
//!  ├─ 2. Extract    text, positioned spans, embedded images (pdfium)
//!  ├─ 3. Normalize  dehyphenate, collapse artefacts, keep page provenance
//!  ├─ 4. Segment    one block per "QUESTÃO NN" marker
//!  ├─ 5. Images     size / aspect / colour / repetition gates
//!  ├─ 6. Associate  image → question by page range and marker position
//!  ├─ 7. Structure  concurrent adapter calls, timeout + retry
//!  ├─ 8. Validate   canonical labels, options, answer-key override
//!  └─ 9. Assemble   ordered entries, rejections for what failed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_exam2json::{convert_exam_to_dir, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let output = convert_exam_to_dir("prova.pdf", Some("gabarito.pdf"), "out/", &config).await?;
//!     eprintln!(
//!         "{}/{} questions structured, {} images",
//!         output.stats.structured, output.stats.total_questions, output.images.len()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `exam2json` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-exam2json = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, ImageFilterConfig, PageSelection};
pub use convert::{
    convert_exam, convert_exam_from_bytes, convert_exam_sync, convert_exam_to_dir, process_pages,
    resolve_adapter, write_output,
};
pub use error::{AdapterError, Exam2JsonError, QuestionError};
pub use output::{
    ExamOutput, FlagKind, ImageArtifact, QuestionEntry, RejectionRecord, ReviewFlag, RunStats,
    StructuredQuestion,
};
pub use pipeline::structure::{
    AdapterReply, CancelFlag, LlmStructuringAdapter, StructuredFields, StructuringAdapter,
    StructuringRequest,
};
pub use pipeline::validate::revalidate;
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
