//! Error types for the edgequake-exam2json library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`Exam2JsonError`]: **fatal** for a document: the run cannot produce
//!   output for it at all (bad input file, wrong password, no extractable
//!   text, no question markers, provider not configured). Returned as
//!   `Err(Exam2JsonError)` from the top-level `convert_exam*` functions.
//!
//! * [`QuestionError`]: **non-fatal**: a single question could not be
//!   structured or validated. Stored in the rejection record inside
//!   [`crate::output::ExamOutput`] so the rest of the exam is preserved.
//!
//! * [`AdapterError`]: the outcome of one failed Structuring Adapter
//!   attempt. Retried by the worker pool, then folded into a
//!   [`QuestionError`].

use crate::pipeline::input::DocumentKind;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-exam2json library.
#[derive(Debug, Error)]
pub enum Exam2JsonError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("{kind} PDF not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { kind: DocumentKind, path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("{kind} file is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf {
        kind: DocumentKind,
        path: PathBuf,
        magic: [u8; 4],
    },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The page selection matched no page of the document.
    #[error("{kind}: page selection is out of range (document has {total} pages)")]
    PageOutOfRange { kind: DocumentKind, total: usize },

    /// pdfium failed on a specific page.
    #[error("{kind}: extraction failed on page {page}: {detail}")]
    ExtractionFailed {
        kind: DocumentKind,
        page: usize,
        detail: String,
    },

    // ── Document-level pipeline errors ────────────────────────────────────
    /// The document has no extractable text (empty, or image-only scan).
    #[error(
        "NormalizationError: {kind} has no extractable text across {pages} page(s){}",
        page_context(.empty_pages)
    )]
    Normalization {
        kind: DocumentKind,
        pages: usize,
        /// 1-indexed pages that produced zero characters.
        empty_pages: Vec<usize>,
    },

    /// No question marker was found in the exam text.
    #[error("NoMarkersFoundError: no question marker matched in {kind} ({lines} normalized lines scanned)")]
    NoMarkersFound { kind: DocumentKind, lines: usize },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Some questions were structured but at least one was rejected.
    ///
    /// Returned by [`crate::output::ExamOutput::into_result`] when the
    /// caller wants to treat any rejection as an error.
    #[error("{rejected}/{total} questions were rejected")]
    PartialFailure {
        structured: usize,
        rejected: usize,
        total: usize,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Place libpdfium next to the executable, install it system-wide, or\n\
set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn page_context(empty_pages: &[usize]) -> String {
    if empty_pages.is_empty() {
        String::new()
    } else {
        let list: Vec<String> = empty_pages.iter().map(|p| p.to_string()).collect();
        format!(" (empty pages: {})", list.join(", "))
    }
}

/// A non-fatal error for a single question.
///
/// Carried by [`crate::output::RejectionRecord`]; the run continues.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionError {
    /// Adapter kept failing after the configured retries.
    #[error("question {question}: structuring failed after {attempts} attempt(s): {detail}")]
    AdapterFailed {
        question: u32,
        attempts: u32,
        detail: String,
    },

    /// Every attempt timed out.
    #[error("question {question}: structuring timed out after {attempts} attempt(s) of {secs}s")]
    Timeout {
        question: u32,
        attempts: u32,
        secs: u64,
    },

    /// The run was cancelled before this question was (re)submitted.
    #[error("question {question}: cancelled before structuring completed")]
    Cancelled { question: u32 },

    /// The structured fields were inconsistent and could not be repaired.
    #[error("question {question}: {reason}")]
    Invalid { question: u32, reason: String },

    /// The identifier lies in a gap of the detected sequence.
    #[error("question {question}: no marker detected for this identifier")]
    Missing { question: u32 },
}

impl QuestionError {
    /// Identifier of the question this error belongs to.
    pub fn question(&self) -> u32 {
        match self {
            QuestionError::AdapterFailed { question, .. }
            | QuestionError::Timeout { question, .. }
            | QuestionError::Cancelled { question }
            | QuestionError::Invalid { question, .. }
            | QuestionError::Missing { question } => *question,
        }
    }
}

/// Outcome of one failed Structuring Adapter attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    /// The call exceeded the per-call timeout.
    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The backing service returned an error.
    #[error("provider error: {0}")]
    Provider(String),

    /// The reply did not conform to the declared output schema.
    #[error("reply does not match the question schema: {0}")]
    Schema(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_display() {
        let e = Exam2JsonError::PartialFailure {
            structured: 44,
            rejected: 1,
            total: 45,
        };
        assert!(e.to_string().contains("1/45"), "got: {e}");
    }

    #[test]
    fn normalization_display_lists_empty_pages() {
        let e = Exam2JsonError::Normalization {
            kind: DocumentKind::Exam,
            pages: 3,
            empty_pages: vec![1, 2, 3],
        };
        let msg = e.to_string();
        assert!(msg.starts_with("NormalizationError"), "got: {msg}");
        assert!(msg.contains("empty pages: 1, 2, 3"), "got: {msg}");
    }

    #[test]
    fn no_markers_display() {
        let e = Exam2JsonError::NoMarkersFound {
            kind: DocumentKind::Exam,
            lines: 12,
        };
        assert!(e.to_string().contains("12 normalized lines"));
    }

    #[test]
    fn question_error_serialises_with_kind_tag() {
        let e = QuestionError::Timeout {
            question: 2,
            attempts: 2,
            secs: 60,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(e.question(), 2);
    }
}
