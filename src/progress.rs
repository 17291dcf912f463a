//! Progress-callback trait for per-question extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events while the worker pool structures questions. Callers can forward
//! them to a channel, a log sink or a terminal progress bar without the
//! library knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_exam2json::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl ExtractionProgressCallback for Counter {
//!     fn on_question_complete(&self, question: u32, total: usize) {
//!         let done = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("QUESTÃO {question:02} done ({done}/{total})");
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it structures each question.
///
/// Questions are structured concurrently, so `on_question_*` may be invoked
/// from several tasks at once. Every method defaults to a no-op.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after segmentation, before any adapter call.
    fn on_run_start(&self, total_questions: usize) {
        let _ = total_questions;
    }

    /// Called just before the first adapter attempt for a question.
    fn on_question_start(&self, question: u32, total: usize) {
        let _ = (question, total);
    }

    /// Called when a question was structured and passed validation.
    fn on_question_complete(&self, question: u32, total: usize) {
        let _ = (question, total);
    }

    /// Called when a question ended up as a rejection record.
    fn on_question_rejected(&self, question: u32, total: usize, reason: &str) {
        let _ = (question, total, reason);
    }

    /// Called once after assembly.
    fn on_run_complete(&self, total_questions: usize, structured: usize) {
        let _ = (total_questions, structured);
    }
}

/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
