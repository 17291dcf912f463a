//! Output types: validated question records, rejection records, review
//! flags and run statistics.
//!
//! `questions.json` is the serialised `ExamOutput::questions` array; every
//! element is either the eight-field [`StructuredQuestion`] object or a
//! [`RejectionRecord`] carrying `"rejected": true`. Flags and stats travel
//! next to it so a reviewer can see why an entry looks the way it does.

use crate::error::{Exam2JsonError, QuestionError};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One validated question, exactly as it appears in `questions.json`.
///
/// Field order matches the documented output object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredQuestion {
    /// Canonical label, e.g. `"QUESTÃO 07"`.
    pub question: String,
    /// True iff `images` is non-empty.
    pub image: bool,
    /// Stable image references (filenames), in page/position order.
    pub images: Vec<String>,
    pub passage_text: String,
    pub sources: Vec<String>,
    pub statement: String,
    /// Option key → text. Keys are single uppercase letters.
    pub options: BTreeMap<String, String>,
    /// Always a key of `options`.
    pub correct_option: String,
}

/// Placeholder for a question that could not be structured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    /// Canonical label of the rejected question.
    pub question: String,
    /// Always `true`; lets consumers tell entries apart without a schema.
    pub rejected: bool,
    /// Human-readable reason.
    pub reason: String,
    pub error: QuestionError,
    /// The block text as the segmenter produced it (empty for gaps).
    pub raw_block: String,
}

impl RejectionRecord {
    pub fn new(label: impl Into<String>, error: QuestionError, raw_block: impl Into<String>) -> Self {
        Self {
            question: label.into(),
            rejected: true,
            reason: error.to_string(),
            error,
            raw_block: raw_block.into(),
        }
    }
}

/// One element of the output array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuestionEntry {
    Structured(StructuredQuestion),
    Rejected(RejectionRecord),
}

impl QuestionEntry {
    pub fn label(&self) -> &str {
        match self {
            QuestionEntry::Structured(q) => &q.question,
            QuestionEntry::Rejected(r) => &r.question,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, QuestionEntry::Rejected(_))
    }

    pub fn as_structured(&self) -> Option<&StructuredQuestion> {
        match self {
            QuestionEntry::Structured(q) => Some(q),
            QuestionEntry::Rejected(_) => None,
        }
    }

    pub fn as_rejected(&self) -> Option<&RejectionRecord> {
        match self {
            QuestionEntry::Rejected(r) => Some(r),
            QuestionEntry::Structured(_) => None,
        }
    }
}

// ── Review flags ─────────────────────────────────────────────────────────

/// What a review flag is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    /// Two markers on one line; the boundary is a best guess.
    LowConfidenceBoundary,
    /// A marker repeated or went backwards and was not used as a boundary.
    NonMonotonicIdentifier,
    /// A marker was immediately followed by the next one.
    EmptyBlock,
    /// An image landed on a shared page without usable position data.
    AmbiguousImage,
    /// A retained image fell outside every question's page range.
    UnassignedImage,
    /// The answer key overruled the adapter's correct option.
    AnswerKeyOverride,
    /// An answer key was supplied but has no entry for this question.
    AnswerKeyMissing,
    /// The answer-key document produced no entries at all.
    AnswerKeyEmpty,
    /// The adapter's image claim disagrees with the association.
    ImageClaimMismatch,
    /// Options came from the segmenter because the adapter returned none.
    OptionsBackfilled,
    /// An identifier inside the detected range has no marker.
    MissingIdentifier,
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlagKind::LowConfidenceBoundary => "low-confidence boundary",
            FlagKind::NonMonotonicIdentifier => "non-monotonic identifier",
            FlagKind::EmptyBlock => "empty block",
            FlagKind::AmbiguousImage => "ambiguous image",
            FlagKind::UnassignedImage => "unassigned image",
            FlagKind::AnswerKeyOverride => "answer-key override",
            FlagKind::AnswerKeyMissing => "answer-key entry missing",
            FlagKind::AnswerKeyEmpty => "empty answer key",
            FlagKind::ImageClaimMismatch => "image claim mismatch",
            FlagKind::OptionsBackfilled => "options backfilled",
            FlagKind::MissingIdentifier => "missing identifier",
        };
        f.write_str(s)
    }
}

/// Something a human should double-check. Never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFlag {
    /// Question the flag refers to; `None` for document-level flags.
    pub question: Option<u32>,
    pub kind: FlagKind,
    pub detail: String,
}

impl ReviewFlag {
    pub fn new(question: Option<u32>, kind: FlagKind, detail: impl Into<String>) -> Self {
        Self {
            question,
            kind,
            detail: detail.into(),
        }
    }
}

// ── Run output ───────────────────────────────────────────────────────────

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Distinct identifiers from the first to the last detected marker.
    pub total_questions: usize,
    pub structured: usize,
    pub rejected: usize,
    pub images_extracted: usize,
    pub images_retained: usize,
    pub images_assigned: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
    pub adapter_duration_ms: u64,
}

/// An image kept for a question, ready to be written as `reference`.
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    pub reference: String,
    pub image: Arc<DynamicImage>,
}

/// The terminal artifact of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ExamOutput {
    /// Entries in ascending identifier order, one per identifier in range.
    pub questions: Vec<QuestionEntry>,
    pub flags: Vec<ReviewFlag>,
    pub stats: RunStats,
    /// Pixel data for every reference in `questions[*].images`.
    #[serde(skip)]
    pub images: Vec<ImageArtifact>,
}

impl ExamOutput {
    /// Records that passed validation.
    pub fn structured(&self) -> impl Iterator<Item = &StructuredQuestion> {
        self.questions.iter().filter_map(QuestionEntry::as_structured)
    }

    /// Rejection placeholders.
    pub fn rejected(&self) -> impl Iterator<Item = &RejectionRecord> {
        self.questions.iter().filter_map(QuestionEntry::as_rejected)
    }

    /// `questions` as the pretty-printed JSON array written to disk.
    pub fn questions_json(&self) -> Result<String, Exam2JsonError> {
        serde_json::to_string_pretty(&self.questions)
            .map_err(|e| Exam2JsonError::Internal(format!("Failed to serialise questions: {e}")))
    }

    /// Treat any rejection as an error.
    pub fn into_result(self) -> Result<Self, Exam2JsonError> {
        let rejected = self.stats.rejected;
        if rejected == 0 {
            Ok(self)
        } else {
            Err(Exam2JsonError::PartialFailure {
                structured: self.stats.structured,
                rejected,
                total: self.questions.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StructuredQuestion {
        StructuredQuestion {
            question: "QUESTÃO 01".into(),
            image: false,
            images: vec![],
            passage_text: String::new(),
            sources: vec![],
            statement: "Qual?".into(),
            options: [("A", "um"), ("B", "dois")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            correct_option: "B".into(),
        }
    }

    #[test]
    fn structured_serialises_exact_field_order() {
        let json = serde_json::to_string(&sample()).unwrap();
        let order = [
            "\"question\"",
            "\"image\"",
            "\"images\"",
            "\"passage_text\"",
            "\"sources\"",
            "\"statement\"",
            "\"options\"",
            "\"correct_option\"",
        ];
        let positions: Vec<usize> = order.iter().map(|k| json.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{json}");
    }

    #[test]
    fn untagged_entry_round_trips_both_shapes() {
        let entries = vec![
            QuestionEntry::Structured(sample()),
            QuestionEntry::Rejected(RejectionRecord::new(
                "QUESTÃO 02",
                QuestionError::Cancelled { question: 2 },
                "QUESTÃO 02\n...",
            )),
        ];
        let json = serde_json::to_string(&entries).unwrap();
        let back: Vec<QuestionEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entries);
        assert!(back[1].is_rejected());
        assert_eq!(back[1].label(), "QUESTÃO 02");
    }

    #[test]
    fn into_result_reports_partial_failure() {
        let out = ExamOutput {
            questions: vec![
                QuestionEntry::Structured(sample()),
                QuestionEntry::Rejected(RejectionRecord::new(
                    "QUESTÃO 02",
                    QuestionError::Missing { question: 2 },
                    "",
                )),
            ],
            flags: vec![],
            stats: RunStats {
                structured: 1,
                rejected: 1,
                ..RunStats::default()
            },
            images: vec![],
        };
        let err = out.into_result().unwrap_err();
        assert!(err.to_string().contains("1/2"));
    }
}
