//! Final assembly: per-question entries → ordered output array.
//!
//! Entries are ordered by identifier. Every identifier between the first and
//! the last detected marker gets exactly one entry; a gap in the detected
//! sequence becomes a `missing` rejection record plus a review flag.

use crate::error::QuestionError;
use crate::output::{FlagKind, QuestionEntry, RejectionRecord, ReviewFlag};
use crate::pipeline::validate::canonical_label;
use std::collections::BTreeMap;
use tracing::warn;

/// Ordered entries plus the flags raised while filling gaps.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub questions: Vec<QuestionEntry>,
    pub flags: Vec<ReviewFlag>,
}

impl Assembly {
    pub fn structured_count(&self) -> usize {
        self.questions.iter().filter(|q| !q.is_rejected()).count()
    }

    pub fn rejected_count(&self) -> usize {
        self.questions.iter().filter(|q| q.is_rejected()).count()
    }
}

/// Order `entries` by identifier and fill gaps in the detected range.
///
/// Identifiers are unique by construction; a duplicate keeps the first entry.
pub fn assemble(entries: Vec<(u32, QuestionEntry)>) -> Assembly {
    let mut by_id: BTreeMap<u32, QuestionEntry> = BTreeMap::new();
    for (id, entry) in entries {
        by_id.entry(id).or_insert(entry);
    }

    let mut out = Assembly::default();
    let (Some(&first), Some(&last)) = (by_id.keys().next(), by_id.keys().next_back()) else {
        return out;
    };

    for id in first..=last {
        match by_id.remove(&id) {
            Some(entry) => out.questions.push(entry),
            None => {
                warn!("QUESTÃO {:02}: no marker detected, emitting placeholder", id);
                out.flags.push(ReviewFlag::new(
                    Some(id),
                    FlagKind::MissingIdentifier,
                    format!("no marker for {} between {} and {}", canonical_label(id), first, last),
                ));
                out.questions.push(QuestionEntry::Rejected(RejectionRecord::new(
                    canonical_label(id),
                    QuestionError::Missing { question: id },
                    "",
                )));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(id: u32) -> (u32, QuestionEntry) {
        (
            id,
            QuestionEntry::Rejected(RejectionRecord::new(
                canonical_label(id),
                QuestionError::Cancelled { question: id },
                "",
            )),
        )
    }

    #[test]
    fn orders_by_identifier() {
        let a = assemble(vec![rejected(3), rejected(1), rejected(2)]);
        let labels: Vec<&str> = a.questions.iter().map(QuestionEntry::label).collect();
        assert_eq!(labels, vec!["QUESTÃO 01", "QUESTÃO 02", "QUESTÃO 03"]);
        assert!(a.flags.is_empty());
    }

    #[test]
    fn gaps_become_missing_placeholders() {
        let a = assemble(vec![rejected(4), rejected(7)]);
        assert_eq!(a.questions.len(), 4);
        let missing: Vec<u32> = a
            .questions
            .iter()
            .filter_map(QuestionEntry::as_rejected)
            .filter(|r| matches!(r.error, QuestionError::Missing { .. }))
            .map(|r| r.error.question())
            .collect();
        assert_eq!(missing, vec![5, 6]);
        assert_eq!(a.flags.len(), 2);
        assert!(a.flags.iter().all(|f| f.kind == FlagKind::MissingIdentifier));
    }

    #[test]
    fn empty_input_is_empty_output() {
        let a = assemble(vec![]);
        assert!(a.questions.is_empty());
        assert_eq!(a.structured_count() + a.rejected_count(), 0);
    }
}
