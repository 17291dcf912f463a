//! Validation and enrichment: adapter fields + block + images → final record.
//!
//! The adapter's output is a suggestion. This stage decides the label,
//! option set, correct option and image fields from deterministic sources
//! whenever one is available:
//!
//! * the label comes from the block identifier, never from the adapter;
//! * raw options parsed from the booklet fill in empty or missing ones;
//! * the answer key overrides the adapter's correct option;
//! * `images` comes from the association and `image` follows from it.
//!
//! Whatever cannot be repaired becomes a [`QuestionError::Invalid`]; the
//! caller turns it into a rejection record.

use crate::error::QuestionError;
use crate::output::{FlagKind, ReviewFlag, StructuredQuestion};
use crate::pipeline::answer_key::AnswerKey;
use crate::pipeline::segment::{QuestionBlock, RawOption};
use crate::pipeline::structure::StructuredFields;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

/// Most sources kept per question.
pub const MAX_SOURCES: usize = 5;

static RE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,3})").unwrap());

/// `A) texto` / `(A) texto` / `A. texto` at the start of option text.
static RE_OPTION_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?([A-Za-z])\s*[).:\-–]\s+").unwrap());

/// Display label for a question identifier.
pub fn canonical_label(id: u32) -> String {
    format!("QUESTÃO {id:02}")
}

/// Identifier from any label form: `QUESTÃO 07`, `Questão nº 7`, `Q. 7`, `7`.
pub fn extract_question_number(label: &str) -> Option<u32> {
    RE_NUMBER
        .captures(label)
        .and_then(|c| c[1].parse().ok())
}

/// `"a)"`, `"(B)"`, `" c. "` → `'A'`, `'B'`, `'C'`.
pub fn normalize_option_key(raw: &str) -> Option<char> {
    let trimmed = raw.trim_matches(|c: char| c.is_whitespace() || "()[].:-".contains(c));
    let mut chars = trimmed.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(c.to_ascii_uppercase()),
        _ => None,
    }
}

/// Result of validating one question.
#[derive(Debug, Clone)]
pub struct Validated {
    pub outcome: Result<StructuredQuestion, QuestionError>,
    pub flags: Vec<ReviewFlag>,
}

/// Validation rules for one run.
pub struct Validator<'a> {
    option_keys: &'a [char],
    answer_key: Option<&'a AnswerKey>,
}

impl<'a> Validator<'a> {
    pub fn new(option_keys: &'a [char], answer_key: Option<&'a AnswerKey>) -> Self {
        Self {
            option_keys,
            answer_key,
        }
    }

    /// Validate the adapter's fields for `block`, with the image references
    /// the associator assigned to it.
    pub fn validate(
        &self,
        block: &QuestionBlock,
        fields: &StructuredFields,
        images: Vec<String>,
    ) -> Validated {
        let mut flags = Vec::new();
        let outcome = self.check(
            block.id,
            fields,
            &block.options,
            &block.statement,
            images,
            &mut flags,
        );
        Validated { outcome, flags }
    }

    fn check(
        &self,
        id: u32,
        fields: &StructuredFields,
        raw_options: &[RawOption],
        raw_statement: &str,
        images: Vec<String>,
        flags: &mut Vec<ReviewFlag>,
    ) -> Result<StructuredQuestion, QuestionError> {
        let invalid = |reason: String| QuestionError::Invalid {
            question: id,
            reason,
        };

        let options = self.resolve_options(id, fields, raw_options, flags)?;
        let correct_option = self.resolve_correct_option(id, fields, &options, flags)?;

        let statement = match fields.statement.trim() {
            "" => raw_statement.trim(),
            s => s,
        };
        if statement.is_empty() {
            return Err(invalid("statement is empty".into()));
        }

        let image = !images.is_empty();
        if fields.image != image {
            flags.push(ReviewFlag::new(
                Some(id),
                FlagKind::ImageClaimMismatch,
                format!(
                    "adapter says image={}, {} image(s) associated",
                    fields.image,
                    images.len()
                ),
            ));
        }

        Ok(StructuredQuestion {
            question: canonical_label(id),
            image,
            images,
            passage_text: fields.passage_text.trim().to_string(),
            sources: clean_sources(&fields.sources),
            statement: statement.to_string(),
            options,
            correct_option: correct_option.to_string(),
        })
    }

    fn resolve_options(
        &self,
        id: u32,
        fields: &StructuredFields,
        raw_options: &[RawOption],
        flags: &mut Vec<ReviewFlag>,
    ) -> Result<BTreeMap<String, String>, QuestionError> {
        let invalid = |reason: String| QuestionError::Invalid {
            question: id,
            reason,
        };

        let mut options: BTreeMap<char, String> = BTreeMap::new();
        for (raw_key, text) in &fields.options {
            let key = normalize_option_key(raw_key)
                .ok_or_else(|| invalid(format!("option key '{raw_key}' is not a single letter")))?;
            if options.insert(key, strip_key_prefix(key, text)).is_some() {
                return Err(invalid(format!("option key '{key}' appears twice")));
            }
        }

        if options.is_empty() && raw_options.len() >= 2 {
            flags.push(ReviewFlag::new(
                Some(id),
                FlagKind::OptionsBackfilled,
                "adapter returned no options; using the options printed in the booklet",
            ));
            options = raw_options.iter().map(|o| (o.key, o.text.clone())).collect();
        }

        for (key, text) in options.iter_mut() {
            if text.is_empty() {
                if let Some(raw) = raw_options.iter().find(|o| o.key == *key) {
                    text.clone_from(&raw.text);
                }
            }
            if text.is_empty() {
                return Err(invalid(format!("option {key} has no text")));
            }
        }

        let keys: Vec<char> = options.keys().copied().collect();
        let expected = &self.option_keys[..keys.len().min(self.option_keys.len())];
        if keys.len() < 2 || keys != expected {
            let got: String = keys.iter().collect();
            let allowed: String = self.option_keys.iter().collect();
            return Err(invalid(format!(
                "options '{got}' are not a run of at least two keys from '{allowed}'"
            )));
        }

        Ok(options
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect())
    }

    fn resolve_correct_option(
        &self,
        id: u32,
        fields: &StructuredFields,
        options: &BTreeMap<String, String>,
        flags: &mut Vec<ReviewFlag>,
    ) -> Result<char, QuestionError> {
        let invalid = |reason: String| QuestionError::Invalid {
            question: id,
            reason,
        };
        let in_options = |k: char| options.contains_key(k.to_string().as_str());
        let suggested = normalize_option_key(&fields.correct_option);

        if let Some(key) = self.answer_key {
            match key.get(id) {
                Some(official) if in_options(official) => {
                    if let Some(guess) = suggested.filter(|g| *g != official) {
                        flags.push(ReviewFlag::new(
                            Some(id),
                            FlagKind::AnswerKeyOverride,
                            format!("adapter chose {guess}, answer key says {official}"),
                        ));
                    }
                    return Ok(official);
                }
                Some(official) => {
                    return Err(invalid(format!(
                        "answer key option {official} is not among the options"
                    )));
                }
                None => flags.push(ReviewFlag::new(
                    Some(id),
                    FlagKind::AnswerKeyMissing,
                    "answer key has no entry for this question",
                )),
            }
        }

        match suggested {
            Some(k) if in_options(k) => Ok(k),
            Some(k) => Err(invalid(format!("correct option {k} is not among the options"))),
            None => Err(invalid("no correct option".into())),
        }
    }
}

/// Re-run validation on an emitted record.
///
/// A record produced by [`Validator::validate`] comes back unchanged.
pub fn revalidate(
    record: &StructuredQuestion,
    option_keys: &[char],
) -> Result<StructuredQuestion, QuestionError> {
    let id = extract_question_number(&record.question).ok_or_else(|| QuestionError::Invalid {
        question: 0,
        reason: format!("label '{}' has no question number", record.question),
    })?;
    let fields = StructuredFields {
        question: record.question.clone(),
        image: record.image,
        images: record.images.clone(),
        passage_text: record.passage_text.clone(),
        sources: record.sources.clone(),
        statement: record.statement.clone(),
        options: record.options.clone(),
        correct_option: record.correct_option.clone(),
    };
    let mut flags = Vec::new();
    Validator::new(option_keys, None).check(id, &fields, &[], "", record.images.clone(), &mut flags)
}

fn strip_key_prefix(key: char, text: &str) -> String {
    let text = text.trim();
    match RE_OPTION_PREFIX.captures(text) {
        Some(caps) if caps[1].eq_ignore_ascii_case(&key.to_string()) => {
            text[caps[0].len()..].trim().to_string()
        }
        _ => text.to_string(),
    }
}

fn clean_sources(sources: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    sources
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && seen.insert(s.to_string()))
        .take(MAX_SOURCES)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::segment::PageRange;

    const KEYS: [char; 5] = ['A', 'B', 'C', 'D', 'E'];

    fn block(id: u32) -> QuestionBlock {
        QuestionBlock {
            id,
            label: format!("Questão {id}"),
            raw_text: "Enunciado\nA) um\nB) dois\nC) três".into(),
            statement: "Enunciado".into(),
            options: ['A', 'B', 'C']
                .iter()
                .zip(["um", "dois", "três"])
                .map(|(k, t)| RawOption {
                    key: *k,
                    text: t.into(),
                })
                .collect(),
            pages: PageRange { start: 0, end: 0 },
            marker_y: None,
            low_confidence: false,
        }
    }

    fn fields(correct: &str) -> StructuredFields {
        StructuredFields {
            question: "Questão 1".into(),
            statement: "Qual a resposta?".into(),
            options: [("a)", "A) um"), ("b)", "dois"), ("c)", "três")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            correct_option: correct.into(),
            sources: vec![" livro ".into(), "livro".into(), "".into()],
            ..StructuredFields::default()
        }
    }

    #[test]
    fn labels_and_keys_are_canonicalised() {
        let v = Validator::new(&KEYS, None).validate(&block(1), &fields("b"), vec![]);
        let q = v.outcome.unwrap();
        assert_eq!(q.question, "QUESTÃO 01");
        assert_eq!(q.options.keys().collect::<Vec<_>>(), vec!["A", "B", "C"]);
        assert_eq!(q.options["A"], "um");
        assert_eq!(q.correct_option, "B");
        assert_eq!(q.sources, vec!["livro"]);
        assert!(v.flags.is_empty());
    }

    #[test]
    fn answer_key_overrides_adapter() {
        let key: AnswerKey = [(1, 'C')].into_iter().collect();
        let v = Validator::new(&KEYS, Some(&key)).validate(&block(1), &fields("A"), vec![]);
        assert_eq!(v.outcome.unwrap().correct_option, "C");
        assert_eq!(v.flags[0].kind, FlagKind::AnswerKeyOverride);
    }

    #[test]
    fn answer_key_outside_options_rejects() {
        let key: AnswerKey = [(1, 'E')].into_iter().collect();
        let v = Validator::new(&KEYS, Some(&key)).validate(&block(1), &fields("A"), vec![]);
        assert!(matches!(v.outcome, Err(QuestionError::Invalid { .. })));
    }

    #[test]
    fn missing_answer_key_entry_falls_back_and_flags() {
        let key: AnswerKey = [(9, 'A')].into_iter().collect();
        let v = Validator::new(&KEYS, Some(&key)).validate(&block(1), &fields("C"), vec![]);
        assert_eq!(v.outcome.unwrap().correct_option, "C");
        assert_eq!(v.flags[0].kind, FlagKind::AnswerKeyMissing);
    }

    #[test]
    fn correct_option_must_be_an_option() {
        let v = Validator::new(&KEYS, None).validate(&block(1), &fields("D"), vec![]);
        assert!(v.outcome.is_err());
        let v = Validator::new(&KEYS, None).validate(&block(1), &fields(""), vec![]);
        assert!(v.outcome.is_err());
    }

    #[test]
    fn empty_adapter_options_are_backfilled() {
        let mut f = fields("A");
        f.options.clear();
        let v = Validator::new(&KEYS, None).validate(&block(1), &f, vec![]);
        let q = v.outcome.unwrap();
        assert_eq!(q.options["C"], "três");
        assert_eq!(v.flags[0].kind, FlagKind::OptionsBackfilled);
    }

    #[test]
    fn gaps_and_duplicates_in_keys_reject() {
        let mut f = fields("A");
        f.options.remove("b)");
        assert!(Validator::new(&KEYS, None).validate(&block(1), &f, vec![]).outcome.is_err());

        let mut f = fields("A");
        f.options.insert("A".into(), "de novo".into());
        assert!(Validator::new(&KEYS, None).validate(&block(1), &f, vec![]).outcome.is_err());
    }

    #[test]
    fn image_fields_follow_association() {
        let mut f = fields("A");
        f.image = false;
        let v = Validator::new(&KEYS, None).validate(&block(1), &f, vec!["q01_p001_img01.jpeg".into()]);
        let q = v.outcome.unwrap();
        assert!(q.image);
        assert_eq!(q.images.len(), 1);
        assert_eq!(v.flags[0].kind, FlagKind::ImageClaimMismatch);
    }

    #[test]
    fn empty_statement_uses_block_text() {
        let mut f = fields("A");
        f.statement = "  ".into();
        let q = Validator::new(&KEYS, None)
            .validate(&block(1), &f, vec![])
            .outcome
            .unwrap();
        assert_eq!(q.statement, "Enunciado");
    }

    #[test]
    fn sources_are_capped() {
        let many: Vec<String> = (0..8).map(|i| format!("fonte {i}")).collect();
        assert_eq!(clean_sources(&many).len(), MAX_SOURCES);
    }

    #[test]
    fn question_numbers_from_label_variants() {
        for (label, n) in [("QUESTÃO 07", 7), ("Questão nº 7", 7), ("Q. 5", 5), ("question 10", 10), ("3", 3)] {
            assert_eq!(extract_question_number(label), Some(n), "{label}");
        }
        assert_eq!(extract_question_number("sem número"), None);
    }

    #[test]
    fn revalidate_is_idempotent() {
        let q = Validator::new(&KEYS, None)
            .validate(&block(4), &fields("C"), vec!["q04_p001_img01.jpeg".into()])
            .outcome
            .unwrap();
        assert_eq!(revalidate(&q, &KEYS).unwrap(), q);
    }
}
