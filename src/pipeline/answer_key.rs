//! Answer-key parsing: normalised answer-key text → identifier → option key.
//!
//! Two layouts cover the answer keys seen in practice:
//!
//! * inline pairs, one or many per line: `01 A`, `1 - B`, `QUESTÃO 3: C`,
//!   `4) D`, `05. E`
//! * tables: a line of numbers directly followed by a line with the same
//!   count of letters
//!
//! Tables are read first and their lines are excluded from the inline scan.
//! The first answer seen for an identifier wins. Letters outside the allowed
//! option keys (`X` for an annulled question, `*`) are ignored. Answer
//! letters must be uppercase, otherwise "12 e 13" in a header would read as
//! an answer.
//!
//! Booklets without a separate key document often print it after the last
//! question under a `GABARITO` heading; [`split_embedded_key`] cuts it out
//! of the exam text.

use crate::pipeline::normalize::{NormalizedLine, NormalizedText};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

static RE_INLINE_PAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:(?i:\bquest(?:ã|a)o)\s*(?:(?i:n)\s*[º°o.]?\s*)?)?\b(\d{1,3})\s*[-–.:)=]?\s*\b([A-Z])\b")
        .unwrap()
});

/// `GABARITO`, `Gabarito oficial`, `--- Answer Key ---` opening a line.
static RE_KEY_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:gabarito\b|-{2,}\s*answer key\s*-{2,})").unwrap());

/// `A) texto`: an option line, which never appears inside a key.
static RE_OPTION_LIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\(?[A-Za-z]\)\s*\S").unwrap());

static RE_NUMBER_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:\d{1,3}\s*)+$").unwrap());

static RE_LETTER_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:[A-Z*]\s*)+$").unwrap());

/// Parsed answer key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerKey {
    answers: BTreeMap<u32, char>,
}

impl AnswerKey {
    pub fn get(&self, question: u32) -> Option<char> {
        self.answers.get(&question).copied()
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, char)> + '_ {
        self.answers.iter().map(|(k, v)| (*k, *v))
    }
}

impl FromIterator<(u32, char)> for AnswerKey {
    fn from_iter<I: IntoIterator<Item = (u32, char)>>(iter: I) -> Self {
        let mut key = AnswerKey::default();
        for (q, c) in iter {
            key.answers.entry(q).or_insert(c);
        }
        key
    }
}

/// Parse the answer key. Never fails; an unreadable document yields an
/// empty key, which the caller reports.
pub fn parse_answer_key(text: &NormalizedText, option_keys: &[char]) -> AnswerKey {
    let allowed = |c: char| {
        let up = c.to_ascii_uppercase();
        option_keys.contains(&up).then_some(up)
    };

    let lines: Vec<&str> = text.lines.iter().map(|l| l.text.as_str()).collect();
    let mut answers: BTreeMap<u32, char> = BTreeMap::new();
    let mut consumed = vec![false; lines.len()];

    // ── Tables ──
    for i in 0..lines.len().saturating_sub(1) {
        let (nums, letters) = (lines[i], lines[i + 1]);
        if consumed[i] || !RE_NUMBER_ROW.is_match(nums) || !RE_LETTER_ROW.is_match(letters) {
            continue;
        }
        let ids: Vec<u32> = nums.split_whitespace().filter_map(|n| n.parse().ok()).collect();
        let keys: Vec<char> = letters
            .split_whitespace()
            .flat_map(str::chars)
            .collect();
        if ids.len() != keys.len() {
            debug!("Answer-key table at line {} has mismatched columns", i + 1);
            continue;
        }
        for (id, key) in ids.into_iter().zip(keys) {
            if let Some(k) = allowed(key) {
                answers.entry(id).or_insert(k);
            }
        }
        consumed[i] = true;
        consumed[i + 1] = true;
    }

    // ── Inline pairs ──
    for (line, _) in lines.iter().zip(&consumed).filter(|(_, c)| !**c) {
        for caps in RE_INLINE_PAIR.captures_iter(line) {
            let Ok(id) = caps[1].parse::<u32>() else { continue };
            let Some(key) = caps[2].chars().next().and_then(allowed) else {
                continue;
            };
            answers.entry(id).or_insert(key);
        }
    }

    if answers.is_empty() {
        warn!("Answer key produced no entries");
    } else {
        info!("Answer key: {} entries", answers.len());
    }
    AnswerKey { answers }
}

/// Cut an answer key printed inside the exam out of `exam`.
///
/// The last line opening with a key heading starts the key. It is split off
/// only when exam text precedes it, no option line follows it and the rest
/// parses to at least one answer. `exam.last_page` is pulled back so the
/// key's pages do not stretch the last question's page range.
pub fn split_embedded_key(exam: &mut NormalizedText, option_keys: &[char]) -> Option<AnswerKey> {
    let heading = exam
        .lines
        .iter()
        .rposition(|l| RE_KEY_HEADING.is_match(&l.text))?;
    let tail = &exam.lines[heading..];
    if exam.lines[..heading].iter().all(NormalizedLine::is_break)
        || tail.iter().any(|l| RE_OPTION_LIKE.is_match(&l.text))
    {
        return None;
    }

    let key_text = NormalizedText {
        lines: tail.to_vec(),
        last_page: exam.last_page,
    };
    let key = parse_answer_key(&key_text, option_keys);
    if key.is_empty() {
        return None;
    }

    let page = exam.lines[heading].page;
    let opens_page = exam.lines[..heading]
        .iter()
        .rev()
        .find(|l| !l.is_break())
        .is_none_or(|l| l.page < page);
    exam.lines.truncate(heading);
    while exam.lines.last().is_some_and(NormalizedLine::is_break) {
        exam.lines.pop();
    }
    exam.last_page = Some(if opens_page { page.saturating_sub(1) } else { page });

    info!(
        "Answer key found in the exam at page {}: {} entries",
        page + 1,
        key.len()
    );
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::RawPage;
    use crate::pipeline::input::DocumentKind;
    use crate::pipeline::normalize::normalize_pages;

    const KEYS: [char; 5] = ['A', 'B', 'C', 'D', 'E'];

    fn parse(text: &str) -> AnswerKey {
        let n = normalize_pages(&[RawPage::from_text(0, text)], DocumentKind::AnswerKey).unwrap();
        parse_answer_key(&n, &KEYS)
    }

    #[test]
    fn inline_pairs_in_many_shapes() {
        let key = parse("GABARITO\n01 A\n2 - B\nQUESTÃO 3: C\n4) D\n05. E");
        let got: Vec<(u32, char)> = key.iter().collect();
        assert_eq!(got, vec![(1, 'A'), (2, 'B'), (3, 'C'), (4, 'D'), (5, 'E')]);
    }

    #[test]
    fn several_pairs_per_line() {
        let key = parse("1-A 2-C 3-E\n4-B   5-D");
        assert_eq!(key.len(), 5);
        assert_eq!(key.get(3), Some('E'));
    }

    #[test]
    fn table_layout() {
        let key = parse("Prova azul\n1 2 3 4 5\nC A * B E\n6 7\nD D");
        assert_eq!(key.get(1), Some('C'));
        assert_eq!(key.get(3), None);
        assert_eq!(key.get(5), Some('E'));
        assert_eq!(key.get(7), Some('D'));
    }

    #[test]
    fn first_occurrence_wins() {
        let key = parse("01 B\n01 C");
        assert_eq!(key.get(1), Some('B'));
    }

    #[test]
    fn letters_outside_allowed_keys_are_ignored() {
        let key = parse("01 X\n02 A");
        assert_eq!(key.get(1), None);
        assert_eq!(key.get(2), Some('A'));
    }

    #[test]
    fn lowercase_words_are_not_answers() {
        let key = parse("Aplicação: 12 e 13 de maio\n01 D");
        assert_eq!(key.len(), 1);
        assert_eq!(key.get(1), Some('D'));
    }

    #[test]
    fn prose_without_answers_is_empty() {
        assert!(parse("Gabarito oficial publicado em breve").is_empty());
    }

    fn exam(pages: &[&str]) -> NormalizedText {
        let raw: Vec<RawPage> = pages
            .iter()
            .enumerate()
            .map(|(i, t)| RawPage::from_text(i, *t))
            .collect();
        normalize_pages(&raw, DocumentKind::Exam).unwrap()
    }

    #[test]
    fn embedded_key_is_cut_from_the_exam() {
        let mut text = exam(&["QUESTÃO 01\nEnunciado\nA) x\nB) y", "GABARITO\n01 B\n02 A"]);
        let key = split_embedded_key(&mut text, &KEYS).unwrap();
        assert_eq!(key.get(1), Some('B'));
        assert_eq!(key.get(2), Some('A'));
        assert!(!text.text().contains("GABARITO"));
        assert_eq!(text.lines.last().unwrap().text, "B) y");
        assert_eq!(text.last_page, Some(0));
    }

    #[test]
    fn embedded_key_sharing_a_page_keeps_that_page() {
        let mut text = exam(&["QUESTÃO 01\nA) x\nB) y\n\nGabarito oficial\n1 2\nA B"]);
        let key = split_embedded_key(&mut text, &KEYS).unwrap();
        assert_eq!(key.len(), 2);
        assert_eq!(text.last_page, Some(0));
    }

    #[test]
    fn heading_followed_by_questions_is_not_a_key() {
        let original = exam(&["Gabarito no verso\nQUESTÃO 01\nA) x\nB) y\n02 A"]);
        let mut text = original.clone();
        assert!(split_embedded_key(&mut text, &KEYS).is_none());
        assert_eq!(text, original);
    }

    #[test]
    fn heading_without_answers_leaves_exam_untouched() {
        let original = exam(&["QUESTÃO 01\nA) x\nB) y", "GABARITO\nem breve"]);
        let mut text = original.clone();
        assert!(split_embedded_key(&mut text, &KEYS).is_none());
        assert_eq!(text, original);
    }
}
