//! Text normalisation: raw per-page PDF text → one canonical line stream.
//!
//! Each rule is a small pure function applied in a fixed order, so a single
//! rule can be tested or reordered without side effects. Page provenance is
//! kept per line because the segmenter needs page ranges and the associator
//! needs them to match images.
//!
//! Rules (applied in order):
//! 1. Normalise line endings (CRLF / CR → LF)
//! 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
//! 3. NFC: recompose accents split by the text layer (`A` + U+0303 → `Ã`)
//! 4. Canonicalise look-alikes (NBSP → space, ligatures → letters, tabs).
//!    Not NFKC, which would also flatten `x²` to `x2`
//! 5. Collapse whitespace runs and trim each line
//! 6. Collapse a token repeated four or more times in a row (scan artefact)
//! 7. Join words hyphenated across a line or page break
//! 8. Collapse consecutive blank lines into one paragraph break
//!
//! Dehyphenation cannot tell a syllable break (`corre-` / `ta`) from a
//! compound split at the hyphen (`guarda-` / `chuva`). It joins without the
//! hyphen unless the fragment is one of a few prefixes that always take one
//! (`bem-`, `recém-`, `vice-`...), so an unlisted compound loses its hyphen.

use crate::error::Exam2JsonError;
use crate::pipeline::extract::RawPage;
use crate::pipeline::input::DocumentKind;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

/// One normalised line and the page it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedLine {
    /// 0-indexed source page.
    pub page: usize,
    /// Never has leading/trailing whitespace. Empty means paragraph break.
    pub text: String,
}

impl NormalizedLine {
    pub fn is_break(&self) -> bool {
        self.text.is_empty()
    }
}

/// Canonical text of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedText {
    pub lines: Vec<NormalizedLine>,
    /// Last extracted page, including pages without text.
    pub last_page: Option<usize>,
}

impl NormalizedText {
    /// Lines joined with `\n`.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(NormalizedLine::is_break)
    }
}

/// Normalise every page of one document.
///
/// Fails with [`Exam2JsonError::Normalization`] when the document yields no
/// visible character at all (typically an image-only scan).
pub fn normalize_pages(
    pages: &[RawPage],
    kind: DocumentKind,
) -> Result<NormalizedText, Exam2JsonError> {
    let empty_pages: Vec<usize> = pages
        .iter()
        .filter(|p| p.text.chars().all(char::is_whitespace))
        .map(|p| p.index + 1)
        .collect();

    let mut lines = Vec::new();
    for page in pages {
        let s = normalise_line_endings(&page.text);
        let s = remove_invisible_chars(&s);
        let s: String = s.nfc().collect();
        let s = canonicalise_glyphs(&s);
        for raw_line in s.lines() {
            let line = collapse_repeated_tokens(&collapse_whitespace(raw_line));
            lines.push(NormalizedLine {
                page: page.index,
                text: line,
            });
        }
    }

    let lines = collapse_blank_lines(dehyphenate(lines));
    let text = NormalizedText {
        lines,
        last_page: pages.iter().map(|p| p.index).max(),
    };

    if text.is_empty() {
        return Err(Exam2JsonError::Normalization {
            kind,
            pages: pages.len(),
            empty_pages,
        });
    }

    debug!(
        "Normalised {}: {} pages → {} lines",
        kind,
        pages.len(),
        text.lines.len()
    );
    Ok(text)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove invisible Unicode characters ─────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Canonicalise glyphs (rule 3 is NFC, applied inline) ──────────

fn canonicalise_glyphs(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\u{00A0}' | '\u{2007}' | '\u{202F}' | '\t' | '\u{000C}' => out.push(' '),
            '\u{FB00}' => out.push_str("ff"),
            '\u{FB01}' => out.push_str("fi"),
            '\u{FB02}' => out.push_str("fl"),
            '\u{FB03}' => out.push_str("ffi"),
            '\u{FB04}' => out.push_str("ffl"),
            '\u{2010}' | '\u{2011}' => out.push('-'),
            other => out.push(other),
        }
    }
    out
}

// ── Rule 5: Collapse whitespace ──────────────────────────────────────────

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn collapse_whitespace(line: &str) -> String {
    RE_WHITESPACE.replace_all(line.trim(), " ").to_string()
}

// ── Rule 6: Collapse repeated tokens ─────────────────────────────────────

const REPEAT_THRESHOLD: usize = 4;

fn collapse_repeated_tokens(line: &str) -> String {
    let tokens: Vec<&str> = line.split(' ').collect();
    let mut out: Vec<&str> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let mut j = i + 1;
        while j < tokens.len() && tokens[j] == tokens[i] {
            j += 1;
        }
        let run = j - i;
        if run >= REPEAT_THRESHOLD {
            out.push(tokens[i]);
        } else {
            out.extend_from_slice(&tokens[i..j]);
        }
        i = j;
    }
    out.join(" ")
}

// ── Rule 7: Dehyphenate ──────────────────────────────────────────────────

/// Portuguese prefixes that are always hyphenated before the next word.
const HYPHENATED_PREFIXES: &[&str] = &["bem", "além", "aquém", "recém", "vice", "grã", "grão"];

/// True when `line` ends in `letter-`.
fn ends_with_split_word(line: &str) -> bool {
    let mut rev = line.chars().rev();
    matches!((rev.next(), rev.next()), (Some('-'), Some(c)) if c.is_alphabetic())
}

fn starts_lowercase(line: &str) -> bool {
    line.chars().next().is_some_and(char::is_lowercase)
}

/// True when the fragment before the trailing `-` is a hyphenated prefix.
fn keeps_hyphen(line: &str) -> bool {
    let word = line[..line.len() - 1]
        .rsplit(' ')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    HYPHENATED_PREFIXES.contains(&word.as_str())
}

/// Join `exam-` + `ple ...` into `example ...`, or `bem-` + `vindo` into
/// `bem-vindo`.
///
/// A blank line on the same page is a real paragraph break and stops the
/// join. Blank lines that open the next page do not, so a word split over
/// two pages is joined too; the merged line keeps the earlier page.
fn dehyphenate(mut lines: Vec<NormalizedLine>) -> Vec<NormalizedLine> {
    let mut out: Vec<NormalizedLine> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let mut line = std::mem::take(&mut lines[i]);
        i += 1;
        while ends_with_split_word(&line.text) {
            let mut j = i;
            while j < lines.len() && lines[j].is_break() && lines[j].page != line.page {
                j += 1;
            }
            match lines.get(j) {
                Some(next) if !next.is_break() && starts_lowercase(&next.text) => {
                    if !keeps_hyphen(&line.text) {
                        line.text.pop();
                    }
                    line.text.push_str(&next.text);
                    i = j + 1;
                }
                _ => break,
            }
        }
        out.push(line);
    }
    out
}

// ── Rule 8: Collapse blank lines ─────────────────────────────────────────

fn collapse_blank_lines(lines: Vec<NormalizedLine>) -> Vec<NormalizedLine> {
    let mut out: Vec<NormalizedLine> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_break() && out.last().is_none_or(NormalizedLine::is_break) {
            continue;
        }
        out.push(line);
    }
    if out.last().is_some_and(NormalizedLine::is_break) {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(index: usize, text: &str) -> RawPage {
        RawPage::from_text(index, text)
    }

    fn texts(n: &NormalizedText) -> Vec<&str> {
        n.lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn whitespace_and_invisibles_are_cleaned() {
        let n = normalize_pages(
            &[page(0, "  QUESTÃO\u{00A0}\u{00A0}01 \r\n\tTexto\u{200B} da\u{FB01}gura  ")],
            DocumentKind::Exam,
        )
        .unwrap();
        assert_eq!(texts(&n), vec!["QUESTÃO 01", "Texto dafigura"]);
    }

    #[test]
    fn hyphenated_word_is_joined_within_page() {
        let n = normalize_pages(&[page(0, "a resposta corre-\nta é B")], DocumentKind::Exam).unwrap();
        assert_eq!(texts(&n), vec!["a resposta correta é B"]);
    }

    #[test]
    fn hyphen_before_uppercase_is_kept() {
        let n = normalize_pages(&[page(0, "Rio-\nGrande")], DocumentKind::Exam).unwrap();
        assert_eq!(texts(&n), vec!["Rio-", "Grande"]);
    }

    #[test]
    fn hyphenation_across_pages_keeps_earlier_page() {
        let n = normalize_pages(
            &[page(0, "a técnica de foto-\n"), page(1, "\ngrafia digital\n")],
            DocumentKind::Exam,
        )
        .unwrap();
        assert_eq!(texts(&n), vec!["a técnica de fotografia digital"]);
        assert_eq!(n.lines[0].page, 0);
    }

    #[test]
    fn paragraph_break_is_not_dehyphenated() {
        let n = normalize_pages(&[page(0, "traço-\n\nnovo parágrafo")], DocumentKind::Exam).unwrap();
        assert_eq!(texts(&n), vec!["traço-", "", "novo parágrafo"]);
    }

    #[test]
    fn decomposed_accents_are_recomposed() {
        let n = normalize_pages(
            &[page(0, "QUESTA\u{0303}O 01\nna\u{0303}o e\u{0301}")],
            DocumentKind::Exam,
        )
        .unwrap();
        assert_eq!(texts(&n), vec!["QUESTÃO 01", "não é"]);
        assert_eq!(n.lines[0].text, "QUEST\u{00C3}O 01");
    }

    #[test]
    fn superscripts_survive_normalisation() {
        let n = normalize_pages(&[page(0, "área de 4 m² e x½")], DocumentKind::Exam).unwrap();
        assert_eq!(texts(&n), vec!["área de 4 m² e x½"]);
    }

    #[test]
    fn hyphenated_prefix_keeps_its_hyphen() {
        let n = normalize_pages(&[page(0, "sejam bem-\nvindos e recém-\nchegados")], DocumentKind::Exam)
            .unwrap();
        assert_eq!(texts(&n), vec!["sejam bem-vindos e recém-chegados"]);
    }

    #[test]
    fn last_page_counts_pages_without_text() {
        let n = normalize_pages(&[page(0, "texto"), page(1, ""), page(2, " ")], DocumentKind::Exam)
            .unwrap();
        assert_eq!(n.last_page, Some(2));
        assert_eq!(n.lines.len(), 1);
    }

    #[test]
    fn blank_runs_collapse_to_one() {
        let n = normalize_pages(&[page(0, "\n\na\n\n\n\nb\n\n")], DocumentKind::Exam).unwrap();
        assert_eq!(texts(&n), vec!["a", "", "b"]);
    }

    #[test]
    fn repeated_tokens_collapse() {
        assert_eq!(collapse_repeated_tokens("RASCUNHO RASCUNHO RASCUNHO RASCUNHO fim"), "RASCUNHO fim");
        assert_eq!(collapse_repeated_tokens("muito muito muito"), "muito muito muito");
    }

    #[test]
    fn order_is_preserved_across_pages() {
        let n = normalize_pages(&[page(0, "um\ndois"), page(1, "três")], DocumentKind::Exam).unwrap();
        assert_eq!(texts(&n), vec!["um", "dois", "três"]);
        assert_eq!(n.lines[2].page, 1);
    }

    #[test]
    fn image_only_document_is_an_error() {
        let err = normalize_pages(&[page(0, ""), page(1, " \n\u{200B} ")], DocumentKind::Exam)
            .unwrap_err();
        match err {
            Exam2JsonError::Normalization { pages, empty_pages, .. } => {
                assert_eq!(pages, 2);
                assert_eq!(empty_pages, vec![1]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn no_pages_is_an_error() {
        assert!(normalize_pages(&[], DocumentKind::AnswerKey).is_err());
    }
}
