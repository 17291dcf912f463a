//! Question segmentation: normalised exam text → ordered question blocks.
//!
//! A block starts at a question marker (`QUESTÃO 07`) and runs until the
//! next accepted marker, or the end of the document for the last one. The
//! marker itself is not part of the block text. A block's page range also
//! covers the text-less pages (full-page figures) up to the next block.
//!
//! Boundary rules:
//!
//! * Only a marker whose identifier is greater than the last accepted one
//!   opens a block. A repeated or decreasing number (OCR noise, or a
//!   "see question 3" reference) stays in the text and raises a
//!   [`FlagKind::NonMonotonicIdentifier`] flag.
//! * A marker that jumps ahead is skipped when a later line still opens
//!   with a number in between: `ver QUESTÃO 80` inside question 3 must not
//!   swallow questions 4 to 79.
//! * Inside a line, only the next number in sequence is a boundary; text
//!   glued across a line break (`fim da um QUESTÃO 2 ...`) still splits.
//! * With several markers on one line, the first valid one is the boundary;
//!   the rest of the line becomes the new block's text and the block is
//!   marked low confidence.
//! * A marker followed directly by the next one yields an empty block that
//!   is kept and flagged, never merged or dropped.

use crate::error::Exam2JsonError;
use crate::output::{FlagKind, ReviewFlag};
use crate::pipeline::extract::RawPage;
use crate::pipeline::input::DocumentKind;
use crate::pipeline::normalize::NormalizedText;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

/// Inclusive range of 0-indexed pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn contains(&self, page: usize) -> bool {
        self.start <= page && page <= self.end
    }
}

/// An option line as printed in the booklet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawOption {
    pub key: char,
    pub text: String,
}

/// One question's slice of the exam text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionBlock {
    /// Identifier from the marker.
    pub id: u32,
    /// The marker exactly as printed, e.g. `QUESTÃO 07`.
    pub label: String,
    /// Text between this marker and the next, `\n`-separated.
    pub raw_text: String,
    /// Lines before the first option.
    pub statement: String,
    /// Options in key order; empty if none were recognised.
    pub options: Vec<RawOption>,
    pub pages: PageRange,
    /// Top of the marker on its first page (top-down points), if located.
    pub marker_y: Option<f32>,
    pub low_confidence: bool,
}

impl QuestionBlock {
    pub fn is_empty(&self) -> bool {
        self.raw_text.trim().is_empty()
    }

    /// Marker plus body, the text handed to the Structuring Adapter.
    pub fn adapter_text(&self) -> String {
        if self.raw_text.is_empty() {
            self.label.clone()
        } else {
            format!("{}\n{}", self.label, self.raw_text)
        }
    }
}

/// Blocks plus the review flags raised while cutting them.
#[derive(Debug, Clone, Default)]
pub struct Segmentation {
    pub blocks: Vec<QuestionBlock>,
    pub flags: Vec<ReviewFlag>,
}

/// `A) text`, `(b) text`, `C. text`, `D - text`, `E: text`.
static RE_OPTION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?([A-Za-z])\s*[).:\-–]\s*(.*)$").unwrap());

/// Characters that glue a marker to its text: `QUESTÃO 01 - Texto`.
const MARKER_TRAILER: &[char] = &['.', ':', ')', '-', '–', '—', ' '];

pub struct Segmenter {
    marker: Regex,
    option_keys: Vec<char>,
}

struct OpenBlock {
    id: u32,
    label: String,
    start_page: usize,
    lines: Vec<(usize, String)>,
    low_confidence: bool,
}

impl Segmenter {
    /// `marker_pattern` must capture the numeric identifier in group 1.
    pub fn new(marker_pattern: &str, option_keys: &[char]) -> Result<Self, Exam2JsonError> {
        let marker = Regex::new(marker_pattern)
            .map_err(|e| Exam2JsonError::InvalidConfig(format!("Invalid marker pattern: {e}")))?;
        Ok(Self {
            marker,
            option_keys: option_keys.to_vec(),
        })
    }

    /// Cut `text` into question blocks.
    ///
    /// Fails with [`Exam2JsonError::NoMarkersFound`] when no marker opens a
    /// block; every other irregularity becomes a review flag.
    pub fn segment(
        &self,
        text: &NormalizedText,
        kind: DocumentKind,
    ) -> Result<Segmentation, Exam2JsonError> {
        let mut blocks: Vec<QuestionBlock> = Vec::new();
        let mut flags: Vec<ReviewFlag> = Vec::new();
        let mut open: Option<OpenBlock> = None;
        let mut last_id: Option<u32> = None;
        let line_starts = self.line_start_markers(text);

        for (index, line) in text.lines.iter().enumerate() {
            let later = line_starts
                .iter()
                .filter(|(i, _)| *i > index)
                .map(|&(_, id)| id);
            let boundary = self.find_boundary(&line.text, last_id, later);

            let Some((start, end, id)) = boundary else {
                self.flag_stale_markers(&line.text, last_id, open.as_ref(), &mut flags);
                if let Some(block) = open.as_mut() {
                    block.lines.push((line.page, line.text.clone()));
                }
                continue;
            };

            let before = line.text[..start].trim();
            if !before.is_empty() {
                self.flag_stale_markers(before, last_id, open.as_ref(), &mut flags);
                if let Some(block) = open.as_mut() {
                    block.lines.push((line.page, before.to_string()));
                }
            }

            if let Some(done) = open.take() {
                blocks.push(self.close(done, &mut flags));
            }

            let rest = line.text[end..].trim_start_matches(MARKER_TRAILER);
            let low_confidence = self.marker.is_match(rest);
            if low_confidence {
                warn!("QUESTÃO {id:02}: several markers on one line, boundary is a best guess");
                flags.push(ReviewFlag::new(
                    Some(id),
                    FlagKind::LowConfidenceBoundary,
                    format!("multiple markers on one line: '{}'", line.text),
                ));
            }

            let mut lines = Vec::new();
            if !rest.is_empty() {
                lines.push((line.page, rest.to_string()));
            }
            open = Some(OpenBlock {
                id,
                label: line.text[start..end].trim().to_string(),
                start_page: line.page,
                lines,
                low_confidence,
            });
            last_id = Some(id);
        }

        if let Some(done) = open.take() {
            blocks.push(self.close(done, &mut flags));
        }

        if blocks.is_empty() {
            return Err(Exam2JsonError::NoMarkersFound {
                kind,
                lines: text.lines.len(),
            });
        }
        extend_page_ranges(&mut blocks, text.last_page);

        info!("Segmented {} question blocks", blocks.len());
        Ok(Segmentation { blocks, flags })
    }

    /// `(line index, id)` of every marker that opens its line.
    fn line_start_markers(&self, text: &NormalizedText) -> Vec<(usize, u32)> {
        text.lines
            .iter()
            .enumerate()
            .filter_map(|(i, line)| {
                let caps = self.marker.captures(&line.text)?;
                if caps.get(0)?.start() != 0 {
                    return None;
                }
                Some((i, caps.get(1)?.as_str().parse().ok()?))
            })
            .collect()
    }

    /// First marker on the line that is accepted as a boundary.
    ///
    /// `later` holds the identifiers of markers opening later lines.
    fn find_boundary(
        &self,
        line: &str,
        last_id: Option<u32>,
        later: impl Iterator<Item = u32> + Clone,
    ) -> Option<(usize, usize, u32)> {
        self.marker.captures_iter(line).find_map(|caps| {
            let whole = caps.get(0)?;
            let id: u32 = caps.get(1)?.as_str().parse().ok()?;
            let at_start = whole.start() == 0;
            let accepted = match last_id {
                None if at_start => !later.clone().any(|l| l < id),
                None => !later.clone().any(|l| l <= id),
                Some(last) if id <= last => false,
                Some(last) if at_start => !later.clone().any(|l| l > last && l < id),
                Some(last) => id == last + 1 && !later.clone().any(|l| l > last && l <= id),
            };
            accepted.then_some((whole.start(), whole.end(), id))
        })
    }

    fn flag_stale_markers(
        &self,
        text: &str,
        last_id: Option<u32>,
        open: Option<&OpenBlock>,
        flags: &mut Vec<ReviewFlag>,
    ) {
        let Some(last) = last_id else { return };
        for caps in self.marker.captures_iter(text) {
            let Some(id) = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) else {
                continue;
            };
            let why = if id <= last { "does not advance past" } else { "is out of sequence after" };
            warn!("Marker '{}' {why} {last}; kept as text", &caps[0]);
            flags.push(ReviewFlag::new(
                open.map(|b| b.id),
                FlagKind::NonMonotonicIdentifier,
                format!("marker '{}' after QUESTÃO {last:02} was not used as a boundary", &caps[0]),
            ));
        }
    }

    fn close(&self, block: OpenBlock, flags: &mut Vec<ReviewFlag>) -> QuestionBlock {
        let lines = trim_blank_edges(&block.lines);
        let end_page = lines
            .last()
            .map(|(p, _)| *p)
            .unwrap_or(block.start_page)
            .max(block.start_page);

        let raw_text = lines
            .iter()
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if raw_text.trim().is_empty() {
            flags.push(ReviewFlag::new(
                Some(block.id),
                FlagKind::EmptyBlock,
                "marker is immediately followed by the next marker",
            ));
        }

        let (statement, options) = self.split_options(lines);
        debug!(
            "QUESTÃO {:02}: pages {}-{}, {} options",
            block.id,
            block.start_page + 1,
            end_page + 1,
            options.len()
        );

        QuestionBlock {
            id: block.id,
            label: block.label,
            raw_text,
            statement,
            options,
            pages: PageRange {
                start: block.start_page,
                end: end_page,
            },
            marker_y: None,
            low_confidence: block.low_confidence,
        }
    }

    /// Split body lines into statement and option lines.
    ///
    /// Options must appear in key order starting at the first allowed key, so
    /// a statement line such as "B. Lopes (2010)" is never mistaken for one.
    fn split_options(&self, lines: &[(usize, String)]) -> (String, Vec<RawOption>) {
        let mut statement: Vec<&str> = Vec::new();
        let mut options: Vec<RawOption> = Vec::new();

        for (_, line) in lines {
            let expected = self.option_keys.get(options.len()).copied();
            let option = RE_OPTION_LINE.captures(line).and_then(|caps| {
                let key = caps[1].chars().next()?.to_ascii_uppercase();
                (Some(key) == expected).then(|| RawOption {
                    key,
                    text: caps[2].trim().to_string(),
                })
            });

            if let Some(opt) = option {
                options.push(opt);
            } else if let Some(last) = options.last_mut() {
                if !line.is_empty() {
                    if !last.text.is_empty() {
                        last.text.push(' ');
                    }
                    last.text.push_str(line);
                }
            } else {
                statement.push(line);
            }
        }

        (statement.join("\n").trim().to_string(), options)
    }

    /// Locate each block's marker among the positioned text of its first page.
    ///
    /// Blocks whose marker cannot be found keep `marker_y = None`.
    pub fn anchor_markers(&self, blocks: &mut [QuestionBlock], pages: &[RawPage]) {
        for block in blocks.iter_mut() {
            let Some(page) = pages.iter().find(|p| p.index == block.pages.start) else {
                continue;
            };
            block.marker_y = self.find_marker_span(page, block.id);
            if block.marker_y.is_none() && !page.spans.is_empty() {
                debug!("QUESTÃO {:02}: marker position not found", block.id);
            }
        }
    }

    fn find_marker_span(&self, page: &RawPage, id: u32) -> Option<f32> {
        let matches_id = |text: &str| {
            let text: String = text.nfc().collect();
            self.marker
                .captures_iter(&text)
                .any(|c| c.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) == Some(id))
        };
        if let Some(span) = page.spans.iter().find(|s| matches_id(&s.text)) {
            return Some(span.top);
        }
        // pdfium may split "QUESTÃO" and "07" into separate segments.
        page.spans.windows(2).find_map(|pair| {
            let joined = format!("{} {}", pair[0].text.trim(), pair[1].text.trim());
            matches_id(&joined).then_some(pair[0].top.min(pair[1].top))
        })
    }
}

/// Stretch each block over the pages up to the next block's first page,
/// and the last block to the end of the document.
fn extend_page_ranges(blocks: &mut [QuestionBlock], last_page: Option<usize>) {
    let next_starts: Vec<Option<usize>> = blocks
        .iter()
        .skip(1)
        .map(|b| Some(b.pages.start))
        .chain(std::iter::once(None))
        .collect();
    for (block, next_start) in blocks.iter_mut().zip(next_starts) {
        let limit = match next_start {
            Some(start) => start.checked_sub(1),
            None => last_page,
        };
        if let Some(limit) = limit {
            block.pages.end = block.pages.end.max(limit);
        }
    }
}

fn trim_blank_edges(lines: &[(usize, String)]) -> &[(usize, String)] {
    let start = lines.iter().position(|(_, t)| !t.is_empty()).unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|(_, t)| !t.is_empty())
        .map_or(start, |i| i + 1);
    &lines[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MARKER_PATTERN;
    use crate::pipeline::extract::TextSpan;
    use crate::pipeline::normalize::normalize_pages;

    const KEYS: [char; 5] = ['A', 'B', 'C', 'D', 'E'];

    fn segmenter() -> Segmenter {
        Segmenter::new(DEFAULT_MARKER_PATTERN, &KEYS).unwrap()
    }

    fn run(pages: &[&str]) -> Segmentation {
        let raw: Vec<RawPage> = pages
            .iter()
            .enumerate()
            .map(|(i, t)| RawPage::from_text(i, *t))
            .collect();
        let text = normalize_pages(&raw, DocumentKind::Exam).unwrap();
        segmenter().segment(&text, DocumentKind::Exam).unwrap()
    }

    #[test]
    fn splits_on_markers_and_parses_options() {
        let s = run(&["Caderno azul\nQUESTÃO 01\nQuanto é 2+2?\nA) 3\nB) 4\nC) 5\nQUESTÃO 02\nQual a cor do céu?\n(A) azul\n(B) verde"]);
        assert_eq!(s.blocks.len(), 2);
        let q1 = &s.blocks[0];
        assert_eq!(q1.id, 1);
        assert_eq!(q1.label, "QUESTÃO 01");
        assert_eq!(q1.statement, "Quanto é 2+2?");
        let keys: Vec<char> = q1.options.iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!['A', 'B', 'C']);
        assert_eq!(q1.options[1].text, "4");
        assert!(!q1.raw_text.contains("QUESTÃO"));
        assert_eq!(s.blocks[1].options[0].text, "azul");
        assert!(s.flags.is_empty());
    }

    #[test]
    fn n_markers_give_n_increasing_blocks() {
        let body: String = (1..=12)
            .map(|i| format!("QUESTÃO {i:02}\nTexto {i}\n"))
            .collect();
        let s = run(&[&body]);
        let ids: Vec<u32> = s.blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn last_block_runs_to_end_of_document() {
        let s = run(&["QUESTÃO 1\nprimeira", "QUESTÃO 2\nsegunda", "continua aqui"]);
        assert_eq!(s.blocks[1].pages, PageRange { start: 1, end: 2 });
        assert!(s.blocks[1].raw_text.ends_with("continua aqui"));
        assert_eq!(s.blocks[0].pages, PageRange { start: 0, end: 0 });
    }

    #[test]
    fn two_markers_on_one_line_prefer_first() {
        let s = run(&["QUESTÃO 01 QUESTÃO 02 Texto colado\nA) x\nB) y"]);
        assert_eq!(s.blocks.len(), 1);
        let b = &s.blocks[0];
        assert_eq!(b.id, 1);
        assert!(b.low_confidence);
        assert!(b.raw_text.starts_with("QUESTÃO 02 Texto colado"));
        assert!(s.flags.iter().any(|f| f.kind == FlagKind::LowConfidenceBoundary));
    }

    #[test]
    fn non_monotonic_marker_is_flagged_not_split() {
        let s = run(&["QUESTÃO 01\num\nQUESTÃO 02\ndois\nQUESTÃO 02\nrepetido\nQUESTÃO 03\ntrês"]);
        let ids: Vec<u32> = s.blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(s.blocks[1].raw_text.contains("repetido"));
        let flag = s
            .flags
            .iter()
            .find(|f| f.kind == FlagKind::NonMonotonicIdentifier)
            .unwrap();
        assert_eq!(flag.question, Some(2));
    }

    #[test]
    fn text_less_pages_belong_to_the_surrounding_block() {
        let s = run(&["QUESTÃO 01\num", "", "QUESTÃO 02\ndois", ""]);
        assert_eq!(s.blocks[0].pages, PageRange { start: 0, end: 1 });
        assert_eq!(s.blocks[1].pages, PageRange { start: 2, end: 3 });
    }

    #[test]
    fn shared_page_stays_in_both_ranges() {
        let s = run(&["QUESTÃO 01\num", "continua\nQUESTÃO 02\ndois"]);
        assert_eq!(s.blocks[0].pages, PageRange { start: 0, end: 1 });
        assert_eq!(s.blocks[1].pages, PageRange { start: 1, end: 1 });
    }

    #[test]
    fn forward_reference_inside_a_line_is_not_a_boundary() {
        let body: String = (1..=8)
            .map(|i| {
                let extra = if i == 3 { " ver QUESTÃO 80" } else { "" };
                format!("QUESTÃO {i:02}\nTexto {i}{extra}\n")
            })
            .collect();
        let s = run(&[&body]);
        let ids: Vec<u32> = s.blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, (1..=8).collect::<Vec<_>>());
        assert!(s.blocks[2].raw_text.contains("ver QUESTÃO 80"));
        let flag = s
            .flags
            .iter()
            .find(|f| f.kind == FlagKind::NonMonotonicIdentifier)
            .unwrap();
        assert_eq!(flag.question, Some(3));
    }

    #[test]
    fn jump_at_line_start_is_skipped_when_sequence_resumes() {
        let s = run(&["QUESTÃO 01\num\nQUESTÃO 02\ndois\nQUESTÃO 80\nruído\nQUESTÃO 03\ntrês"]);
        let ids: Vec<u32> = s.blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(s.blocks[1].raw_text.contains("QUESTÃO 80"));
    }

    #[test]
    fn gap_in_numbering_is_still_a_boundary() {
        let s = run(&["QUESTÃO 01\num\nQUESTÃO 05\ncinco"]);
        let ids: Vec<u32> = s.blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 5]);
    }

    #[test]
    fn decomposed_marker_is_recognised() {
        let s = run(&["QUESTA\u{0303}O 01\nTexto\nA) x\nB) y"]);
        assert_eq!(s.blocks.len(), 1);
        assert_eq!(s.blocks[0].label, "QUESTÃO 01");
        assert_eq!(s.blocks[0].options.len(), 2);
    }

    #[test]
    fn text_before_marker_on_same_line_goes_to_previous_block() {
        let s = run(&["QUESTÃO 1\nfim da um QUESTÃO 2 começo da dois"]);
        assert!(s.blocks[0].raw_text.ends_with("fim da um"));
        assert_eq!(s.blocks[1].raw_text, "começo da dois");
    }

    #[test]
    fn empty_block_is_kept_and_flagged() {
        let s = run(&["QUESTÃO 01\nQUESTÃO 02\ntexto"]);
        assert_eq!(s.blocks.len(), 2);
        assert!(s.blocks[0].is_empty());
        assert!(s
            .flags
            .iter()
            .any(|f| f.kind == FlagKind::EmptyBlock && f.question == Some(1)));
    }

    #[test]
    fn out_of_order_option_letters_stay_in_statement() {
        let s = run(&["QUESTÃO 01\nB. Lopes afirma que\nA) sim\nB) não"]);
        let b = &s.blocks[0];
        assert_eq!(b.statement, "B. Lopes afirma que");
        assert_eq!(b.options.len(), 2);
    }

    #[test]
    fn option_continuation_lines_are_joined() {
        let s = run(&["QUESTÃO 01\nEnunciado\nA) começo\nda opção\nB) outra"]);
        assert_eq!(s.blocks[0].options[0].text, "começo da opção");
    }

    #[test]
    fn no_markers_is_fatal() {
        let raw = vec![RawPage::from_text(0, "Sem marcadores aqui")];
        let text = normalize_pages(&raw, DocumentKind::Exam).unwrap();
        let err = segmenter().segment(&text, DocumentKind::Exam).unwrap_err();
        assert!(matches!(err, Exam2JsonError::NoMarkersFound { lines: 1, .. }));
    }

    #[test]
    fn anchors_marker_from_split_spans() {
        let mut page = RawPage::from_text(0, "QUESTÃO 01\ntexto\nQUESTÃO 02\nmais");
        page.spans = vec![
            TextSpan { text: "QUESTÃO".into(), top: 80.0 },
            TextSpan { text: "01".into(), top: 81.0 },
            TextSpan { text: "QUESTÃO 02".into(), top: 400.0 },
        ];
        let text = normalize_pages(std::slice::from_ref(&page), DocumentKind::Exam).unwrap();
        let seg = segmenter();
        let mut s = seg.segment(&text, DocumentKind::Exam).unwrap();
        seg.anchor_markers(&mut s.blocks, &[page]);
        assert_eq!(s.blocks[0].marker_y, Some(80.0));
        assert_eq!(s.blocks[1].marker_y, Some(400.0));
    }
}
