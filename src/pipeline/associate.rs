//! Image → question association.
//!
//! A pure function of block page ranges, marker positions and image
//! positions, so the result never depends on extraction order. Each image
//! goes to at most one block.
//!
//! On a page where a block starts, the image belongs to the last block
//! whose marker sits above the image's top edge; an image above every marker
//! on the page belongs to the block continuing from an earlier page, or to
//! nobody when no block continues (a cover banner above `QUESTÃO 01`).
//! Without position data the earliest block wins, and the choice is flagged
//! when several blocks share the page.

use crate::output::{FlagKind, ReviewFlag};
use crate::pipeline::images::CandidateImage;
use crate::pipeline::segment::QuestionBlock;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// An image bound to a question, with its stable output reference.
#[derive(Debug, Clone)]
pub struct AssignedImage {
    /// File name the image is persisted under, e.g. `q03_p002_img01.jpeg`.
    pub reference: String,
    pub image: CandidateImage,
}

/// Question identifier → images in page/position order.
#[derive(Debug, Clone, Default)]
pub struct ImageAssociation {
    pub assignments: BTreeMap<u32, Vec<AssignedImage>>,
    /// Images outside every block's page range (cover pages, appendices).
    pub unassigned: Vec<CandidateImage>,
    pub flags: Vec<ReviewFlag>,
}

impl ImageAssociation {
    pub fn references(&self, question: u32) -> Vec<String> {
        self.assignments
            .get(&question)
            .map(|imgs| imgs.iter().map(|a| a.reference.clone()).collect())
            .unwrap_or_default()
    }

    pub fn assigned_count(&self) -> usize {
        self.assignments.values().map(Vec::len).sum()
    }
}

/// Stable file name for an image: question, source page and position.
pub fn image_reference(question: u32, img: &CandidateImage) -> String {
    format!(
        "q{:02}_p{:03}_img{:02}.jpeg",
        question,
        img.page + 1,
        img.sequence + 1
    )
}

enum Choice {
    Sure(u32),
    Ambiguous(u32),
}

/// Bind every candidate image to at most one block.
pub fn associate(blocks: &[QuestionBlock], images: &[CandidateImage]) -> ImageAssociation {
    let mut ordered: Vec<&CandidateImage> = images.iter().collect();
    ordered.sort_by(|a, b| {
        (a.page, a.top().unwrap_or(f32::INFINITY), a.sequence)
            .partial_cmp(&(b.page, b.top().unwrap_or(f32::INFINITY), b.sequence))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = ImageAssociation::default();
    for img in ordered {
        let choice = match choose_block(blocks, img) {
            Some(c) => c,
            None => {
                debug!("Page {} image {}: outside every question", img.page + 1, img.sequence);
                out.flags.push(ReviewFlag::new(
                    None,
                    FlagKind::UnassignedImage,
                    format!("image {} on page {} is not part of any question", img.sequence + 1, img.page + 1),
                ));
                out.unassigned.push(img.clone());
                continue;
            }
        };

        let id = match choice {
            Choice::Sure(id) => id,
            Choice::Ambiguous(id) => {
                warn!(
                    "Page {} image {}: no position data on a shared page, assigned to QUESTÃO {:02}",
                    img.page + 1,
                    img.sequence + 1,
                    id
                );
                out.flags.push(ReviewFlag::new(
                    Some(id),
                    FlagKind::AmbiguousImage,
                    format!(
                        "image {} on shared page {} assigned without position data",
                        img.sequence + 1,
                        img.page + 1
                    ),
                ));
                id
            }
        };

        out.assignments.entry(id).or_default().push(AssignedImage {
            reference: image_reference(id, img),
            image: img.clone(),
        });
    }
    out
}

fn choose_block(blocks: &[QuestionBlock], img: &CandidateImage) -> Option<Choice> {
    let containing: Vec<&QuestionBlock> =
        blocks.iter().filter(|b| b.pages.contains(img.page)).collect();

    let first = containing.first()?;
    if containing.len() == 1 {
        let above_marker = first.pages.start == img.page
            && matches!((img.top(), first.marker_y), (Some(top), Some(y)) if top < y);
        return (!above_marker).then_some(Choice::Sure(first.id));
    }

    let starting_here: Vec<&QuestionBlock> = containing
        .iter()
        .copied()
        .filter(|b| b.pages.start == img.page)
        .collect();
    let continuing = containing.iter().find(|b| b.pages.start < img.page);

    let positions_known = img.top().is_some() && starting_here.iter().all(|b| b.marker_y.is_some());
    if !positions_known {
        return Some(Choice::Ambiguous(first.id));
    }

    let top = img.top()?;
    let above = starting_here
        .iter()
        .filter(|b| b.marker_y.is_some_and(|y| y <= top))
        .last();

    match (above, continuing) {
        (Some(b), _) => Some(Choice::Sure(b.id)),
        (None, Some(c)) => Some(Choice::Sure(c.id)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::BoundingBox;
    use crate::pipeline::images::ColorProfile;
    use crate::pipeline::segment::PageRange;
    use image::DynamicImage;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn block(id: u32, start: usize, end: usize, marker_y: Option<f32>) -> QuestionBlock {
        QuestionBlock {
            id,
            label: format!("QUESTÃO {id:02}"),
            raw_text: "texto".into(),
            statement: "texto".into(),
            options: vec![],
            pages: PageRange { start, end },
            marker_y,
            low_confidence: false,
        }
    }

    fn image(page: usize, sequence: usize, top: Option<f32>) -> CandidateImage {
        CandidateImage {
            page,
            sequence,
            bbox: top.map(|t| BoundingBox {
                x0: 50.0,
                y0: t,
                x1: 300.0,
                y1: t + 200.0,
            }),
            width: 400,
            height: 400,
            fingerprint: vec![page as u8, sequence as u8],
            color: ColorProfile {
                unique_colors: 500,
                luma_stddev: 40.0,
            },
            image: Arc::new(DynamicImage::new_rgb8(1, 1)),
        }
    }

    #[test]
    fn single_block_page_assigns_directly() {
        let blocks = vec![block(1, 0, 0, Some(50.0)), block(2, 1, 1, Some(50.0))];
        let a = associate(&blocks, &[image(0, 0, None), image(1, 0, None)]);
        assert_eq!(a.references(1), vec!["q01_p001_img01.jpeg"]);
        assert_eq!(a.references(2), vec!["q02_p002_img01.jpeg"]);
        assert!(a.flags.is_empty());
    }

    #[test]
    fn shared_page_uses_marker_position() {
        // Q1 starts on page 0 and ends on page 1; Q2 starts on page 1 at y=400.
        let blocks = vec![block(1, 0, 1, Some(60.0)), block(2, 1, 1, Some(400.0))];
        let a = associate(&blocks, &[image(1, 0, Some(100.0)), image(1, 1, Some(500.0))]);
        assert_eq!(a.references(1), vec!["q01_p002_img01.jpeg"]);
        assert_eq!(a.references(2), vec!["q02_p002_img02.jpeg"]);
        assert!(a.flags.is_empty());
    }

    #[test]
    fn two_blocks_starting_on_same_page() {
        let blocks = vec![block(3, 2, 2, Some(80.0)), block(4, 2, 2, Some(420.0))];
        let a = associate(&blocks, &[image(2, 0, Some(450.0)), image(2, 1, Some(100.0))]);
        assert_eq!(a.references(3), vec!["q03_p003_img02.jpeg"]);
        assert_eq!(a.references(4), vec!["q04_p003_img01.jpeg"]);
    }

    #[test]
    fn missing_position_falls_back_to_earlier_block_and_flags() {
        let blocks = vec![block(1, 0, 1, Some(60.0)), block(2, 1, 1, None)];
        let a = associate(&blocks, &[image(1, 0, Some(300.0))]);
        assert_eq!(a.references(1).len(), 1);
        assert!(a.references(2).is_empty());
        assert_eq!(a.flags[0].kind, FlagKind::AmbiguousImage);
        assert_eq!(a.flags[0].question, Some(1));
    }

    #[test]
    fn banner_above_first_marker_is_unassigned() {
        let blocks = vec![block(1, 0, 1, Some(300.0))];
        let a = associate(&blocks, &[image(0, 0, Some(20.0)), image(0, 1, Some(350.0))]);
        assert_eq!(a.references(1), vec!["q01_p001_img02.jpeg"]);
        assert_eq!(a.unassigned.len(), 1);
        assert_eq!(a.unassigned[0].sequence, 0);
        assert_eq!(a.flags.len(), 1);
        assert_eq!(a.flags[0].kind, FlagKind::UnassignedImage);
    }

    #[test]
    fn image_above_marker_on_a_continuation_page_stays_assigned() {
        let blocks = vec![block(1, 0, 1, Some(60.0))];
        let a = associate(&blocks, &[image(1, 0, Some(10.0))]);
        assert_eq!(a.references(1), vec!["q01_p002_img01.jpeg"]);
    }

    #[test]
    fn image_outside_all_blocks_is_unassigned() {
        let blocks = vec![block(1, 1, 2, Some(60.0))];
        let a = associate(&blocks, &[image(0, 0, Some(10.0))]);
        assert_eq!(a.unassigned.len(), 1);
        assert_eq!(a.assigned_count(), 0);
        assert_eq!(a.flags[0].kind, FlagKind::UnassignedImage);
    }

    #[test]
    fn association_is_injective_and_order_independent() {
        let blocks = vec![
            block(1, 0, 1, Some(60.0)),
            block(2, 1, 2, Some(300.0)),
            block(3, 2, 2, Some(500.0)),
        ];
        let mut imgs = vec![
            image(0, 0, Some(200.0)),
            image(1, 0, Some(100.0)),
            image(1, 1, Some(350.0)),
            image(2, 0, Some(50.0)),
            image(2, 1, None),
            image(2, 2, Some(600.0)),
        ];
        let a = associate(&blocks, &imgs);
        let all: Vec<String> = a.assignments.values().flatten().map(|x| x.reference.clone()).collect();
        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(all.len(), unique.len());
        assert_eq!(all.len() + a.unassigned.len(), imgs.len());

        imgs.reverse();
        let b = associate(&blocks, &imgs);
        for id in 1..=3 {
            assert_eq!(a.references(id), b.references(id));
        }
    }
}
