//! Image relevance filtering.
//!
//! Every embedded raster is profiled once (dimensions, perceptual
//! fingerprint, colour profile) and then run through four hard gates:
//!
//! 1. Size: smaller than `min_width` × `min_height` is an icon or bullet.
//! 2. Aspect: slivers outside `[min_aspect_ratio, max_aspect_ratio]` are
//!    borders and rules.
//! 3. Colour: too few distinct colours or a flat luminance is a fill or
//!    scan noise.
//! 4. Repetition: a fingerprint seen more than `max_repetitions` times in
//!    the document is page furniture (logos, headers, watermarks).
//!
//! Fingerprints are `image_hasher` gradient hashes, so re-encoded or slightly
//! rescaled copies of the same logo still count as repeats. A same-page
//! duplicate additionally needs identical pixels.
//!
//! Gates are independent predicates over the image and a [`RepetitionIndex`]
//! built from the full input pool, so their order does not change the
//! outcome and re-filtering the output returns it unchanged.

use crate::config::ImageFilterConfig;
use crate::pipeline::extract::{BoundingBox, RawImage};
use image::{DynamicImage, GenericImageView};
use image_hasher::{HashAlg, HasherConfig};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Counting stops here; anything above is colourful enough.
const UNIQUE_COLOR_CAP: usize = 10_000;

/// Summary of an image's colour content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColorProfile {
    /// Distinct RGB values, capped at 10 000.
    pub unique_colors: usize,
    /// Standard deviation of 8-bit luminance.
    pub luma_stddev: f32,
}

impl ColorProfile {
    pub fn of(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let mut seen: HashSet<[u8; 3]> = HashSet::new();
        for p in rgb.pixels() {
            seen.insert(p.0);
            if seen.len() >= UNIQUE_COLOR_CAP {
                break;
            }
        }

        let luma = image.to_luma8();
        let n = luma.len().max(1) as f64;
        let mean = luma.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = luma.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;

        Self {
            unique_colors: seen.len(),
            luma_stddev: var.sqrt() as f32,
        }
    }
}

/// Perceptual fingerprint: 8×8 gradient hash, as raw bytes.
pub fn fingerprint(image: &DynamicImage) -> Vec<u8> {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(8, 8)
        .to_hasher();
    hasher.hash_image(image).as_bytes().to_vec()
}

/// Fingerprint plus dimensions.
pub type RepetitionKey = (Vec<u8>, u32, u32);

/// A profiled image with its position in the document.
#[derive(Debug, Clone)]
pub struct CandidateImage {
    /// 0-indexed source page.
    pub page: usize,
    /// Position among the images of the page.
    pub sequence: usize,
    pub bbox: Option<BoundingBox>,
    pub width: u32,
    pub height: u32,
    pub fingerprint: Vec<u8>,
    pub color: ColorProfile,
    pub image: Arc<DynamicImage>,
}

impl CandidateImage {
    pub fn from_raw(raw: &RawImage) -> Self {
        let (width, height) = raw.image.dimensions();
        Self {
            page: raw.page,
            sequence: raw.sequence,
            bbox: raw.bbox,
            width,
            height,
            fingerprint: fingerprint(&raw.image),
            color: ColorProfile::of(&raw.image),
            image: Arc::clone(&raw.image),
        }
    }

    /// Identity used for repetition counting.
    pub fn repetition_key(&self) -> RepetitionKey {
        (self.fingerprint.clone(), self.width, self.height)
    }

    /// Same raster, pixel for pixel.
    pub fn same_pixels(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.image, &other.image) || *self.image == *other.image
    }

    /// Top edge on the page, if known.
    pub fn top(&self) -> Option<f32> {
        self.bbox.map(|b| b.top())
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

impl PartialEq for CandidateImage {
    fn eq(&self, other: &Self) -> bool {
        self.page == other.page
            && self.sequence == other.sequence
            && self.repetition_key() == other.repetition_key()
    }
}

/// Why an image was dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum Rejection {
    TooSmall { width: u32, height: u32 },
    AspectRatio { ratio: f32 },
    LowColorVariance { unique_colors: usize, luma_stddev: f32 },
    Repeated { occurrences: usize },
    /// Pixel-identical copy of an earlier image on the same page.
    Duplicate,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooSmall { width, height } => write!(f, "too small ({width}x{height})"),
            Rejection::AspectRatio { ratio } => write!(f, "aspect ratio {ratio:.2} out of range"),
            Rejection::LowColorVariance {
                unique_colors,
                luma_stddev,
            } => write!(f, "near-uniform ({unique_colors} colours, σ={luma_stddev:.1})"),
            Rejection::Repeated { occurrences } => write!(f, "repeated {occurrences} times"),
            Rejection::Duplicate => f.write_str("duplicate on the same page"),
        }
    }
}

/// How often each fingerprint occurs across the document.
///
/// Built once from the whole pool and passed to the gates explicitly.
#[derive(Debug, Clone, Default)]
pub struct RepetitionIndex {
    counts: HashMap<RepetitionKey, usize>,
}

impl RepetitionIndex {
    pub fn build(pool: &[CandidateImage]) -> Self {
        let mut counts = HashMap::new();
        for img in pool {
            *counts.entry(img.repetition_key()).or_insert(0) += 1;
        }
        Self { counts }
    }

    pub fn occurrences(&self, img: &CandidateImage) -> usize {
        self.counts.get(&img.repetition_key()).copied().unwrap_or(0)
    }
}

/// Result of one filter pass.
#[derive(Debug, Clone, Default)]
pub struct FilterReport {
    /// Survivors, ordered by page then sequence.
    pub candidates: Vec<CandidateImage>,
    pub rejected: Vec<(CandidateImage, Rejection)>,
}

// ── Gates ────────────────────────────────────────────────────────────────

fn size_gate(img: &CandidateImage, cfg: &ImageFilterConfig) -> Option<Rejection> {
    (img.width < cfg.min_width || img.height < cfg.min_height).then_some(Rejection::TooSmall {
        width: img.width,
        height: img.height,
    })
}

fn aspect_gate(img: &CandidateImage, cfg: &ImageFilterConfig) -> Option<Rejection> {
    let ratio = img.aspect_ratio();
    (ratio < cfg.min_aspect_ratio || ratio > cfg.max_aspect_ratio)
        .then_some(Rejection::AspectRatio { ratio })
}

fn color_gate(img: &CandidateImage, cfg: &ImageFilterConfig) -> Option<Rejection> {
    let c = img.color;
    (c.unique_colors < cfg.min_unique_colors || c.luma_stddev < cfg.min_luma_stddev).then_some(
        Rejection::LowColorVariance {
            unique_colors: c.unique_colors,
            luma_stddev: c.luma_stddev,
        },
    )
}

fn repetition_gate(
    img: &CandidateImage,
    cfg: &ImageFilterConfig,
    index: &RepetitionIndex,
) -> Option<Rejection> {
    let occurrences = index.occurrences(img);
    (occurrences > cfg.max_repetitions).then_some(Rejection::Repeated { occurrences })
}

/// First gate that rejects `img`, if any.
pub fn check(
    img: &CandidateImage,
    cfg: &ImageFilterConfig,
    index: &RepetitionIndex,
) -> Option<Rejection> {
    size_gate(img, cfg)
        .or_else(|| aspect_gate(img, cfg))
        .or_else(|| color_gate(img, cfg))
        .or_else(|| repetition_gate(img, cfg, index))
}

/// Profile and filter the raw image pool of one document.
pub fn filter_images(pool: &[RawImage], cfg: &ImageFilterConfig) -> FilterReport {
    let candidates: Vec<CandidateImage> = pool.iter().map(CandidateImage::from_raw).collect();
    let report = apply_gates(candidates, cfg);
    info!(
        "Image filter: {} extracted, {} retained",
        pool.len(),
        report.candidates.len()
    );
    report
}

/// Run the gates over already profiled images.
pub fn apply_gates(mut pool: Vec<CandidateImage>, cfg: &ImageFilterConfig) -> FilterReport {
    pool.sort_by_key(|c| (c.page, c.sequence));
    let index = RepetitionIndex::build(&pool);

    let mut report = FilterReport::default();
    let mut kept_on_page: HashMap<(usize, RepetitionKey), Vec<usize>> = HashMap::new();

    for img in pool {
        let verdict = check(&img, cfg, &index).or_else(|| {
            let kept = kept_on_page.get(&(img.page, img.repetition_key()))?;
            kept.iter()
                .any(|&i| report.candidates[i].same_pixels(&img))
                .then_some(Rejection::Duplicate)
        });
        match verdict {
            Some(reason) => {
                debug!(
                    "Page {} image {}: dropped, {}",
                    img.page + 1,
                    img.sequence,
                    reason
                );
                report.rejected.push((img, reason));
            }
            None => {
                kept_on_page
                    .entry((img.page, img.repetition_key()))
                    .or_default()
                    .push(report.candidates.len());
                report.candidates.push(img);
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn textured(w: u32, h: u32, seed: u32) -> Arc<DynamicImage> {
        Arc::new(DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                ((x * 7 + y * 3 + seed) % 256) as u8,
                ((x * 2 + y * 5 + seed * 3) % 256) as u8,
                ((x ^ y).wrapping_add(seed) % 256) as u8,
            ])
        })))
    }

    fn flat(w: u32, h: u32) -> Arc<DynamicImage> {
        Arc::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 200, 200]))))
    }

    fn raw(page: usize, sequence: usize, image: Arc<DynamicImage>) -> RawImage {
        RawImage {
            page,
            sequence,
            bbox: None,
            image,
        }
    }

    fn reasons(report: &FilterReport) -> Vec<Rejection> {
        report.rejected.iter().map(|(_, r)| r.clone()).collect()
    }

    #[test]
    fn keeps_large_textured_image() {
        let report = filter_images(&[raw(0, 0, textured(400, 320, 1))], &ImageFilterConfig::default());
        assert_eq!(report.candidates.len(), 1);
        assert!(report.rejected.is_empty());
    }

    #[test]
    fn drops_small_sliver_and_flat_images() {
        let cfg = ImageFilterConfig::default();
        let report = filter_images(
            &[
                raw(0, 0, textured(64, 64, 2)),
                raw(0, 1, textured(1600, 310, 3)),
                raw(0, 2, flat(500, 500)),
            ],
            &cfg,
        );
        assert!(report.candidates.is_empty());
        let r = reasons(&report);
        assert!(matches!(r[0], Rejection::TooSmall { .. }));
        assert!(matches!(r[1], Rejection::AspectRatio { .. }));
        assert!(matches!(r[2], Rejection::LowColorVariance { .. }));
    }

    #[test]
    fn watermark_on_every_page_is_excluded() {
        let mark = textured(350, 350, 9);
        let report = filter_images(
            &[
                raw(0, 0, Arc::clone(&mark)),
                raw(0, 1, textured(400, 400, 4)),
                raw(1, 0, mark),
            ],
            &ImageFilterConfig::default(),
        );
        assert_eq!(report.candidates.len(), 1);
        assert_eq!((report.candidates[0].page, report.candidates[0].sequence), (0, 1));
        assert!(reasons(&report)
            .iter()
            .all(|r| matches!(r, Rejection::Repeated { occurrences: 2 })));
    }

    #[test]
    fn same_page_copy_is_deduplicated_when_repetition_allows_it() {
        let cfg = ImageFilterConfig {
            max_repetitions: 3,
            ..ImageFilterConfig::default()
        };
        let img = textured(400, 400, 5);
        let report = filter_images(&[raw(2, 0, Arc::clone(&img)), raw(2, 1, img)], &cfg);
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(reasons(&report), vec![Rejection::Duplicate]);
    }

    #[test]
    fn same_page_hash_collision_with_different_pixels_is_kept() {
        let cfg = ImageFilterConfig {
            max_repetitions: 3,
            ..ImageFilterConfig::default()
        };
        let first = CandidateImage::from_raw(&raw(2, 0, textured(400, 400, 5)));
        let mut second = CandidateImage::from_raw(&raw(2, 1, textured(400, 400, 6)));
        second.fingerprint = first.fingerprint.clone();
        let report = apply_gates(vec![first, second], &cfg);
        assert_eq!(report.candidates.len(), 2);
        assert!(report.rejected.is_empty());
    }

    #[test]
    fn filtering_is_idempotent() {
        let mark = textured(350, 350, 9);
        let pool = vec![
            raw(0, 0, Arc::clone(&mark)),
            raw(0, 1, textured(400, 400, 4)),
            raw(1, 0, mark),
            raw(1, 1, textured(20, 20, 1)),
            raw(1, 2, textured(500, 300, 6)),
        ];
        let cfg = ImageFilterConfig::default();
        let first = filter_images(&pool, &cfg);
        let second = apply_gates(first.candidates.clone(), &cfg);
        assert_eq!(second.candidates, first.candidates);
        assert!(second.rejected.is_empty());
    }

    #[test]
    fn gate_order_does_not_matter() {
        let cfg = ImageFilterConfig::default();
        let pool: Vec<CandidateImage> = [
            raw(0, 0, textured(64, 900, 1)),
            raw(0, 1, flat(10, 10)),
            raw(0, 2, textured(400, 400, 2)),
        ]
        .iter()
        .map(CandidateImage::from_raw)
        .collect();
        let index = RepetitionIndex::build(&pool);
        for img in &pool {
            let forward = check(img, &cfg, &index).is_some();
            let reverse = repetition_gate(img, &cfg, &index)
                .or_else(|| color_gate(img, &cfg))
                .or_else(|| aspect_gate(img, &cfg))
                .or_else(|| size_gate(img, &cfg))
                .is_some();
            assert_eq!(forward, reverse);
        }
    }

    #[test]
    fn fingerprint_is_stable_for_identical_pixels() {
        let a = textured(300, 300, 7);
        let b = textured(300, 300, 7);
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 8);
    }

    #[test]
    fn flat_image_has_zero_luma_variance() {
        let p = ColorProfile::of(&flat(50, 50));
        assert_eq!(p.unique_colors, 1);
        assert!(p.luma_stddev < 0.01);
    }
}
