//! PDF extraction: per-page text, positioned text spans and embedded rasters.
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which keeps
//! thread-local state and must not run on Tokio worker threads, so the
//! blocking work goes through `spawn_blocking`.
//!
//! All vertical coordinates leaving this module are **top-down** (0 at the
//! top edge of the page), unlike PDF user space. Downstream stages compare
//! "above/below" without knowing about PDF conventions.

use crate::config::PageSelection;
use crate::error::Exam2JsonError;
use crate::pipeline::input::DocumentKind;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Axis-aligned box in page points, top-down y.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    /// Top edge (smallest y).
    pub fn top(&self) -> f32 {
        self.y0.min(self.y1)
    }
}

/// A run of text with the vertical position of its top edge.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub top: f32,
}

/// One embedded raster object as pdfium reports it.
#[derive(Debug, Clone)]
pub struct RawImage {
    /// 0-indexed source page.
    pub page: usize,
    /// Position among the image objects of the page.
    pub sequence: usize,
    pub bbox: Option<BoundingBox>,
    pub image: Arc<DynamicImage>,
}

/// Everything the pipeline needs from one PDF page.
#[derive(Debug, Clone)]
pub struct RawPage {
    /// 0-indexed page number in the source document.
    pub index: usize,
    pub height: f32,
    pub text: String,
    pub spans: Vec<TextSpan>,
    pub images: Vec<RawImage>,
}

impl RawPage {
    /// A page with text only (no layout, no images).
    pub fn from_text(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            height: 0.0,
            text: text.into(),
            spans: Vec::new(),
            images: Vec::new(),
        }
    }
}

/// Extract the selected pages of `pdf_path`.
///
/// Images are decoded only when `with_images` is set; the answer key never
/// needs them.
pub async fn extract_pages(
    pdf_path: &Path,
    kind: DocumentKind,
    password: Option<&str>,
    selection: &PageSelection,
    with_images: bool,
) -> Result<Vec<RawPage>, Exam2JsonError> {
    let path = pdf_path.to_path_buf();
    let password = password.map(str::to_string);
    let selection = selection.clone();

    tokio::task::spawn_blocking(move || {
        extract_pages_blocking(&path, kind, password.as_deref(), &selection, with_images)
    })
    .await
    .map_err(|e| Exam2JsonError::Internal(format!("Extraction task panicked: {e}")))?
}

/// `PDFIUM_LIB_PATH` first, then the working directory, then the system.
fn bind_pdfium() -> Result<Pdfium, Exam2JsonError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| Exam2JsonError::PdfiumBindingFailed(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}

fn extract_pages_blocking(
    pdf_path: &Path,
    kind: DocumentKind,
    password: Option<&str>,
    selection: &PageSelection,
    with_images: bool,
) -> Result<Vec<RawPage>, Exam2JsonError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let detail = format!("{e:?}");
        if detail.to_lowercase().contains("password") {
            if password.is_some() {
                Exam2JsonError::WrongPassword {
                    path: pdf_path.to_path_buf(),
                }
            } else {
                Exam2JsonError::PasswordRequired {
                    path: pdf_path.to_path_buf(),
                }
            }
        } else {
            Exam2JsonError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail,
            }
        }
    })?;

    let pages = document.pages();
    let total = pages.len() as usize;
    let indices = selection.to_indices(total);
    if indices.is_empty() {
        return Err(Exam2JsonError::PageOutOfRange { kind, total });
    }
    info!("{} PDF loaded: {} pages, {} selected", kind, total, indices.len());

    let failed = |page: usize, e: PdfiumError| Exam2JsonError::ExtractionFailed {
        kind,
        page: page + 1,
        detail: format!("{e:?}"),
    };

    let mut raw_pages = Vec::with_capacity(indices.len());
    for idx in indices {
        let page = pages.get(idx as u16).map_err(|e| failed(idx, e))?;
        let height = page.height().value;

        let text = page.text().map_err(|e| failed(idx, e))?;
        let spans: Vec<TextSpan> = text
            .segments()
            .iter()
            .map(|segment| TextSpan {
                text: segment.text(),
                top: height - segment.bounds().top().value,
            })
            .collect();

        let mut images = Vec::new();
        if with_images {
            for object in page.objects().iter() {
                let Some(image_object) = object.as_image_object() else {
                    continue;
                };
                let sequence = images.len();
                match image_object.get_raw_image() {
                    Ok(image) => {
                        let bbox = object.bounds().ok().map(|b| BoundingBox {
                            x0: b.left().value,
                            y0: height - b.top().value,
                            x1: b.right().value,
                            y1: height - b.bottom().value,
                        });
                        images.push(RawImage {
                            page: idx,
                            sequence,
                            bbox,
                            image: Arc::new(image),
                        });
                    }
                    Err(e) => warn!("Page {}: skipping undecodable image: {:?}", idx + 1, e),
                }
            }
        }

        let all_text = text.all();
        debug!(
            "Page {}: {} chars, {} spans, {} images",
            idx + 1,
            all_text.len(),
            spans.len(),
            images.len()
        );

        raw_pages.push(RawPage {
            index: idx,
            height,
            text: all_text,
            spans,
            images,
        });
    }

    Ok(raw_pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_top_is_min_y() {
        let b = BoundingBox {
            x0: 0.0,
            y0: 300.0,
            x1: 10.0,
            y1: 120.0,
        };
        assert_eq!(b.top(), 120.0);
    }

    #[test]
    fn text_only_page_has_no_layout() {
        let p = RawPage::from_text(3, "QUESTÃO 01");
        assert_eq!(p.index, 3);
        assert!(p.spans.is_empty() && p.images.is_empty());
    }
}
