//! Image encoding: `DynamicImage` → JPEG bytes, and → base64 `ImageData`.
//!
//! Retained question images are persisted as JPEG files, and the same bytes
//! are what the Structuring Adapter sees when attachments are enabled. The
//! JPEG encoder rejects alpha channels, so images are flattened to RGB first.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use tracing::debug;

/// JPEG quality for persisted and attached images.
pub const JPEG_QUALITY: u8 = 90;

/// Encode as baseline JPEG.
pub fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(&rgb)?;
    debug!("Encoded {}x{} image → {} bytes JPEG", rgb.width(), rgb.height(), buf.len());
    Ok(buf)
}

/// Encode as a base64 JPEG attachment for the adapter.
///
/// `detail: "high"` keeps small print inside charts and tables legible to
/// GPT-4-class models.
pub fn encode_attachment(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let bytes = encode_jpeg(img)?;
    Ok(ImageData::new(STANDARD.encode(&bytes), "image/jpeg").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn alpha_images_encode_as_jpeg() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(12, 8, Rgba([0, 128, 255, 100])));
        let bytes = encode_jpeg(&img).expect("encode should succeed");
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "JPEG SOI marker");
    }

    #[test]
    fn attachment_is_base64_jpeg() {
        let img = DynamicImage::new_rgb8(10, 10);
        let data = encode_attachment(&img).unwrap();
        assert_eq!(data.mime_type, "image/jpeg");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
    }
}
