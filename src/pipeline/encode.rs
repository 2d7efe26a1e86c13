//! Image encoding: `DynamicImage` → base64 payload that fits the endpoint.
//!
//! PNG is tried first because it is lossless and rendered form pages are
//! mostly flat colour, which PNG compresses well. When the base64 payload is
//! above the provider's ceiling the encoder walks a fixed ladder: JPEG at
//! falling quality, then JPEG at shrinking resolution. The last rung is
//! returned even if it is still too large; the endpoint then answers 413 and
//! the client retries with a smaller ceiling.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use tracing::{debug, warn};

const JPEG_QUALITIES: [u8; 3] = [85, 70, 55];
const DOWNSCALE_STEPS: usize = 4;
const DOWNSCALE_FACTOR: f32 = 0.75;

/// A page image ready to embed in a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: &'static str,
    /// Standard base64, no line breaks.
    pub data: String,
}

impl EncodedImage {
    /// `data:<mime>;base64,<data>`
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    /// Size of the base64 payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.data.len()
    }
}

/// Encode a rendered page so its base64 payload fits `max_payload_bytes`.
pub fn encode_page(
    img: &DynamicImage,
    max_payload_bytes: usize,
) -> Result<EncodedImage, image::ImageError> {
    let png = encode_png(img)?;
    debug!("Encoded page → {} bytes base64 (png)", png.payload_len());
    if png.payload_len() <= max_payload_bytes {
        return Ok(png);
    }

    let mut last = png;
    for quality in JPEG_QUALITIES {
        last = encode_jpeg(img, quality)?;
        debug!(
            "Re-encoded page → {} bytes base64 (jpeg q{})",
            last.payload_len(),
            quality
        );
        if last.payload_len() <= max_payload_bytes {
            return Ok(last);
        }
    }

    let mut scaled = img.clone();
    let lowest_quality = JPEG_QUALITIES[JPEG_QUALITIES.len() - 1];
    for _ in 0..DOWNSCALE_STEPS {
        let w = ((scaled.width() as f32) * DOWNSCALE_FACTOR).max(1.0) as u32;
        let h = ((scaled.height() as f32) * DOWNSCALE_FACTOR).max(1.0) as u32;
        scaled = scaled.resize(w, h, FilterType::Triangle);
        last = encode_jpeg(&scaled, lowest_quality)?;
        debug!(
            "Downscaled page to {}x{} → {} bytes base64",
            w,
            h,
            last.payload_len()
        );
        if last.payload_len() <= max_payload_bytes {
            return Ok(last);
        }
    }

    warn!(
        "Page payload still {} bytes after compression (ceiling {})",
        last.payload_len(),
        max_payload_bytes
    );
    Ok(last)
}

fn encode_png(img: &DynamicImage) -> Result<EncodedImage, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(EncodedImage {
        mime_type: "image/png",
        data: STANDARD.encode(&buf),
    })
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<EncodedImage, image::ImageError> {
    // JPEG carries no alpha channel.
    let flattened = match img {
        DynamicImage::ImageLuma8(_) => img.clone(),
        DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) => {
            DynamicImage::ImageLuma8(img.to_luma8())
        }
        _ => DynamicImage::ImageRgb8(img.to_rgb8()),
    };
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    flattened.write_with_encoder(encoder)?;
    Ok(EncodedImage {
        mime_type: "image/jpeg",
        data: STANDARD.encode(&buf),
    })
}
