//! Image payload handling: base64 / data-URL payloads in, RGB pixel buffers out.

use std::io::Cursor;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageOutputFormat, RgbImage};

use crate::errors::{AppError, AppResult};

const DATA_URL_MARKER: &str = "base64,";
const REFERENCE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

/// Drops a `data:image/...;base64,` prefix when present.
pub fn strip_data_url(payload: &str) -> &str {
    match payload.find(DATA_URL_MARKER) {
        Some(idx) => &payload[idx + DATA_URL_MARKER.len()..],
        None => payload,
    }
}

pub fn decode_base64_payload(payload: &str) -> AppResult<Vec<u8>> {
    let encoded: String = strip_data_url(payload)
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    if encoded.is_empty() {
        return Err(AppError::InvalidImage {
            message: "image payload is empty".into(),
        });
    }

    general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|err| AppError::InvalidImage {
            message: format!("payload is not valid base64: {err}"),
        })
}

pub fn decode_image(bytes: &[u8]) -> AppResult<RgbImage> {
    if bytes.is_empty() {
        return Err(AppError::InvalidImage {
            message: "image data is empty".into(),
        });
    }
    let image = image::load_from_memory(bytes).map_err(|source| AppError::ImageDecode { source })?;
    let rgb = image.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(AppError::InvalidImage {
            message: "image has no pixels".into(),
        });
    }
    Ok(rgb)
}

/// Lossless encoding used for the canonical reference file.
pub fn encode_png(image: &RgbImage) -> AppResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buffer, ImageOutputFormat::Png)
        .map_err(|err| AppError::ImageEncode(err.to_string()))?;
    Ok(buffer.into_inner())
}

pub fn is_reference_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            REFERENCE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
