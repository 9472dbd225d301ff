use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};

use crate::error::AppError;

const THUMB_MAX_DIM: u32 = 300;

/// An encoded thumbnail with its pixel size.
#[derive(Debug)]
pub struct GeneratedThumbnail {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Resize an image so its longest dimension is at most `max_dim`.
/// Returns the image unchanged if it's already within bounds.
fn resize_to_max(img: &DynamicImage, max_dim: u32) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    let longest = w.max(h);
    if longest <= max_dim {
        return img.clone();
    }
    img.resize(
        (w as f64 * max_dim as f64 / longest as f64) as u32,
        (h as f64 * max_dim as f64 / longest as f64) as u32,
        FilterType::Lanczos3,
    )
}

fn encode_webp(img: &DynamicImage) -> Result<Vec<u8>, AppError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::WebP)
        .map_err(|e| AppError::Internal(format!("Failed to encode WebP: {e}")))?;
    Ok(buf.into_inner())
}

/// Read pixel dimensions from the header without decoding the image.
pub fn dimensions(bytes: &[u8]) -> Option<(i32, i32)> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let (w, h) = reader.into_dimensions().ok()?;
    Some((w as i32, h as i32))
}

/// Generate the gallery thumbnail (WebP) for an uploaded image.
pub fn generate(bytes: &[u8]) -> Result<GeneratedThumbnail, AppError> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AppError::Internal(format!("Failed to detect image format: {e}")))?
        .decode()
        .map_err(|e| AppError::Internal(format!("Failed to decode image: {e}")))?;

    let thumb = resize_to_max(&img, THUMB_MAX_DIM);
    Ok(GeneratedThumbnail {
        bytes: encode_webp(&thumb)?,
        width: thumb.width(),
        height: thumb.height(),
    })
}
