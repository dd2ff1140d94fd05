use std::io::Cursor;

use image::{GrayImage, ImageReader};
use serde::Serialize;
use tracing::debug;

/// Symbology reported for every decoded symbol.
pub const QR_SYMBOLOGY: &str = "QRCODE";

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("failed to read image: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QrCode {
    pub data: String,
    #[serde(rename = "type")]
    pub symbology: String,
}

/// Decode every QR symbol visible in an encoded image (JPEG from the
/// camera, or any format `image` can guess).
pub fn scan_image(encoded: &[u8]) -> Result<Vec<QrCode>, QrError> {
    let img = ImageReader::new(Cursor::new(encoded))
        .with_guessed_format()?
        .decode()?;
    Ok(scan_luma(&img.to_luma8()))
}

pub fn scan_luma(gray: &GrayImage) -> Vec<QrCode> {
    let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
        gray.width() as usize,
        gray.height() as usize,
        |x, y| gray.get_pixel(x as u32, y as u32).0[0],
    );

    prepared
        .detect_grids()
        .into_iter()
        .filter_map(|grid| match grid.decode() {
            Ok((_meta, content)) => Some(QrCode {
                data: content,
                symbology: QR_SYMBOLOGY.to_string(),
            }),
            Err(e) => {
                debug!(error = ?e, "found QR grid but could not decode it");
                None
            }
        })
        .collect()
}
