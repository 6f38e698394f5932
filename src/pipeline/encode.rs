//! Image encoding: accepted page buffer → `data:image/png;base64,...` URL.
//!
//! PNG is lossless; radiograph detail should not pick up JPEG blocking on
//! its way into the report.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use tracing::debug;

pub const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Encode a page buffer as a PNG data URL.
pub fn encode_png_data_url(img: &RgbaImage) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded {}x{} image → {} bytes base64", img.width(), img.height(), b64.len());

    Ok(format!("{PNG_DATA_URL_PREFIX}{b64}"))
}
