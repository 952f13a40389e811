pub mod fetch;
pub mod tools;

use thiserror::Error;

pub use fetch::{FetchedImage, FsFetcher, HttpFetcher, ImageFetcher};
pub use tools::{CompressedImage, CompressionSettings, ImageCodec, LossyCodec};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Image request failed with status: {0}")]
    StatusError(u16),

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to decode image: {0}")]
    DecodeError(String),

    #[error("Raster surface unavailable: {0}")]
    RasterUnavailable(String),

    #[error("Image encoding failed: {0}")]
    EncodeError(String),

    #[error("Compression task failed: {0}")]
    TaskError(String),
}

// Detect image type from the leading magic bytes
pub fn detect_image_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        "image/png"
    } else if data.starts_with(&[0x47, 0x49, 0x46]) {
        "image/gif"
    } else if data.len() >= 12 && data.starts_with(&[0x52, 0x49, 0x46, 0x46]) && data[8..12] == [0x57, 0x45, 0x42, 0x50] {
        "image/webp"
    } else if data.starts_with(&[0x42, 0x4D]) {
        "image/bmp"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_image_type() {
        assert_eq!(detect_image_type(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(detect_image_type(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A]), "image/png");
        assert_eq!(detect_image_type(b"GIF89a"), "image/gif");
        assert_eq!(detect_image_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(detect_image_type(b"RIFF\0\0\0\0WAVE"), "application/octet-stream");
        assert_eq!(detect_image_type(b""), "application/octet-stream");
    }
}
