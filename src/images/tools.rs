use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, RgbaImage};

use crate::config::CompressionConfig;
use crate::images::ImageError;

/// Knobs for one compression run, lifted out of [`CompressionConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionSettings {
    pub quality: u8,
    pub export_quality: u8,
    pub max_width: u32,
    pub max_height: u32,
    pub max_canvas_pixels: u64,
}

impl From<&CompressionConfig> for CompressionSettings {
    fn from(config: &CompressionConfig) -> Self {
        Self {
            quality: config.jpeg_quality(),
            export_quality: config.export_jpeg_quality(),
            max_width: config.max_width,
            max_height: config.max_height,
            max_canvas_pixels: config.max_canvas_pixels,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressedImage {
    pub data: Vec<u8>,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

/// Decoding and lossy re-encoding of raster images.
///
/// Both calls are CPU bound and are run on the blocking pool.
pub trait ImageCodec: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<DynamicImage, ImageError>;

    fn compress(&self, img: &DynamicImage, settings: &CompressionSettings) -> Result<CompressedImage, ImageError>;
}

/// JPEG codec built on the `image` crate.
///
/// Compression is two passes: the decoded image is drawn onto an RGBA
/// surface and exported as a high quality JPEG, then that export is decoded
/// again, fitted inside the size bounds and written at the target quality.
#[derive(Debug, Default, Clone, Copy)]
pub struct LossyCodec;

impl ImageCodec for LossyCodec {
    fn decode(&self, data: &[u8]) -> Result<DynamicImage, ImageError> {
        image::load_from_memory(data).map_err(|e| ImageError::DecodeError(e.to_string()))
    }

    fn compress(&self, img: &DynamicImage, settings: &CompressionSettings) -> Result<CompressedImage, ImageError> {
        let surface = rasterize(img, settings.max_canvas_pixels)?;
        let exported = export_surface(&surface, settings.export_quality)?;
        reencode(&exported, settings)
    }
}

// Draw the image onto an RGBA surface at its natural size
pub fn rasterize(img: &DynamicImage, max_canvas_pixels: u64) -> Result<RgbaImage, ImageError> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(ImageError::RasterUnavailable(format!("empty surface {}x{}", width, height)));
    }
    let pixels = u64::from(width) * u64::from(height);
    if pixels > max_canvas_pixels {
        return Err(ImageError::RasterUnavailable(format!(
            "{}x{} exceeds the {} pixel surface limit",
            width, height, max_canvas_pixels
        )));
    }
    Ok(img.to_rgba8())
}

// Export a surface as JPEG. Alpha is flattened onto black, as a canvas export does.
pub fn export_surface(surface: &RgbaImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    encode_jpeg(&DynamicImage::ImageRgba8(surface.clone()), quality)
}

pub fn reencode(blob: &[u8], settings: &CompressionSettings) -> Result<CompressedImage, ImageError> {
    let img = image::load_from_memory(blob).map_err(|e| ImageError::DecodeError(e.to_string()))?;
    let (width, height) = fit_within(img.dimensions(), settings.max_width, settings.max_height);

    let img = if (width, height) == img.dimensions() {
        img
    } else {
        // Bilinear, matching what a canvas uses when drawing scaled
        img.resize_exact(width, height, FilterType::Triangle)
    };

    let data = encode_jpeg(&img, settings.quality)?;
    Ok(CompressedImage {
        data,
        content_type: "image/jpeg".to_string(),
        width,
        height,
    })
}

/// Largest size inside `max_width` x `max_height` that keeps the aspect
/// ratio. Never upscales.
pub fn fit_within((width, height): (u32, u32), max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = (max_width as f64 / width as f64).min(max_height as f64 / height as f64);
    let scaled_width = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let scaled_height = ((height as f64 * scale).round() as u32).clamp(1, max_height);
    (scaled_width, scaled_height)
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut output = Vec::new();
    let rgb = img.to_rgb8();
    let mut encoder = JpegEncoder::new_with_quality(&mut output, quality.clamp(1, 100));
    encoder
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|e| ImageError::EncodeError(format!("JPEG encoding failed: {}", e)))?;
    Ok(output)
}
