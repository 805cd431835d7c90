use std::io::Cursor;

use anyhow::{Result, anyhow};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use serde::Serialize;

/// Target box and encoding parameters for the resize/compress transform.
#[derive(Clone, Copy, Debug)]
pub struct TransformOptions {
    pub target_width: u32,
    pub target_height: u32,
    pub jpeg_quality: u8,
    pub maintain_aspect_ratio: bool,
}

/// Metrics describing what the transform did to one image.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessingInfo {
    pub original_size: (u32, u32),
    pub processed_size: (u32, u32),
    pub original_format: String,
    pub scale_factor: Option<f64>,
    pub compression_quality: u8,
    pub size_reduction_ratio: f64,
}

/// Scale an uploaded image into the target box and re-encode it as JPEG.
///
/// Pure function: decode, convert to 3-channel color, scale (preserving
/// aspect ratio when configured), encode at the configured quality. Returns
/// the JPEG bytes together with the processing metrics.
pub fn compress_and_resize(bytes: &[u8], options: &TransformOptions) -> Result<(Vec<u8>, ProcessingInfo)> {
    let original_format = image::guess_format(bytes)
        .map(|format| format!("{format:?}"))
        .unwrap_or_else(|_| "Unknown".to_string());
    let decoded = image::load_from_memory(bytes).map_err(|err| anyhow!("decode image failed: {err}"))?;
    let (original_width, original_height) = (decoded.width(), decoded.height());
    if original_width == 0 || original_height == 0 {
        return Err(anyhow!("image has zero dimensions"));
    }

    let (resized, scale_factor) = if options.maintain_aspect_ratio {
        let width_ratio = options.target_width as f64 / original_width as f64;
        let height_ratio = options.target_height as f64 / original_height as f64;
        let scale = width_ratio.min(height_ratio);
        (
            decoded.resize(options.target_width, options.target_height, FilterType::Lanczos3),
            Some(scale),
        )
    } else {
        (
            decoded.resize_exact(options.target_width, options.target_height, FilterType::Lanczos3),
            None,
        )
    };

    let rgb = resized.to_rgb8();
    let (processed_width, processed_height) = rgb.dimensions();

    let mut output = Vec::new();
    let mut cursor = Cursor::new(&mut output);
    let mut encoder = JpegEncoder::new_with_quality(&mut cursor, options.jpeg_quality);
    encoder
        .encode_image(&rgb)
        .map_err(|err| anyhow!("encode jpeg failed: {err}"))?;

    let original_pixels = (original_width as f64) * (original_height as f64);
    let processed_pixels = (processed_width as f64) * (processed_height as f64);
    let info = ProcessingInfo {
        original_size: (original_width, original_height),
        processed_size: (processed_width, processed_height),
        original_format,
        scale_factor,
        compression_quality: options.jpeg_quality,
        size_reduction_ratio: round3(processed_pixels / original_pixels),
    };

    Ok((output, info))
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
