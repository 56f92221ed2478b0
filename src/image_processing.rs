use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat, RgbImage};
use tracing::debug;

use crate::config::DownscaleConfig;

#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Decodes a `data:<mime>;base64,<payload>` URL.
pub fn decode_data_url(data_url: &str) -> Result<ImagePayload> {
    let rest = data_url
        .trim()
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("missing data: scheme"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("missing data url payload"))?;
    let mime_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| anyhow!("data url is not base64 encoded"))?;
    if mime_type.contains(';') {
        return Err(anyhow!("unsupported data url parameters"));
    }
    let mime_type = if mime_type.is_empty() {
        "application/octet-stream"
    } else {
        mime_type
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|err| anyhow!("invalid base64 payload: {err}"))?;
    Ok(ImagePayload {
        bytes,
        mime_type: mime_type.to_string(),
    })
}

pub fn to_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

/// Shrinks the upload so the provider payload stays small. Also reports the
/// dimensions of the re-encoded image.
///
/// Any failure along the way hands back the original bytes untouched, with
/// no dimensions.
pub fn downscale_to_jpeg(
    input: ImagePayload,
    limits: &DownscaleConfig,
) -> (ImagePayload, Option<(u32, u32)>) {
    match try_downscale(&input.bytes, limits) {
        Ok((bytes, dimensions)) => (
            ImagePayload {
                bytes,
                mime_type: "image/jpeg".to_string(),
            },
            Some(dimensions),
        ),
        Err(err) => {
            debug!(error = %err, mime_type = %input.mime_type, "downscale skipped");
            (input, None)
        }
    }
}

fn try_downscale(bytes: &[u8], limits: &DownscaleConfig) -> Result<(Vec<u8>, (u32, u32))> {
    let image = match detect_mime_type(bytes).map(mime_to_format) {
        Some(Ok(format)) => image::load_from_memory_with_format(bytes, format),
        _ => image::load_from_memory(bytes),
    }
    .map_err(|err| anyhow!("decode image failed: {err}"))?;

    let (width, height) = image.dimensions();
    let long_edge = width.max(height);
    let image = if limits.max_edge > 0 && long_edge > limits.max_edge {
        let (new_width, new_height) = scaled_dimensions(width, height, limits.max_edge);
        image.resize_exact(new_width, new_height, FilterType::Lanczos3)
    } else {
        image
    };

    let rgb = image.to_rgb8();
    let mut output = encode_jpeg(&rgb, limits.quality_high)?;
    if output.len() > limits.max_bytes {
        output = encode_jpeg(&rgb, limits.quality_low)?;
    }
    Ok((output, rgb.dimensions()))
}

fn scaled_dimensions(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let scale = max_edge as f64 / width.max(height) as f64;
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    (new_width, new_height)
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    JpegEncoder::new_with_quality(&mut output, quality)
        .encode_image(image)
        .map_err(|err| anyhow!("encode jpeg failed: {err}"))?;
    Ok(output)
}

pub fn detect_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"BM") {
        return Some("image/bmp");
    }
    None
}

pub fn mime_to_format(mime_type: &str) -> Result<ImageFormat> {
    match mime_type {
        "image/png" => Ok(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Ok(ImageFormat::Jpeg),
        "image/gif" => Ok(ImageFormat::Gif),
        "image/webp" => Ok(ImageFormat::WebP),
        "image/bmp" => Ok(ImageFormat::Bmp),
        _ => Err(anyhow!("unsupported mime type: {mime_type}")),
    }
}
