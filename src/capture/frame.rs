// frame.rs: Downscales a captured frame to fit a bounding box, JPEG-encodes
// it, and wraps it in a base64 data URL.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, GenericImageView, RgbaImage};
use serde::{Deserialize, Serialize};

use super::CaptureError;

const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Per-call overrides for `capture_frame`. Unset fields use the settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOptions {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub quality: Option<f32>,
}

/// Resolved sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleParams {
    pub max_width: u32,
    pub max_height: u32,
    /// 0.0–1.0
    pub quality: f32,
}

impl Default for SampleParams {
    fn default() -> Self {
        Self {
            max_width: crate::settings::DEFAULT_MAX_WIDTH,
            max_height: crate::settings::DEFAULT_MAX_HEIGHT,
            quality: crate::settings::DEFAULT_QUALITY,
        }
    }
}

impl SampleParams {
    pub fn with_overrides(self, options: &CaptureOptions) -> Self {
        Self {
            max_width: options.max_width.unwrap_or(self.max_width),
            max_height: options.max_height.unwrap_or(self.max_height),
            quality: options.quality.unwrap_or(self.quality),
        }
    }
}

/// An encoded frame ready to send to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data_url: String,
    pub width: u32,
    pub height: u32,
}

/// Size that fits `width × height` inside `max_width × max_height` keeping
/// the aspect ratio. Never upscales; each side is at least 1px.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let max_width = max_width.max(1);
    let max_height = max_height.max(1);
    if width <= max_width && height <= max_height {
        return (width, height);
    }

    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_height);
    (w, h)
}

/// Map a 0–1 quality onto the encoder's 1–100 scale.
pub fn quality_to_jpeg(quality: f32) -> u8 {
    if !quality.is_finite() {
        return (crate::settings::DEFAULT_QUALITY * 100.0).round() as u8;
    }
    (quality.clamp(0.0, 1.0) * 100.0).round().max(1.0) as u8
}

pub fn encode_jpeg(img: &DynamicImage, quality: f32) -> Result<Vec<u8>, CaptureError> {
    let (w, h) = img.dimensions();
    let mut jpeg_buf: Vec<u8> = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_buf, quality_to_jpeg(quality));
    encoder
        .encode(img.to_rgb8().as_raw(), w, h, image::ExtendedColorType::Rgb8)
        .map_err(|e| CaptureError::Encode(e.to_string()))?;
    Ok(jpeg_buf)
}

pub fn to_data_url(jpeg: &[u8]) -> String {
    format!("{JPEG_DATA_URL_PREFIX}{}", BASE64.encode(jpeg))
}

/// Split a `data:<mime>;base64,<payload>` URL into its mime type and bytes.
pub fn parse_data_url(url: &str) -> Option<(&str, Vec<u8>)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    let bytes = BASE64.decode(payload).ok()?;
    Some((mime, bytes))
}

/// Shrink, encode and wrap one frame.
pub fn sample_frame(frame: RgbaImage, params: SampleParams) -> Result<EncodedFrame, CaptureError> {
    let img = DynamicImage::ImageRgba8(frame);
    let (src_w, src_h) = img.dimensions();
    if src_w == 0 || src_h == 0 {
        return Err(CaptureError::Failed("stream produced an empty frame".into()));
    }

    let (w, h) = fit_within(src_w, src_h, params.max_width, params.max_height);
    let img = if (w, h) != (src_w, src_h) {
        img.resize_exact(w, h, imageops::FilterType::Triangle)
    } else {
        img
    };

    let jpeg = encode_jpeg(&img, params.quality)?;
    log::debug!(
        "Sampled frame {}x{} -> {}x{} ({} bytes)",
        src_w,
        src_h,
        w,
        h,
        jpeg.len()
    );
    Ok(EncodedFrame {
        data_url: to_data_url(&jpeg),
        width: w,
        height: h,
    })
}
