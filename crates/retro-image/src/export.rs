use std::io::Cursor;
use std::path::Path;

use image::{imageops, imageops::FilterType, DynamicImage, GenericImageView, ImageFormat, ImageReader};
use retro_core::{ImagePayload, RetroStyle, SmoothingPolicy, SmoothingQuality};
use serde::Serialize;
use thiserror::Error;

use crate::resize::{Dimensions, MAX_DIMENSION};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export dimensions {width}x{height} are outside 1..={max}", max = MAX_DIMENSION)]
    InvalidDimensions { width: u32, height: u32 },
    #[error("failed to decode source image: {0}")]
    Decode(String),
    #[error("failed to encode png: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedImage {
    pub file_name: String,
    #[serde(skip)]
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub style: RetroStyle,
    pub timestamp_ms: u128,
}

pub fn export_file_name(style: RetroStyle, timestamp_ms: u128) -> String {
    format!("retro-lens-{}-{}.png", style.file_label(), timestamp_ms)
}

fn filter_for(policy: SmoothingPolicy) -> FilterType {
    match policy {
        SmoothingPolicy::Disabled => FilterType::Nearest,
        SmoothingPolicy::Enabled {
            quality: SmoothingQuality::Low,
        } => FilterType::Triangle,
        SmoothingPolicy::Enabled {
            quality: SmoothingQuality::High,
        } => FilterType::CatmullRom,
    }
}

/// Stretches `source` to exactly `target` (no crop, no letterbox) and encodes it as PNG.
pub fn render(source: &ImagePayload, target: Dimensions, style: RetroStyle) -> Result<RenderedImage, ExportError> {
    if !target.is_within_bounds() {
        return Err(ExportError::InvalidDimensions {
            width: target.width,
            height: target.height,
        });
    }
    let decoded = decode(&source.bytes)?;
    let (src_w, src_h) = decoded.dimensions();
    let filter = filter_for(style.smoothing());
    let resized = if (src_w, src_h) == (target.width, target.height) {
        decoded.to_rgba8()
    } else {
        imageops::resize(&decoded.to_rgba8(), target.width, target.height, filter)
    };

    let mut png = Vec::new();
    DynamicImage::ImageRgba8(resized)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    log::debug!(
        "rendered {}x{} -> {}x{} with {:?} for {}",
        src_w,
        src_h,
        target.width,
        target.height,
        filter,
        style
    );
    Ok(RenderedImage {
        png,
        width: target.width,
        height: target.height,
    })
}

pub fn export(
    source: &ImagePayload,
    target: Dimensions,
    style: RetroStyle,
    timestamp_ms: u128,
) -> Result<ExportedImage, ExportError> {
    let rendered = render(source, target, style)?;
    Ok(ExportedImage {
        file_name: export_file_name(style, timestamp_ms),
        png: rendered.png,
        width: rendered.width,
        height: rendered.height,
        style,
        timestamp_ms,
    })
}

/// Reads the pixel size of an encoded image, from its header when the format allows it.
pub fn probe_dimensions(bytes: &[u8]) -> Result<Dimensions, ExportError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ExportError::Decode(e.to_string()))?;
    let (width, height) = match reader.into_dimensions() {
        Ok(size) => size,
        Err(_) => decode(bytes)?.dimensions(),
    };
    Ok(Dimensions::new(width, height))
}

pub fn sniff_mime_type(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes).ok().map(|format| format.to_mime_type())
}

pub fn mime_type_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, ExportError> {
    if bytes.is_empty() {
        return Err(ExportError::Decode("empty image data".to_string()));
    }
    image::load_from_memory(bytes).map_err(|e| ExportError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgb};

    use super::*;

    fn checker_png(width: u32, height: u32) -> ImagePayload {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([10, 10, 10])
            }
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .expect("sample png");
        ImagePayload::new("image/png", out)
    }

    #[test]
    fn export_matches_requested_size_regardless_of_source() {
        for (w, h) in [(1000, 50), (8, 8), (320, 240)] {
            let exported =
                export(&checker_png(w, h), Dimensions::new(320, 240), RetroStyle::Crt, 1_700_000_000_000).expect("export");
            let decoded = image::load_from_memory(&exported.png).expect("decode png");
            assert_eq!(decoded.dimensions(), (320, 240));
            assert_eq!(image::guess_format(&exported.png).expect("format"), ImageFormat::Png);
        }
    }

    #[test]
    fn pixel_art_upscale_keeps_hard_edges() {
        let rendered = render(&checker_png(2, 2), Dimensions::new(8, 8), RetroStyle::Gameboy).expect("render");
        let decoded = image::load_from_memory(&rendered.png).expect("decode").to_rgb8();
        assert!(decoded.pixels().all(|p| p[0] == 255 || p[0] == 10));
        assert_eq!(decoded.get_pixel(0, 0)[0], 255);
        assert_eq!(decoded.get_pixel(4, 0)[0], 10);
    }

    #[test]
    fn smoothed_upscale_blends_neighbours() {
        let rendered = render(&checker_png(2, 2), Dimensions::new(8, 8), RetroStyle::BwCcd).expect("render");
        let decoded = image::load_from_memory(&rendered.png).expect("decode").to_rgb8();
        assert!(decoded.pixels().any(|p| p[0] != 255 && p[0] != 10));
    }

    #[test]
    fn file_name_carries_style_and_timestamp() {
        assert_eq!(export_file_name(RetroStyle::BwCcd, 42), "retro-lens-bw_ccd-42.png");
        let exported = export(&checker_png(4, 4), Dimensions::new(4, 4), RetroStyle::Nokia, 7).expect("export");
        assert_eq!(exported.file_name, "retro-lens-nokia-7.png");
    }

    #[test]
    fn undecodable_source_is_an_error() {
        let err = render(&ImagePayload::new("image/png", vec![1, 2, 3]), Dimensions::new(4, 4), RetroStyle::Crt)
            .expect_err("garbage should not decode");
        assert!(matches!(err, ExportError::Decode(_)));
    }

    #[test]
    fn out_of_bounds_target_is_an_error() {
        let err = render(&checker_png(4, 4), Dimensions::new(0, 4), RetroStyle::Crt).expect_err("zero width");
        assert!(matches!(err, ExportError::InvalidDimensions { .. }));
        let err = render(&checker_png(4, 4), Dimensions::new(4, MAX_DIMENSION + 1), RetroStyle::Crt)
            .expect_err("too tall");
        assert!(matches!(err, ExportError::InvalidDimensions { .. }));
    }

    #[test]
    fn probe_reads_size_and_mime() {
        let payload = checker_png(12, 7);
        assert_eq!(probe_dimensions(&payload.bytes).expect("probe"), Dimensions::new(12, 7));
        assert_eq!(sniff_mime_type(&payload.bytes), Some("image/png"));
        assert_eq!(mime_type_for_path(Path::new("a/b/photo.JPG")), Some("image/jpeg"));
        assert_eq!(mime_type_for_path(Path::new("notes.txt")), None);
    }
}
