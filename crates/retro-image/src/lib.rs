mod export;
mod resize;

pub use export::{
    export, export_file_name, mime_type_for_path, probe_dimensions, render, sniff_mime_type, ExportError, ExportedImage,
    RenderedImage,
};
pub use resize::{DimensionState, Dimensions, ResizeError, DEFAULT_HEIGHT, DEFAULT_WIDTH, MAX_DIMENSION, SCALE_PRESETS};

pub fn estimate_rgba_bytes(size: Dimensions) -> u64 {
    (size.width as u64)
        .saturating_mul(size.height as u64)
        .saturating_mul(4)
}
