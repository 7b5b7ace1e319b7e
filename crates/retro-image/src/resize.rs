//! Output dimension state and the aspect-lock transitions applied to it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest width or height the export surface may take.
pub const MAX_DIMENSION: u32 = 4096;
pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;
pub const SCALE_PRESETS: [f64; 4] = [0.25, 0.5, 1.0, 2.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_within_bounds(self) -> bool {
        (1..=MAX_DIMENSION).contains(&self.width) && (1..=MAX_DIMENSION).contains(&self.height)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ResizeError {
    #[error("scale factor must be a finite number greater than zero (received {0})")]
    InvalidScale(f64),
}

/// Output width/height plus the aspect lock.
///
/// Every transition keeps both dimensions inside `1..=MAX_DIMENSION`. While the
/// lock is on and the original aspect ratio is known, setting one side derives
/// the other from that ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionState {
    dimensions: Dimensions,
    lock_aspect: bool,
    original_aspect: Option<f64>,
}

impl Default for DimensionState {
    fn default() -> Self {
        Self {
            dimensions: Dimensions::new(DEFAULT_WIDTH, DEFAULT_HEIGHT),
            lock_aspect: true,
            original_aspect: None,
        }
    }
}

impl DimensionState {
    pub fn for_image(width: u32, height: u32) -> Self {
        let mut state = Self::default();
        state.reset_for_image(width, height);
        state
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn width(&self) -> u32 {
        self.dimensions.width
    }

    pub fn height(&self) -> u32 {
        self.dimensions.height
    }

    pub fn is_locked(&self) -> bool {
        self.lock_aspect
    }

    /// `None` until an image has been loaded, or when its ratio is unusable.
    pub fn original_aspect(&self) -> Option<f64> {
        self.original_aspect
    }

    pub fn set_width(&mut self, width: f64) {
        let width = clamp_dimension(width);
        self.dimensions = match self.locked_ratio() {
            Some(ratio) => fit_within_bounds(width as f64, width as f64 / ratio),
            None => Dimensions::new(width, self.dimensions.height),
        };
    }

    pub fn set_height(&mut self, height: f64) {
        let height = clamp_dimension(height);
        self.dimensions = match self.locked_ratio() {
            Some(ratio) => fit_within_bounds(height as f64 * ratio, height as f64),
            None => Dimensions::new(self.dimensions.width, height),
        };
    }

    pub fn apply_scale(&mut self, factor: f64) -> Result<(), ResizeError> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(ResizeError::InvalidScale(factor));
        }
        let scaled_width = self.dimensions.width as f64 * factor;
        self.dimensions = match self.locked_ratio() {
            Some(ratio) => fit_within_bounds(scaled_width, scaled_width / ratio),
            None => Dimensions::new(
                clamp_dimension(scaled_width),
                clamp_dimension(self.dimensions.height as f64 * factor),
            ),
        };
        Ok(())
    }

    pub fn toggle_lock(&mut self) {
        self.lock_aspect = !self.lock_aspect;
    }

    /// Adopts a freshly loaded image: its size becomes the output size, its
    /// ratio becomes the lock ratio, and the lock is switched back on.
    /// Oversized images shrink uniformly so the output keeps their ratio.
    pub fn reset_for_image(&mut self, width: u32, height: u32) {
        self.original_aspect = usable_ratio(width as f64 / height as f64);
        self.dimensions = match self.original_aspect {
            Some(_) => fit_within_bounds(width as f64, height as f64),
            None => Dimensions::new(clamp_dimension(width as f64), clamp_dimension(height as f64)),
        };
        self.lock_aspect = true;
    }

    fn locked_ratio(&self) -> Option<f64> {
        if self.lock_aspect {
            self.original_aspect.and_then(usable_ratio)
        } else {
            None
        }
    }
}

fn usable_ratio(ratio: f64) -> Option<f64> {
    (ratio.is_finite() && ratio > 0.0).then_some(ratio)
}

fn clamp_dimension(value: f64) -> u32 {
    if !value.is_finite() {
        return 1;
    }
    value.round().clamp(1.0, MAX_DIMENSION as f64) as u32
}

/// Scales a proportional pair by one common factor so both sides land in
/// `1..=MAX_DIMENSION`, then rounds. Both inputs must be finite and positive.
fn fit_within_bounds(width: f64, height: f64) -> Dimensions {
    let max = MAX_DIMENSION as f64;
    let shrink = (max / width).min(max / height).min(1.0);
    let grow = (1.0 / width).max(1.0 / height).max(1.0);
    let factor = if shrink < 1.0 { shrink } else { grow };
    Dimensions::new(clamp_dimension(width * factor), clamp_dimension(height * factor))
}
