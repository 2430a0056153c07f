//! Background model for subtraction: calibration, cropping and the published pair.

use crate::error::{AppResult, RigError};
use crate::messages::{BackgroundPair, Bounds};
use image::GrayImage;
use ndarray::{Array2, ArrayView2, Zip};
use std::sync::Arc;

/// Zero every pixel outside `bounds`.
pub fn crop_to_bounds(image: &mut GrayImage, bounds: &Bounds) {
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        if !bounds.contains(x, y) {
            pixel.0[0] = 0;
        }
    }
}

pub(crate) fn view(image: &GrayImage) -> AppResult<ArrayView2<'_, u8>> {
    let (width, height) = image.dimensions();
    ArrayView2::from_shape((height as usize, width as usize), image.as_raw())
        .map_err(|e| RigError::Processing(format!("frame does not match its dimensions: {e}")))
}

/// Outcome of feeding one frame to a calibrating model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calibration {
    /// Frames accumulated so far, out of the configured total
    InProgress { accumulated: usize, total: usize },
    Complete,
}

/// Per-pixel mean of N calibration frames, kept as an untouched original and
/// a copy cropped to the active bounds.
#[derive(Debug)]
pub struct BackgroundModel {
    width: u32,
    height: u32,
    frames_needed: usize,
    sum: Array2<u32>,
    accumulated: usize,
    original: Option<GrayImage>,
    bounded: Option<GrayImage>,
    bounds: Option<Bounds>,
}

impl BackgroundModel {
    /// An empty model that needs `frames_needed` frames before it is ready.
    pub fn new(width: u32, height: u32, frames_needed: usize) -> Self {
        Self {
            width,
            height,
            frames_needed: frames_needed.max(1),
            sum: Array2::zeros((height as usize, width as usize)),
            accumulated: 0,
            original: None,
            bounded: None,
            bounds: None,
        }
    }

    /// Drop the current background; the next frames recalibrate.
    pub fn reset(&mut self) {
        self.sum.fill(0);
        self.accumulated = 0;
        self.original = None;
        self.bounded = None;
    }

    /// Whether calibration finished and a background is available.
    pub fn is_ready(&self) -> bool {
        self.bounded.is_some()
    }

    pub fn accumulated(&self) -> usize {
        self.accumulated
    }

    pub fn frames_needed(&self) -> usize {
        self.frames_needed
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// Active background: cropped to bounds when bounds are set.
    pub fn background(&self) -> Option<&GrayImage> {
        self.bounded.as_ref()
    }

    pub fn original(&self) -> Option<&GrayImage> {
        self.original.as_ref()
    }

    /// Add one frame; computes the mean once `frames_needed` frames arrived.
    pub fn accumulate(&mut self, frame: &GrayImage) -> AppResult<Calibration> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(RigError::Processing(format!(
                "calibration frame is {:?}, expected {:?}",
                frame.dimensions(),
                (self.width, self.height)
            )));
        }
        if self.is_ready() {
            return Ok(Calibration::Complete);
        }

        let pixels = view(frame)?;
        Zip::from(&mut self.sum)
            .and(&pixels)
            .for_each(|sum, &p| *sum += u32::from(p));
        self.accumulated += 1;

        if self.accumulated < self.frames_needed {
            return Ok(Calibration::InProgress {
                accumulated: self.accumulated,
                total: self.frames_needed,
            });
        }

        let n = self.accumulated as f64;
        let mean: Vec<u8> = self
            .sum
            .iter()
            .map(|&s| (s as f64 / n).round().clamp(0.0, 255.0) as u8)
            .collect();
        let original = GrayImage::from_raw(self.width, self.height, mean).ok_or_else(|| {
            RigError::Processing("background buffer does not match frame size".to_string())
        })?;
        self.original = Some(original);
        self.rebuild_bounded();
        tracing::info!(frames = self.accumulated, "Background acquired");
        Ok(Calibration::Complete)
    }

    /// Replace the bounds and re-derive the cropped background from the original.
    pub fn set_bounds(&mut self, bounds: Option<Bounds>) {
        self.bounds = bounds;
        self.rebuild_bounded();
    }

    fn rebuild_bounded(&mut self) {
        self.bounded = self.original.as_ref().map(|original| {
            let mut bounded = original.clone();
            if let Some(bounds) = &self.bounds {
                crop_to_bounds(&mut bounded, bounds);
            }
            bounded
        });
    }

    /// Both backgrounds, for archival.
    pub fn pair(&self) -> Option<BackgroundPair> {
        match (&self.bounded, &self.original) {
            (Some(bounded), Some(original)) => Some(BackgroundPair {
                bounded: Arc::new(bounded.clone()),
                original: Arc::new(original.clone()),
            }),
            _ => None,
        }
    }
}
