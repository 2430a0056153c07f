//! Synthetic camera: a dark disk wandering over a lit, noisy floor.

use super::FrameSource;
use crate::error::SourceError;
use crate::frame::FrameShape;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;

const FLOOR: u8 = 180;
const SUBJECT: u8 = 40;
const NOISE: u8 = 4;
/// Disk area is close to the tracker's default expected blob size.
const SUBJECT_RADIUS: f64 = 11.0;

#[derive(Debug)]
pub struct SyntheticSource {
    shape: FrameShape,
    rng: StdRng,
    framerate: f64,
    frame: u64,
    phase: (f64, f64),
    connected: bool,
}

impl SyntheticSource {
    pub fn new(shape: FrameShape, framerate: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let phase = (rng.gen_range(0.0..TAU), rng.gen_range(0.0..TAU));
        Self {
            shape,
            rng,
            framerate: framerate.max(1.0),
            frame: 0,
            phase,
            connected: false,
        }
    }

    /// Disk center for frame `index`.
    pub fn subject_at(&self, index: u64) -> (f64, f64) {
        let t = index as f64 / self.framerate;
        let (cols, rows) = (f64::from(self.shape.cols), f64::from(self.shape.rows));
        let margin = SUBJECT_RADIUS * 2.0;
        let x = cols / 2.0 + (cols / 2.0 - margin) * (0.31 * t + self.phase.0).sin();
        let y = rows / 2.0 + (rows / 2.0 - margin) * (0.23 * t + self.phase.1).sin();
        (x, y)
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn is_live(&self) -> bool {
        true
    }

    fn connect(&mut self) -> Result<(), SourceError> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn next_frame(&mut self, out: &mut [u8]) -> Result<(), SourceError> {
        if !self.connected {
            return Err(SourceError::Disconnected);
        }
        if out.len() != self.shape.len() || self.shape.channels != 1 {
            return Err(SourceError::Camera(format!(
                "buffer of {} bytes for {:?}",
                out.len(),
                self.shape
            )));
        }
        let (cx, cy) = self.subject_at(self.frame);
        let cols = self.shape.cols as usize;
        let r2 = SUBJECT_RADIUS * SUBJECT_RADIUS;
        for (i, pixel) in out.iter_mut().enumerate() {
            let dx = (i % cols) as f64 - cx;
            let dy = (i / cols) as f64 - cy;
            let base = if dx * dx + dy * dy <= r2 { SUBJECT } else { FLOOR };
            *pixel = base.saturating_add(self.rng.gen_range(0..=NOISE));
        }
        self.frame += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
    }
}
