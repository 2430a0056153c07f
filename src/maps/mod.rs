//! Live visualizations derived from the coordinate stream.
//!
//! Heatmap, path and gradient are updated from the same coordinate and published
//! together through [`MultiStreamSync`]: either all three channels receive
//! this tick's frame or none does.

pub mod gradient;
pub mod heatmap;
pub mod path;
pub mod progress;

pub use gradient::Gradient;
pub use heatmap::Heatmap;
pub use path::PathMap;
pub use progress::{ProgressBar, ProgressSample, PROGRESS_HEIGHT};

use crate::config::MapConfig;
use crate::error::FrameError;
use crate::frame::{FrameProducer, FrameShape};
use crate::messages::Coordinate;
use image::{Rgb, RgbImage};

/// Black -> yellow -> red color for `value` in `0..=max`.
pub fn ramp(value: f64, max: f64) -> Rgb<u8> {
    if max <= 0.0 {
        return Rgb([0, 0, 0]);
    }
    let scaled = value / max * 2.0 * 255.0;
    let red = scaled.clamp(0.0, 255.0);
    let green = if scaled > 255.0 { 510.0 - scaled } else { scaled };
    Rgb([red as u8, green.clamp(0.0, 255.0) as u8, 0])
}

/// Joint publisher for a fixed group of channels.
#[derive(Debug)]
pub struct MultiStreamSync {
    producers: Vec<FrameProducer>,
}

impl MultiStreamSync {
    pub fn new(producers: Vec<FrameProducer>) -> Self {
        Self { producers }
    }

    pub fn shapes(&self) -> Vec<FrameShape> {
        self.producers.iter().map(FrameProducer::shape).collect()
    }

    /// True only when every channel's slot is free.
    pub fn all_writable(&self) -> bool {
        self.producers.iter().all(FrameProducer::may_write)
    }

    /// Write every frame, then mark every channel produced. Publishes nothing
    /// unless all channels are writable. Returns whether the group was published.
    pub fn try_publish_all(&self, frames: &[&[u8]]) -> Result<bool, FrameError> {
        if frames.len() != self.producers.len() {
            return Err(FrameError::SizeMismatch {
                expected: self.producers.len(),
                actual: frames.len(),
            });
        }
        for (producer, frame) in self.producers.iter().zip(frames) {
            if frame.len() != producer.shape().len() {
                return Err(FrameError::SizeMismatch {
                    expected: producer.shape().len(),
                    actual: frame.len(),
                });
            }
        }
        if !self.all_writable() {
            return Ok(false);
        }
        for (producer, frame) in self.producers.iter().zip(frames) {
            producer.channel().write(frame)?;
        }
        for producer in &self.producers {
            producer.channel().mark_produced();
        }
        Ok(true)
    }
}

/// Heatmap, path and gradient for the live display.
#[derive(Debug)]
pub struct MapSet {
    heatmap: Heatmap,
    /// Live map width and height
    size: (u32, u32),
    path: PathMap,
    gradient: Gradient,
    sync: MultiStreamSync,
}

impl MapSet {
    /// `sync` must hold the heatmap, path and gradient producers in that order.
    pub fn new(config: &MapConfig, frame_rows: u32, frame_cols: u32, sync: MultiStreamSync) -> Result<Self, FrameError> {
        let downscale = config.downscale.max(1);
        let (rows, cols) = (frame_rows / downscale, frame_cols / downscale);
        let expected = Self::shapes(config, frame_rows, frame_cols);
        let actual = sync.shapes();
        if actual != expected {
            return Err(FrameError::InvalidHeader(format!(
                "map channels are {actual:?}, expected {expected:?}"
            )));
        }
        Ok(Self {
            heatmap: Heatmap::new(config.heatmap_rows, config.heatmap_cols, frame_cols, frame_rows),
            size: (cols, rows),
            path: PathMap::new(cols, rows, downscale),
            gradient: Gradient::new(cols, config.gradient_height, config.gradient_steps),
            sync,
        })
    }

    /// Channel shapes for heatmap, path and gradient.
    pub fn shapes(config: &MapConfig, frame_rows: u32, frame_cols: u32) -> [FrameShape; 3] {
        let downscale = config.downscale.max(1);
        let (rows, cols) = (frame_rows / downscale, frame_cols / downscale);
        [
            FrameShape::rgb(rows, cols),
            FrameShape::rgb(rows, cols),
            FrameShape::rgb(config.gradient_height, cols),
        ]
    }

    pub fn heatmap(&self) -> &Heatmap {
        &self.heatmap
    }

    pub fn reset(&mut self) {
        self.heatmap.reset();
        self.path.reset();
        self.gradient.reset();
    }

    /// Fold in one coordinate. Missing coordinates change nothing.
    pub fn update(&mut self, coordinate: &Coordinate) {
        if let Some((x, y)) = coordinate.position() {
            self.path.add(x, y);
            self.heatmap.add(x, y);
            let (min, max) = self.heatmap.min_max();
            self.gradient.update(min, max);
        }
    }

    /// Publish all three views if every consumer is ready.
    pub fn try_publish(&self) -> Result<bool, FrameError> {
        if !self.sync.all_writable() {
            return Ok(false);
        }
        let heatmap: RgbImage = self.heatmap.render_at(self.size.0, self.size.1);
        self.sync.try_publish_all(&[
            heatmap.as_raw(),
            self.path.image().as_raw(),
            self.gradient.image().as_raw(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{frame_channel, FrameConsumer};
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_ramp_endpoints() {
        assert_eq!(ramp(0.0, 0.0), Rgb([0, 0, 0]));
        assert_eq!(ramp(0.0, 4.0), Rgb([0, 0, 0]));
        assert_eq!(ramp(2.0, 4.0), Rgb([255, 255, 0]));
        assert_eq!(ramp(4.0, 4.0), Rgb([255, 0, 0]));
    }

    fn channels(dir: &std::path::Path, n: usize) -> (Vec<FrameProducer>, Vec<FrameConsumer>) {
        let mut producers = Vec::new();
        let mut consumers = Vec::new();
        for i in 0..n {
            let (p, c) = frame_channel(
                &dir.join(format!("map{i}")),
                FrameShape::gray(1, 2),
                Duration::from_millis(1),
            )
            .unwrap();
            producers.push(p);
            consumers.push(c);
        }
        (producers, consumers)
    }

    #[test]
    fn test_no_partial_publish() {
        let dir = tempdir().unwrap();
        let (producers, consumers) = channels(dir.path(), 3);
        let sync = MultiStreamSync::new(producers);

        assert!(sync.try_publish_all(&[&[1, 1], &[2, 2], &[3, 3]]).unwrap());
        // consumers 0 and 1 keep up, consumer 2 never reads
        for tick in 0..20u8 {
            consumers[0].try_take().unwrap();
            consumers[1].try_take().unwrap();
            let published = sync
                .try_publish_all(&[&[tick, tick], &[tick, tick], &[tick, tick]])
                .unwrap();
            assert!(!published);
            assert!(!consumers[0].may_read());
            assert!(!consumers[1].may_read());
        }
        assert_eq!(consumers[2].try_take().unwrap(), Some(vec![3, 3]));

        assert!(sync.try_publish_all(&[&[7, 7], &[8, 8], &[9, 9]]).unwrap());
        assert_eq!(consumers[0].try_take().unwrap(), Some(vec![7, 7]));
        assert_eq!(consumers[2].try_take().unwrap(), Some(vec![9, 9]));
    }

    #[test]
    fn test_wrong_frame_count_is_rejected() {
        let dir = tempdir().unwrap();
        let (producers, _consumers) = channels(dir.path(), 2);
        let sync = MultiStreamSync::new(producers);
        assert!(sync.try_publish_all(&[&[1, 1]]).is_err());
        assert!(sync.try_publish_all(&[&[1], &[1, 1]]).is_err());
    }
}
