//! Cumulative path trace.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;

const PATH: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Debug, Clone)]
pub struct PathMap {
    image: RgbImage,
    downscale: u32,
    last: Option<(i32, i32)>,
}

impl PathMap {
    /// Trace of size `width` x `height`; incoming positions are divided by `downscale`.
    pub fn new(width: u32, height: u32, downscale: u32) -> Self {
        Self {
            image: RgbImage::new(width, height),
            downscale: downscale.max(1),
            last: None,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.image.fill(0);
    }

    /// Extend the trace to a position given in frame coordinates.
    pub fn add(&mut self, x: i32, y: i32) {
        let scale = self.downscale as f64;
        let point = (
            (f64::from(x) / scale).round() as i32,
            (f64::from(y) / scale).round() as i32,
        );
        if let Some(last) = self.last {
            draw_line_segment_mut(
                &mut self.image,
                (last.0 as f32, last.1 as f32),
                (point.0 as f32, point.1 as f32),
                PATH,
            );
        }
        self.last = Some(point);
    }

    /// Full-resolution trace of every detected position in order.
    pub fn render_full<I>(width: u32, height: u32, positions: I) -> RgbImage
    where
        I: IntoIterator<Item = (i32, i32)>,
    {
        let mut map = Self::new(width, height, 1);
        for (x, y) in positions {
            map.add(x, y);
        }
        map.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_join_consecutive_points() {
        let mut map = PathMap::new(50, 50, 2);
        map.add(20, 20);
        // a single point draws nothing
        assert!(map.image().pixels().all(|p| *p == Rgb([0, 0, 0])));
        map.add(60, 20);
        assert_eq!(*map.image().get_pixel(10, 10), PATH);
        assert_eq!(*map.image().get_pixel(20, 10), PATH);
        assert_eq!(*map.image().get_pixel(29, 10), PATH);
        assert_eq!(*map.image().get_pixel(20, 20), Rgb([0, 0, 0]));

        map.reset();
        map.add(0, 0);
        assert!(map.image().pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_full_resolution_trace() {
        let image = PathMap::render_full(40, 40, vec![(5, 5), (5, 30)]);
        assert_eq!(*image.get_pixel(5, 17), PATH);
    }
}
