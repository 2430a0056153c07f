//! Binned occupancy heatmap.

use super::ramp;
use crate::glyphs::draw_text;
use image::{Rgb, RgbImage};
use ndarray::Array2;

/// Occupancy counts on a coarse grid laid over an image of `width` x `height`.
#[derive(Debug, Clone)]
pub struct Heatmap {
    bins: Array2<u32>,
    width: u32,
    height: u32,
}

impl Heatmap {
    pub fn new(bin_rows: u32, bin_cols: u32, width: u32, height: u32) -> Self {
        Self {
            bins: Array2::zeros((bin_rows.max(1) as usize, bin_cols.max(1) as usize)),
            width,
            height,
        }
    }

    pub fn bins(&self) -> &Array2<u32> {
        &self.bins
    }

    pub fn reset(&mut self) {
        self.bins.fill(0);
    }

    fn bin_size(&self) -> (u32, u32) {
        let (rows, cols) = self.bins.dim();
        (
            (self.height / rows as u32).max(1),
            (self.width / cols as u32).max(1),
        )
    }

    /// Count a position given in image coordinates. Positions off the grid are dropped.
    pub fn add(&mut self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 {
            return false;
        }
        let (row_size, col_size) = self.bin_size();
        let row = (y as u32 / row_size) as usize;
        let col = (x as u32 / col_size) as usize;
        match self.bins.get_mut((row, col)) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    pub fn min_max(&self) -> (u32, u32) {
        let min = self.bins.iter().copied().min().unwrap_or(0);
        let max = self.bins.iter().copied().max().unwrap_or(0);
        (min, max)
    }

    /// One flat colored block per bin, at the size of the coordinate space.
    pub fn render(&self) -> RgbImage {
        self.render_at(self.width, self.height)
    }

    /// Like [`render`](Self::render) but scaled to `width` x `height`.
    pub fn render_at(&self, width: u32, height: u32) -> RgbImage {
        let (_, max) = self.min_max();
        let (rows, cols) = self.bins.dim();
        let row_size = (height / rows as u32).max(1);
        let col_size = (width / cols as u32).max(1);
        RgbImage::from_fn(width, height, |x, y| {
            let row = ((y / row_size) as usize).min(rows - 1);
            let col = ((x / col_size) as usize).min(cols - 1);
            ramp(f64::from(self.bins[(row, col)]), f64::from(max))
        })
    }

    /// [`render`](Self::render) with every bin's count written into it.
    pub fn render_with_counts(&self) -> RgbImage {
        let mut image = self.render();
        let (row_size, col_size) = self.bin_size();
        let (_, max) = self.min_max();
        for ((row, col), &count) in self.bins.indexed_iter() {
            let color = if f64::from(count) < f64::from(max) / 3.0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            };
            let x = col as i32 * col_size as i32 + 5;
            let y = row as i32 * row_size as i32 + 5;
            draw_text(&mut image, &count.to_string(), x, y, 1, color);
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binning_and_colors() {
        // 2x2 bins of 10 px
        let mut heatmap = Heatmap::new(2, 2, 20, 20);
        assert!(heatmap.add(3, 3));
        assert!(heatmap.add(4, 4));
        assert!(heatmap.add(15, 2));
        assert!(!heatmap.add(25, 2));
        assert!(!heatmap.add(-1, 2));
        assert_eq!(heatmap.bins()[(0, 0)], 2);
        assert_eq!(heatmap.bins()[(0, 1)], 1);
        assert_eq!(heatmap.min_max(), (0, 2));

        let image = heatmap.render();
        // hottest bin is red, half as hot is yellow, empty is black
        assert_eq!(*image.get_pixel(0, 0), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(19, 0), Rgb([255, 255, 0]));
        assert_eq!(*image.get_pixel(0, 19), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_reset_clears_counts() {
        let mut heatmap = Heatmap::new(12, 16, 320, 240);
        heatmap.add(100, 100);
        heatmap.reset();
        assert_eq!(heatmap.min_max(), (0, 0));
        assert!(heatmap.render().pixels().all(|p| *p == Rgb([0, 0, 0])));
        assert_eq!(heatmap.render_at(160, 120).dimensions(), (160, 120));
    }

    #[test]
    fn test_counts_are_drawn() {
        let mut heatmap = Heatmap::new(1, 2, 40, 20);
        heatmap.add(30, 10);
        let plain = heatmap.render();
        let labelled = heatmap.render_with_counts();
        assert_ne!(plain, labelled);
    }
}
