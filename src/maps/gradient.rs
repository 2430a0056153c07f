//! Value-range legend for the heatmap.

use super::ramp;
use crate::glyphs::{draw_text, text_height, text_width};
use image::{Rgb, RgbImage};

const MIN_LABEL: Rgb<u8> = Rgb([255, 255, 255]);
const MAX_LABEL: Rgb<u8> = Rgb([0, 0, 0]);

/// Horizontal ramp of `steps` blocks spanning `width`.
pub fn ramp_strip(width: u32, height: u32, steps: u32) -> RgbImage {
    let steps = steps.max(2);
    let block = (width / steps).max(1);
    RgbImage::from_fn(width, height, |x, _| {
        let step = (x / block).min(steps - 1);
        ramp(f64::from(step), f64::from(steps - 1))
    })
}

fn label(image: &mut RgbImage, minimum: u32, maximum: u32, scale: u32) {
    let y = (image.height() as i32 - text_height(scale) as i32) / 2;
    draw_text(image, &minimum.to_string(), 3, y, scale, MIN_LABEL);
    let max_text = maximum.to_string();
    let x = image.width() as i32 - 8 - text_width(&max_text, scale) as i32;
    draw_text(image, &max_text, x, y, scale, MAX_LABEL);
}

/// Live legend; redrawn only when the range changes.
#[derive(Debug, Clone)]
pub struct Gradient {
    base: RgbImage,
    image: RgbImage,
    range: Option<(u32, u32)>,
}

impl Gradient {
    pub fn new(width: u32, height: u32, steps: u32) -> Self {
        let base = ramp_strip(width, height, steps);
        let mut gradient = Self {
            image: base.clone(),
            base,
            range: None,
        };
        gradient.update(0, 0);
        gradient
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn reset(&mut self) {
        self.range = None;
        self.update(0, 0);
    }

    /// Returns whether the labels changed.
    pub fn update(&mut self, minimum: u32, maximum: u32) -> bool {
        if self.range == Some((minimum, maximum)) {
            return false;
        }
        self.image = self.base.clone();
        label(&mut self.image, minimum, maximum, 2);
        self.range = Some((minimum, maximum));
        true
    }
}

/// Stack a labelled legend of `legend_height` rows under `heatmap`.
pub fn append_legend(heatmap: &RgbImage, minimum: u32, maximum: u32, legend_height: u32, steps: u32) -> RgbImage {
    let (width, height) = heatmap.dimensions();
    let mut legend = ramp_strip(width, legend_height, steps);
    label(&mut legend, minimum, maximum, 2);
    let mut out = RgbImage::new(width, height + legend_height);
    for (x, y, pixel) in heatmap.enumerate_pixels() {
        out.put_pixel(x, y, *pixel);
    }
    for (x, y, pixel) in legend.enumerate_pixels() {
        out.put_pixel(x, y + height, *pixel);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_runs_black_to_red() {
        let strip = ramp_strip(320, 4, 32);
        assert_eq!(*strip.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*strip.get_pixel(319, 0), Rgb([255, 0, 0]));
    }

    #[test]
    fn test_update_only_on_range_change() {
        let mut gradient = Gradient::new(320, 100, 32);
        assert!(!gradient.update(0, 0));
        assert!(gradient.update(0, 17));
        assert!(!gradient.update(0, 17));
        let labelled = gradient.image().clone();
        gradient.reset();
        assert_ne!(&labelled, gradient.image());
    }

    #[test]
    fn test_append_legend_keeps_heatmap() {
        let heatmap = RgbImage::from_pixel(64, 48, Rgb([9, 9, 9]));
        let out = append_legend(&heatmap, 0, 5, 50, 64);
        assert_eq!(out.dimensions(), (64, 98));
        assert_eq!(*out.get_pixel(10, 10), Rgb([9, 9, 9]));
    }
}
