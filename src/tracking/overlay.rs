//! Display rendering for the tracker. Purely visual, never read back by detection.

use super::trail::Trail;
use crate::glyphs::{draw_text, text_height, text_width};
use crate::messages::{Bounds, Coordinate, TargetParams};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_hollow_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut,
};
use imageproc::rect::Rect;

const TARGET: Rgb<u8> = Rgb([0, 255, 0]);
const CENTROID: Rgb<u8> = Rgb([255, 0, 0]);
const TRAIL: Rgb<u8> = Rgb([0, 0, 255]);
const BOUNDS: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL: Rgb<u8> = Rgb([0, 0, 255]);
const ERROR: Rgb<u8> = Rgb([255, 0, 0]);

const LABEL_SCALE: u32 = 2;

/// Everything drawn on top of a tracked frame.
#[derive(Debug, Clone, Copy)]
pub struct Overlay<'a> {
    pub coordinate: Coordinate,
    pub trail: &'a Trail,
    pub target: Option<&'a TargetParams>,
    pub bounds: Option<&'a Bounds>,
}

pub fn gray_to_rgb(frame: &GrayImage) -> RgbImage {
    let (width, height) = frame.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let v = frame.get_pixel(x, y).0[0];
        Rgb([v, v, v])
    })
}

/// Line with a square pen of `thickness` pixels.
fn thick_line(canvas: &mut RgbImage, from: (i32, i32), to: (i32, i32), thickness: i32, color: Rgb<u8>) {
    let half = thickness.max(1) / 2;
    for off in -half..=half {
        for (dx, dy) in [(off, 0), (0, off)] {
            draw_line_segment_mut(
                canvas,
                ((from.0 + dx) as f32, (from.1 + dy) as f32),
                ((to.0 + dx) as f32, (to.1 + dy) as f32),
                color,
            );
        }
    }
}

/// Trail segments thin out with age.
fn trail_thickness(age: usize, capacity: usize) -> i32 {
    ((capacity as f64 / (age as f64 + 1.0)).sqrt() * 2.5) as i32
}

/// Draw target, bounds, trail, centroid and labels onto the frame.
pub fn render_tracked(frame: &GrayImage, overlay: &Overlay<'_>) -> RgbImage {
    let mut canvas = gray_to_rgb(frame);
    let height = canvas.height();

    if let Some(target) = overlay.target {
        let radius = target.radius as i32;
        draw_hollow_circle_mut(&mut canvas, target.center, radius, TARGET);
        draw_hollow_circle_mut(&mut canvas, target.center, radius + 1, TARGET);
    }

    if let Some(bounds) = overlay.bounds {
        let w = bounds.bottom_right.0.saturating_sub(bounds.top_left.0);
        let h = bounds.bottom_right.1.saturating_sub(bounds.top_left.1);
        if w > 0 && h > 0 {
            let rect = Rect::at(bounds.top_left.0 as i32, bounds.top_left.1 as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut canvas, rect, BOUNDS);
        }
    }

    let points: Vec<(i32, i32)> = overlay.trail.iter().copied().collect();
    for (age, pair) in points.windows(2).enumerate() {
        let thickness = trail_thickness(age, overlay.trail.capacity());
        thick_line(&mut canvas, pair[0], pair[1], thickness, TRAIL);
    }

    if let Some(center) = overlay.coordinate.position() {
        draw_filled_circle_mut(&mut canvas, center, 3, CENTROID);
        let label = format!("X, Y: ({}, {})", center.0, center.1);
        let y = height as i32 - 20;
        draw_text(&mut canvas, &label, 10, y, LABEL_SCALE, LABEL);
    }

    let direction = overlay.trail.direction();
    if !direction.is_empty() {
        draw_text(&mut canvas, &direction, 10, 30, LABEL_SCALE * 2, LABEL);
    }

    canvas
}

/// Zero the frame outside the bounds for the cropped display.
pub fn crop_display(frame: &GrayImage, bounds: Option<&Bounds>) -> GrayImage {
    let mut out = frame.clone();
    if let Some(bounds) = bounds {
        super::background::crop_to_bounds(&mut out, bounds);
    }
    out
}

fn centered_message(width: u32, height: u32, lines: &[&str], color: Rgb<u8>) -> RgbImage {
    let mut canvas = RgbImage::new(width, height);
    let scale = LABEL_SCALE;
    let line_h = text_height(scale) as i32 + 6;
    let block = line_h * lines.len() as i32;
    let mut y = (height as i32 - block) / 2;
    for line in lines {
        let x = (width as i32 - text_width(line, scale) as i32) / 2;
        draw_text(&mut canvas, line, x, y, scale, color);
        y += line_h;
    }
    canvas
}

/// Shown instead of stale video while the camera is gone.
pub fn camera_error_frame(width: u32, height: u32) -> RgbImage {
    centered_message(width, height, &["CAMERA ERROR.", "RECONNECT USB"], ERROR)
}

/// Placeholder queued for every calibration frame.
pub fn calibration_frame(width: u32, height: u32, accumulated: usize, total: usize) -> RgbImage {
    let progress = format!("({accumulated}/{total})");
    centered_message(
        width,
        height,
        &["ACQUIRING BACKGROUND", &progress],
        Rgb([255, 255, 255]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_render_marks_centroid_and_target() {
        let frame = GrayImage::from_pixel(160, 120, Luma([100]));
        let trail = Trail::new(32, 10, 20);
        let target = TargetParams {
            center: (40, 40),
            normalized_center: (0.25, 0.33),
            radius: 10,
        };
        let overlay = Overlay {
            coordinate: Coordinate::detected(100, 60),
            trail: &trail,
            target: Some(&target),
            bounds: None,
        };
        let out = render_tracked(&frame, &overlay);
        assert_eq!(out.dimensions(), (160, 120));
        assert_eq!(*out.get_pixel(100, 60), CENTROID);
        assert_eq!(*out.get_pixel(50, 40), TARGET);
        // background untouched away from the overlay
        assert_eq!(*out.get_pixel(150, 5), Rgb([100, 100, 100]));
        // source frame is not modified
        assert_eq!(frame.get_pixel(100, 60).0, [100]);
    }

    #[test]
    fn test_missing_coordinate_draws_no_centroid() {
        let frame = GrayImage::from_pixel(64, 48, Luma([80]));
        let trail = Trail::new(4, 2, 20);
        let overlay = Overlay {
            coordinate: Coordinate::MISSING,
            trail: &trail,
            target: None,
            bounds: None,
        };
        let out = render_tracked(&frame, &overlay);
        assert!(out.pixels().all(|p| *p == Rgb([80, 80, 80])));
    }

    #[test]
    fn test_trail_thins_with_age() {
        assert!(trail_thickness(0, 32) > trail_thickness(10, 32));
        assert_eq!(trail_thickness(0, 32), 14);
    }

    #[test]
    fn test_message_frames_have_text() {
        let error = camera_error_frame(640, 480);
        assert!(error.pixels().any(|p| *p == ERROR));
        let calibrating = calibration_frame(640, 480, 3, 20);
        assert!(calibrating.pixels().any(|p| *p == Rgb([255, 255, 255])));
    }
}
