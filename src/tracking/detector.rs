//! Background subtraction and blob selection.

use super::background::{crop_to_bounds, view};
use crate::config::TrackerConfig;
use crate::error::{AppResult, RigError};
use crate::messages::{Bounds, Coordinate};
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::distance_transform::Norm;
use imageproc::morphology;
use ndarray::Zip;

/// Below this the contour is treated as zero-area.
const DEGENERATE_AREA: f64 = 1e-9;

fn is_outer(contour: &Contour<i32>) -> bool {
    matches!(contour.border_type, BorderType::Outer) && contour.parent.is_none()
}

/// Detection parameters, taken from the tracker configuration.
#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    pub threshold_delta: u8,
    pub expected_area: f64,
    pub opening_radius: u8,
}

impl From<&TrackerConfig> for DetectorSettings {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            threshold_delta: config.threshold_delta,
            expected_area: config.expected_area,
            opening_radius: config.opening_radius,
        }
    }
}

/// Zeroth and first order moments of a closed polygon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolygonMoments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
}

impl PolygonMoments {
    /// Moments by Green's theorem over the contour's vertices.
    pub fn of(contour: &Contour<i32>) -> Self {
        let points = &contour.points;
        let (mut a, mut cx, mut cy) = (0.0, 0.0, 0.0);
        for (i, p) in points.iter().enumerate() {
            let q = &points[(i + 1) % points.len()];
            let (x0, y0) = (f64::from(p.x), f64::from(p.y));
            let (x1, y1) = (f64::from(q.x), f64::from(q.y));
            let cross = x0 * y1 - x1 * y0;
            a += cross;
            cx += (x0 + x1) * cross;
            cy += (y0 + y1) * cross;
        }
        Self {
            m00: a / 2.0,
            m10: cx / 6.0,
            m01: cy / 6.0,
        }
    }

    pub fn area(&self) -> f64 {
        self.m00.abs()
    }

    /// Centroid, or `None` for a zero-area contour.
    pub fn centroid(&self) -> Option<(i32, i32)> {
        if self.m00.abs() < DEGENERATE_AREA {
            return None;
        }
        Some((
            (self.m10 / self.m00).round() as i32,
            (self.m01 / self.m00).round() as i32,
        ))
    }
}

/// Result of processing one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub coordinate: Coordinate,
    /// Area of the selected contour
    pub area: Option<f64>,
    pub candidates: usize,
}

impl Detection {
    fn nothing(candidates: usize) -> Self {
        Self {
            coordinate: Coordinate::MISSING,
            area: None,
            candidates,
        }
    }
}

/// Binary mask of pixels differing from the background by more than `delta`.
pub fn foreground_mask(frame: &GrayImage, background: &GrayImage, delta: u8) -> AppResult<GrayImage> {
    if frame.dimensions() != background.dimensions() {
        return Err(RigError::Processing(format!(
            "frame is {:?} but background is {:?}",
            frame.dimensions(),
            background.dimensions()
        )));
    }
    let (width, height) = frame.dimensions();
    let mut mask = GrayImage::new(width, height);
    {
        let frame = view(frame)?;
        let background = view(background)?;
        let (w, h) = (width as usize, height as usize);
        let mut out = ndarray::ArrayViewMut2::from_shape((h, w), &mut *mask)
            .map_err(|e| RigError::Processing(e.to_string()))?;
        Zip::from(&mut out)
            .and(&frame)
            .and(&background)
            .for_each(|m, &f, &b| *m = if f.abs_diff(b) > delta { 255 } else { 0 });
    }
    Ok(mask)
}

/// Pick the outer contour whose area is closest to `expected_area`.
pub fn select_candidate(contours: &[Contour<i32>], expected_area: f64) -> Option<PolygonMoments> {
    contours
        .iter()
        .filter(|c| is_outer(c))
        .map(PolygonMoments::of)
        .min_by(|a, b| {
            let da = (a.area() - expected_area).abs();
            let db = (b.area() - expected_area).abs();
            da.total_cmp(&db)
        })
}

/// Locate the subject in `frame` against `background`.
///
/// Both images are zeroed outside `bounds` first, so nothing outside the
/// bounds can produce a candidate.
pub fn detect(
    frame: &GrayImage,
    background: &GrayImage,
    bounds: Option<&Bounds>,
    settings: &DetectorSettings,
) -> AppResult<Detection> {
    let mask = match bounds {
        Some(bounds) => {
            let mut frame = frame.clone();
            crop_to_bounds(&mut frame, bounds);
            let mut background = background.clone();
            crop_to_bounds(&mut background, bounds);
            foreground_mask(&frame, &background, settings.threshold_delta)?
        }
        None => foreground_mask(frame, background, settings.threshold_delta)?,
    };
    let opened = morphology::open(&mask, Norm::L2, settings.opening_radius);
    let contours = find_contours::<i32>(&opened);
    let outer = contours
        .iter()
        .filter(|c| is_outer(c))
        .count();

    let Some(moments) = select_candidate(&contours, settings.expected_area) else {
        return Ok(Detection::nothing(outer));
    };
    match moments.centroid() {
        Some((x, y)) => Ok(Detection {
            coordinate: Coordinate::detected(x, y),
            area: Some(moments.area()),
            candidates: outer,
        }),
        None => {
            tracing::trace!("Selected contour has zero area");
            Ok(Detection::nothing(outer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::point::Point;

    const LIT: u8 = 200;
    const DARK: u8 = 40;

    fn settings() -> DetectorSettings {
        DetectorSettings {
            threshold_delta: 30,
            expected_area: 350.0,
            opening_radius: 2,
        }
    }

    fn square(image: &mut GrayImage, x0: u32, y0: u32, side: u32) {
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                image.put_pixel(x, y, Luma([DARK]));
            }
        }
    }

    #[test]
    fn test_single_blob_is_selected() {
        let background = GrayImage::from_pixel(160, 120, Luma([LIT]));
        let mut frame = background.clone();
        // 21 px side: border polygon is 20x20 less the corners rounded off by the opening
        square(&mut frame, 100, 50, 21);

        let detection = detect(&frame, &background, None, &settings()).unwrap();
        assert_eq!(detection.coordinate, Coordinate::detected(110, 60));
        assert_eq!(detection.candidates, 1);
        let area = detection.area.unwrap();
        assert!(area > 380.0 && area <= 400.0, "area {area}");
    }

    #[test]
    fn test_blob_closest_to_expected_area_wins() {
        let background = GrayImage::from_pixel(200, 160, Luma([LIT]));
        let mut frame = background.clone();
        square(&mut frame, 10, 10, 19);
        // large artifact
        square(&mut frame, 100, 60, 70);

        let detection = detect(&frame, &background, None, &settings()).unwrap();
        assert_eq!(detection.candidates, 2);
        assert_eq!(detection.coordinate, Coordinate::detected(19, 19));
    }

    #[test]
    fn test_speckle_is_removed_and_empty_frame_gives_missing() {
        let background = GrayImage::from_pixel(64, 64, Luma([LIT]));
        let mut frame = background.clone();
        frame.put_pixel(30, 30, Luma([0]));
        frame.put_pixel(31, 30, Luma([0]));

        let detection = detect(&frame, &background, None, &settings()).unwrap();
        assert!(detection.coordinate.is_missing());
        assert_eq!(detection.candidates, 0);

        let detection = detect(&background, &background, None, &settings()).unwrap();
        assert!(detection.coordinate.is_missing());
    }

    #[test]
    fn test_blob_outside_bounds_is_ignored() {
        let background = GrayImage::from_pixel(160, 120, Luma([LIT]));
        let mut frame = background.clone();
        square(&mut frame, 100, 50, 21);

        let bounds = Bounds::from_points((0, 0), (80, 120));
        let detection = detect(&frame, &background, Some(&bounds), &settings()).unwrap();
        assert!(detection.coordinate.is_missing());
    }

    #[test]
    fn test_degenerate_contour_has_no_centroid() {
        let contour = Contour {
            points: vec![Point::new(5, 5)],
            border_type: BorderType::Outer,
            parent: None,
        };
        let moments = select_candidate(&[contour], 350.0).unwrap();
        assert_eq!(moments.area(), 0.0);
        assert_eq!(moments.centroid(), None);

        let line = Contour {
            points: vec![Point::new(0, 0), Point::new(4, 0)],
            border_type: BorderType::Outer,
            parent: None,
        };
        assert_eq!(PolygonMoments::of(&line).centroid(), None);
    }

    #[test]
    fn test_mask_uses_absolute_difference() {
        let background = GrayImage::from_pixel(3, 1, Luma([100]));
        let mut frame = background.clone();
        frame.put_pixel(0, 0, Luma([150]));
        frame.put_pixel(1, 0, Luma([50]));
        frame.put_pixel(2, 0, Luma([120]));
        let mask = foreground_mask(&frame, &background, 30).unwrap();
        assert_eq!(mask.as_raw(), &vec![255, 255, 0]);
    }
}
