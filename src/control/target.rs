//! Target region containment.

use crate::config::ContainmentShape;
use crate::messages::{Coordinate, TargetParams};

/// The active target with the shape used for the containment test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetRegion {
    params: TargetParams,
    shape: ContainmentShape,
}

impl TargetRegion {
    pub fn new(params: TargetParams, shape: ContainmentShape) -> Self {
        Self { params, shape }
    }

    pub fn params(&self) -> &TargetParams {
        &self.params
    }

    pub fn set_radius(&mut self, radius: u32) {
        self.params.radius = radius;
    }

    /// Inclusive bounding square `(x1, x2, y1, y2)` of the target circle.
    pub fn perimeter(&self) -> (i32, i32, i32, i32) {
        let (cx, cy) = self.params.center;
        let r = self.params.radius as i32;
        (cx - r, cx + r, cy - r, cy + r)
    }

    /// A missing coordinate is never inside.
    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        let Some((x, y)) = coordinate.position() else {
            return false;
        };
        match self.shape {
            ContainmentShape::Square => {
                let (x1, x2, y1, y2) = self.perimeter();
                (x1..=x2).contains(&x) && (y1..=y2).contains(&y)
            }
            ContainmentShape::Circle => {
                let dx = i64::from(x - self.params.center.0);
                let dy = i64::from(y - self.params.center.1);
                let r = i64::from(self.params.radius);
                dx * dx + dy * dy <= r * r
            }
        }
    }
}
