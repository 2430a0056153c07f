//! Bounded history of recent positions and the motion direction derived from it.

use std::collections::VecDeque;

/// Recent non-null positions, newest first.
#[derive(Debug, Clone)]
pub struct Trail {
    points: VecDeque<(i32, i32)>,
    capacity: usize,
    lookback: usize,
    threshold: i32,
}

impl Trail {
    /// `lookback` is clamped below `capacity` so the older sample fits in the trail.
    pub fn new(capacity: usize, lookback: usize, threshold: i32) -> Self {
        let capacity = capacity.max(2);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            lookback: lookback.clamp(1, capacity - 1),
            threshold,
        }
    }

    pub fn push(&mut self, point: (i32, i32)) {
        if self.points.len() == self.capacity {
            self.points.pop_back();
        }
        self.points.push_front(point);
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Points from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &(i32, i32)> {
        self.points.iter()
    }

    /// Movement from the point `lookback` samples before the newest one to the
    /// newest one, i.e. `points[0] - points[lookback]`. `None` until the trail
    /// holds `lookback + 1` points.
    pub fn displacement(&self) -> Option<(i32, i32)> {
        let newest = self.points.front()?;
        let older = self.points.get(self.lookback)?;
        Some((newest.0 - older.0, newest.1 - older.1))
    }

    /// Label such as `"Right"`, `"Up"` or `"Right-Down"`; empty when not moving.
    pub fn direction(&self) -> String {
        let Some((dx, dy)) = self.displacement() else {
            return String::new();
        };
        // image rows grow downwards
        let horizontal = if dx.abs() > self.threshold {
            if dx > 0 { "Right" } else { "Left" }
        } else {
            ""
        };
        let vertical = if dy.abs() > self.threshold {
            if dy > 0 { "Down" } else { "Up" }
        } else {
            ""
        };
        match (horizontal.is_empty(), vertical.is_empty()) {
            (false, false) => format!("{horizontal}-{vertical}"),
            (false, true) => horizontal.to_string(),
            (true, false) => vertical.to_string(),
            (true, true) => String::new(),
        }
    }
}
