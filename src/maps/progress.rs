//! Trial progress strip.
//!
//! Rows, top to bottom: elapsed clock that follows the cursor, the cursor
//! track with in-target (green) and stimulus (red) marks, a time axis, and a
//! legend with dwell clocks and counters.

use crate::glyphs::{draw_text, format_clock, text_width};
use image::{Rgb, RgbImage};

pub const PROGRESS_HEIGHT: u32 = 98;

const CLOCK_Y: i32 = 5;
const TRACK: (u32, u32) = (20, 60);
const TARGET_TRACK: (u32, u32) = (20, 40);
const STIM_TRACK: (u32, u32) = (40, 60);
const AXIS_ROW: u32 = 61;
const LEGEND_ROWS: (u32, u32) = (80, 95);
const LEGEND_TEXT_Y: i32 = 83;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

const RED: usize = 0;
const GREEN: usize = 1;
const BLUE: usize = 2;

/// Values shown by one progress update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSample {
    pub elapsed: f64,
    pub in_target: bool,
    pub receiving_stim: bool,
    pub in_target_secs: f64,
    pub stim_secs: f64,
    pub entries: u32,
    pub stims: u32,
}

#[derive(Debug, Clone)]
pub struct ProgressBar {
    tracks: RgbImage,
    duration: f64,
    cursor: Option<u32>,
    last: ProgressSample,
}

impl ProgressBar {
    pub fn new(width: u32, duration_secs: f64) -> Self {
        let mut bar = Self {
            tracks: RgbImage::new(width, PROGRESS_HEIGHT),
            duration: duration_secs,
            cursor: None,
            last: ProgressSample::default(),
        };
        bar.reset();
        bar
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Change the trial length the strip spans and blank it.
    pub fn set_duration(&mut self, duration_secs: f64) {
        self.duration = duration_secs;
        self.reset();
    }

    /// Whether the cursor reached the end of the strip.
    pub fn is_finished(&self, elapsed: f64) -> bool {
        elapsed >= self.duration
    }

    fn width(&self) -> u32 {
        self.tracks.width()
    }

    fn set_channel(&mut self, cols: std::ops::Range<u32>, rows: (u32, u32), channel: usize, value: u8) {
        let width = self.width();
        for x in cols.start.min(width)..cols.end.min(width) {
            for y in rows.0..rows.1 {
                self.tracks.get_pixel_mut(x, y).0[channel] = value;
            }
        }
    }

    /// Blank strip with the time axis and legend.
    pub fn reset(&mut self) {
        self.tracks.fill(0);
        self.cursor = None;
        self.last = ProgressSample::default();
        let width = self.width();

        self.set_channel(0..1, TRACK, BLUE, 255);
        for x in 0..width {
            self.tracks.put_pixel(x, AXIS_ROW, WHITE);
        }

        let chunks = ((self.duration / 30.0) as u32).clamp(2, 12);
        let segment = width / chunks;
        let chunk_secs = self.duration / f64::from(chunks);
        for i in 1..chunks {
            let loc = segment * i;
            for y in AXIS_ROW + 1..AXIS_ROW + 4 {
                self.tracks.put_pixel(loc.saturating_sub(1), y, WHITE);
            }
            let label = format_clock(chunk_secs * f64::from(i), false);
            let x = loc as i32 - text_width(&label, 1) as i32 / 2;
            draw_text(&mut self.tracks, &label, x, 67, 1, WHITE);
        }

        let half = width / 2;
        for y in LEGEND_ROWS.0 - 1..LEGEND_ROWS.1 + 1 {
            self.tracks.put_pixel(half.saturating_sub(1), y, WHITE);
        }
        self.set_channel(3..18, LEGEND_ROWS, GREEN, 255);
        self.set_channel(half + 3..half + 18, LEGEND_ROWS, RED, 255);
    }

    /// Advance to `sample.elapsed` and mark the tracks.
    pub fn update(&mut self, sample: ProgressSample) {
        let width = self.width();
        let fraction = if self.duration > 0.0 {
            sample.elapsed / self.duration
        } else {
            1.0
        };
        let loc = ((fraction * f64::from(width)) as u32).min(width);
        let column = loc.saturating_sub(1)..loc.max(1);

        if sample.in_target {
            self.set_channel(column.clone(), TARGET_TRACK, GREEN, 255);
        }
        if sample.receiving_stim {
            self.set_channel(column, STIM_TRACK, RED, 255);
        }
        if self.cursor != Some(loc) {
            if let Some(old) = self.cursor {
                self.set_channel(old.saturating_sub(1)..old.saturating_add(1), TRACK, BLUE, 0);
            }
            self.set_channel(loc.saturating_sub(1)..loc + 1, TRACK, BLUE, 255);
            self.cursor = Some(loc);
        }
        self.last = sample;
    }

    /// Current strip with clocks and counters.
    pub fn render(&self) -> RgbImage {
        let mut image = self.tracks.clone();
        let width = self.width() as i32;
        let sample = &self.last;

        let clock = format_clock(sample.elapsed, true);
        let clock_w = text_width(&clock, 2) as i32;
        let cursor = self.cursor.unwrap_or(0) as i32;
        let x = (cursor - clock_w / 2).clamp(0, (width - clock_w).max(0));
        draw_text(&mut image, &clock, x, CLOCK_Y, 2, WHITE);

        let half = width / 2;
        let target = format!(
            "IN REGION: {} (# ENTRIES: {})",
            format_clock(sample.in_target_secs, true),
            sample.entries
        );
        draw_text(&mut image, &target, 22, LEGEND_TEXT_Y, 1, WHITE);
        let stim = format!(
            "GET STIM: {} (# STIMS: {})",
            format_clock(sample.stim_secs, true),
            sample.stims
        );
        draw_text(&mut image, &stim, half + 22, LEGEND_TEXT_Y, 1, WHITE);
        image
    }
}

/// Replaces the strip while the stimulus device is unreachable.
pub fn device_error_image(width: u32) -> RgbImage {
    let mut image = RgbImage::new(width, PROGRESS_HEIGHT);
    let text = "STIMULUS DEVICE ERROR. RECONNECT DEVICE";
    let x = (width as i32 - text_width(text, 2) as i32) / 2;
    draw_text(&mut image, text, x, 44, 2, WHITE);
    image
}
