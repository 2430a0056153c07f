//! Trial output files with clean feature flag handling.
//!
//! - `<name>_Coords.csv`: target preamble plus one row per tracked frame
//! - `<name>_Heatmap.png`, `<name>_Path.png`: full-resolution summary images
//! - `<name>_bg_w_bounds.png`, `<name>_bg_original.png`: background archive
//! - `<name><suffix>` + `<name><suffix>.json`: raw frame recordings and sidecar
use crate::frame::FrameShape;
use crate::messages::{BackgroundPair, TargetParams};
use anyhow::{Context, Result};
use image::{GrayImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One row of the per-frame trial log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Seconds since barrier release
    pub elapsed: f64,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub in_target: bool,
    pub entry_count: u32,
    /// Seconds spent inside the target during the current entry
    pub entry_dwell: f64,
    /// Seconds spent inside the target this trial
    pub dwell_in_target: f64,
    pub receiving_stim: bool,
    pub stim_count: u32,
    pub dwell_stim: f64,
}

/// Path of a named trial artifact inside `dir`.
pub fn trial_path(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{name}{suffix}"))
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory at {:?}", dir))?;
    }
    Ok(())
}

pub fn save_gray_png(path: &Path, image: &GrayImage) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("Failed to write PNG at {:?}", path))
}

pub fn save_rgb_png(path: &Path, image: &RgbImage) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("Failed to write PNG at {:?}", path))
}

/// Write the bounded and original backgrounds next to the trial outputs.
pub fn archive_backgrounds(dir: &Path, name: &str, pair: &BackgroundPair) -> Result<()> {
    ensure_dir(dir)?;
    save_gray_png(&trial_path(dir, name, "_bg_w_bounds.png"), &pair.bounded)?;
    save_gray_png(&trial_path(dir, name, "_bg_original.png"), &pair.original)?;
    tracing::info!(dir = %dir.display(), name, "Archived backgrounds");
    Ok(())
}

// ============================================================================
// Coordinates CSV
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;

    const PREAMBLE: [&str; 5] = [
        "Target Region X",
        "Target Region Y",
        "Target Region Radius",
        "Normalized X",
        "Normalized Y",
    ];

    const COLUMNS: [&str; 10] = [
        "Total Time Elapsed (s)",
        "X",
        "Y",
        "In Target",
        "Num Entries",
        "Time in Target (s)",
        "Total Time in Target (s)",
        "Get Stim",
        "Num Stimulations",
        "Total Stim Time (s)",
    ];

    fn secs(value: f64) -> String {
        format!("{:.3}", value)
    }

    fn opt(value: Option<i32>) -> String {
        value.map_or_else(|| "None".to_string(), |v| v.to_string())
    }

    /// Write `<name>_Coords.csv` into `dir`.
    pub fn write_coords_csv(
        dir: &Path,
        name: &str,
        target: Option<&TargetParams>,
        records: &[TrialRecord],
    ) -> Result<PathBuf> {
        ensure_dir(dir)?;
        let path = trial_path(dir, name, "_Coords.csv");
        let file = File::create(&path)
            .with_context(|| format!("Failed to create CSV file at {:?}", path))?;
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(BufWriter::new(file));

        writer
            .write_record(PREAMBLE)
            .context("Failed to write target preamble")?;
        let target_row = match target {
            Some(t) => vec![
                t.center.0.to_string(),
                t.center.1.to_string(),
                t.radius.to_string(),
                format!("{:.4}", t.normalized_center.0),
                format!("{:.4}", t.normalized_center.1),
            ],
            None => vec!["None".to_string(); PREAMBLE.len()],
        };
        writer
            .write_record(&target_row)
            .context("Failed to write target preamble")?;

        writer
            .write_record(COLUMNS)
            .context("Failed to write CSV header")?;
        for record in records {
            writer
                .write_record(&[
                    secs(record.elapsed),
                    opt(record.x),
                    opt(record.y),
                    record.in_target.to_string(),
                    record.entry_count.to_string(),
                    secs(record.entry_dwell),
                    secs(record.dwell_in_target),
                    record.receiving_stim.to_string(),
                    record.stim_count.to_string(),
                    secs(record.dwell_stim),
                ])
                .context("Failed to write trial record")?;
        }
        writer.flush().context("Failed to flush CSV writer")?;
        tracing::info!(path = %path.display(), rows = records.len(), "Wrote coordinates CSV");
        Ok(path)
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::RigError;

    pub fn write_coords_csv(
        _dir: &Path,
        _name: &str,
        _target: Option<&TargetParams>,
        _records: &[TrialRecord],
    ) -> Result<PathBuf> {
        Err(RigError::FeatureNotEnabled("storage_csv".to_string()).into())
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::write_coords_csv;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::write_coords_csv;

// ============================================================================
// Raw frame recordings
// ============================================================================

/// JSON sidecar describing a raw recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub rows: u32,
    pub cols: u32,
    pub channels: u32,
    pub framerate: f64,
    pub frame_count: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl RecordingMeta {
    pub fn shape(&self) -> FrameShape {
        FrameShape {
            rows: self.rows,
            cols: self.cols,
            channels: self.channels,
        }
    }

    pub fn sidecar_path(data_path: &Path) -> PathBuf {
        let mut name = data_path.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }

    /// Read the sidecar belonging to the recording at `data_path`.
    pub fn load(data_path: &Path) -> Result<Self> {
        let sidecar = Self::sidecar_path(data_path);
        let text = std::fs::read_to_string(&sidecar)
            .with_context(|| format!("Failed to read recording sidecar {:?}", sidecar))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse recording sidecar {:?}", sidecar))
    }
}

/// Headerless frame-after-frame writer.
pub struct RawVideoSink {
    path: PathBuf,
    writer: BufWriter<File>,
    meta: RecordingMeta,
}

impl RawVideoSink {
    pub fn create(path: &Path, shape: FrameShape, framerate: f64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create recording at {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            meta: RecordingMeta {
                rows: shape.rows,
                cols: shape.cols,
                channels: shape.channels,
                framerate,
                frame_count: 0,
                started_at: chrono::Utc::now(),
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> u64 {
        self.meta.frame_count
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let expected = self.meta.shape().len();
        if frame.len() != expected {
            anyhow::bail!(
                "Frame has {} bytes, recording expects {}",
                frame.len(),
                expected
            );
        }
        self.writer
            .write_all(frame)
            .with_context(|| format!("Failed to append frame to {:?}", self.path))?;
        self.meta.frame_count += 1;
        Ok(())
    }

    /// Flush the frames and write the sidecar.
    pub fn finish(mut self) -> Result<RecordingMeta> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush recording {:?}", self.path))?;
        let sidecar = RecordingMeta::sidecar_path(&self.path);
        let json = serde_json::to_string_pretty(&self.meta)
            .context("Failed to serialize recording metadata")?;
        std::fs::write(&sidecar, json)
            .with_context(|| format!("Failed to write recording sidecar {:?}", sidecar))?;
        tracing::info!(
            path = %self.path.display(),
            frames = self.meta.frame_count,
            "Recording closed"
        );
        Ok(self.meta)
    }
}
