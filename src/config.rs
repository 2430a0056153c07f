//! Rig configuration using Figment.
//!
//! Configuration is layered, lowest to highest precedence:
//! 1. Built-in defaults (`RigConfig::default()`)
//! 2. A TOML file (normally `config/rig.toml`)
//! 3. Environment variables prefixed with `RIG_`, using `__` between sections
//!
//! ```text
//! RIG_APPLICATION__LOG_LEVEL=debug
//! RIG_TRACKER__THRESHOLD_DELTA=40
//! RIG_BARRIER__ACK_TIMEOUT="10s"
//! ```
//!
//! Durations are written in humantime notation (`500ms`, `1s`, `30s`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub application: ApplicationConfig,
    pub frames: FrameConfig,
    pub bus: BusConfig,
    pub barrier: BarrierConfig,
    pub camera: CameraConfig,
    pub tracker: TrackerConfig,
    pub stimulus: StimulusConfig,
    pub maps: MapConfig,
    pub recorder: RecorderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory that receives trial outputs
    pub output_dir: PathBuf,
    /// Time allowed for all units to close after `Exit`
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Closed-Loop Rig".to_string(),
            log_level: "info".to_string(),
            output_dir: PathBuf::from("trials"),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Shape of the camera frame and location of the frame channel backing files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub rows: u32,
    pub cols: u32,
    /// Directory for the memory-mapped channel files; a fresh temp dir when unset
    pub channel_dir: Option<PathBuf>,
    /// Sleep between checks when spinning on a frame channel
    #[serde(with = "humantime_serde")]
    pub spin_interval: Duration,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            rows: 480,
            cols: 640,
            channel_dir: None,
            spin_interval: Duration::from_millis(1),
        }
    }
}

/// Command polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    /// Sleep after an empty poll inside a unit
    #[serde(with = "humantime_serde")]
    pub unit_idle: Duration,
    /// Sleep after an empty poll inside the router
    #[serde(with = "humantime_serde")]
    pub router_idle: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            unit_idle: Duration::from_millis(30),
            router_idle: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    /// Upper bound on acknowledgment collection; `None` waits forever
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Option<Duration>,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Which frame source the camera unit starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Synthetic,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub source: SourceKind,
    /// Recording replayed when `source = "file"`
    pub video_path: Option<PathBuf>,
    pub framerate: f64,
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Sleep after a file source runs out of frames
    #[serde(with = "humantime_serde")]
    pub exhausted_retry: Duration,
    /// Seed for the synthetic subject's motion
    pub seed: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Synthetic,
            video_path: None,
            framerate: 15.0,
            reconnect_interval: Duration::from_millis(500),
            exhausted_retry: Duration::from_millis(100),
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Frames averaged into a background
    pub calibration_frames: usize,
    /// Minimum absolute difference from background counted as foreground
    pub threshold_delta: u8,
    /// Contour area the subject is expected to cover, in pixels
    pub expected_area: f64,
    /// Radius of the disk used for the morphological opening
    pub opening_radius: u8,
    pub trail_capacity: usize,
    /// Samples between the two trail points compared for the direction label
    pub direction_lookback: usize,
    /// Per-axis displacement in pixels before a direction is reported
    pub direction_threshold: i32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            calibration_frames: 20,
            threshold_delta: 30,
            expected_area: 350.0,
            opening_radius: 2,
            trail_capacity: 32,
            direction_lookback: 10,
            direction_threshold: 20,
        }
    }
}

/// Region test used for the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainmentShape {
    /// Axis-aligned square circumscribing the target circle
    #[default]
    Square,
    Circle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    /// Pulse length
    #[serde(with = "humantime_serde")]
    pub on_duration: Duration,
    /// Full duty cycle length, pulse included
    #[serde(with = "humantime_serde")]
    pub cycle_duration: Duration,
    pub containment: ContainmentShape,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub stimulus_pin: u8,
    pub status_pin: u8,
    /// Serial port of the pin board; the mock device is used when unset
    pub port: Option<String>,
    pub baud_rate: u32,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            on_duration: Duration::from_millis(400),
            cycle_duration: Duration::from_millis(1000),
            containment: ContainmentShape::Square,
            heartbeat_interval: Duration::from_secs(1),
            stimulus_pin: 6,
            status_pin: 13,
            port: None,
            baud_rate: 57_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub heatmap_rows: u32,
    pub heatmap_cols: u32,
    /// Live maps are rendered at frame size divided by this factor
    pub downscale: u32,
    pub gradient_height: u32,
    pub gradient_steps: u32,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            heatmap_rows: 12,
            heatmap_cols: 16,
            downscale: 2,
            gradient_height: 100,
            gradient_steps: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub framerate: f64,
    /// Writer worker queue timeout
    #[serde(with = "humantime_serde")]
    pub worker_timeout: Duration,
    pub raw_suffix: String,
    pub processed_suffix: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            framerate: 15.0,
            worker_timeout: Duration::from_millis(500),
            raw_suffix: "_raw.frames".to_string(),
            processed_suffix: "_processed.frames".to_string(),
        }
    }
}

impl RigConfig {
    /// Load configuration from `config/rig.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/rig.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment overrides still
    /// apply. The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RIG_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.frames.rows == 0 || self.frames.cols == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Frame shape {}x{} must be non-empty",
                self.frames.rows, self.frames.cols
            )));
        }

        if self.bus.poll_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "bus.poll_timeout must be greater than zero".to_string(),
            ));
        }

        if let Some(timeout) = self.barrier.ack_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::ValidationError(
                    "barrier.ack_timeout must be greater than zero (omit it to wait forever)"
                        .to_string(),
                ));
            }
        }

        if self.camera.source == SourceKind::File && self.camera.video_path.is_none() {
            return Err(ConfigError::ValidationError(
                "camera.source = \"file\" requires camera.video_path".to_string(),
            ));
        }

        if !(self.camera.framerate > 0.0) || !(self.recorder.framerate > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Framerates must be positive (camera {}, recorder {})",
                self.camera.framerate, self.recorder.framerate
            )));
        }

        if self.tracker.calibration_frames == 0 {
            return Err(ConfigError::ValidationError(
                "tracker.calibration_frames must be at least 1".to_string(),
            ));
        }

        if self.tracker.direction_lookback == 0
            || self.tracker.direction_lookback >= self.tracker.trail_capacity
        {
            return Err(ConfigError::ValidationError(format!(
                "tracker.direction_lookback {} must be within 1..{} (trail_capacity)",
                self.tracker.direction_lookback, self.tracker.trail_capacity
            )));
        }

        if self.stimulus.on_duration >= self.stimulus.cycle_duration {
            return Err(ConfigError::ValidationError(format!(
                "stimulus.on_duration {:?} must be shorter than cycle_duration {:?}",
                self.stimulus.on_duration, self.stimulus.cycle_duration
            )));
        }

        if self.stimulus.stimulus_pin == self.stimulus.status_pin {
            return Err(ConfigError::ValidationError(format!(
                "stimulus_pin and status_pin must differ (both {})",
                self.stimulus.stimulus_pin
            )));
        }

        if self.maps.downscale == 0
            || self.maps.heatmap_rows == 0
            || self.maps.heatmap_cols == 0
            || self.maps.gradient_steps < 2
        {
            return Err(ConfigError::ValidationError(
                "maps: downscale, heatmap_rows and heatmap_cols must be non-zero and gradient_steps at least 2"
                    .to_string(),
            ));
        }

        if self.frames.rows / self.maps.downscale < self.maps.heatmap_rows
            || self.frames.cols / self.maps.downscale < self.maps.heatmap_cols
        {
            return Err(ConfigError::ValidationError(format!(
                "Heatmap grid {}x{} does not fit the downscaled frame",
                self.maps.heatmap_rows, self.maps.heatmap_cols
            )));
        }

        Ok(())
    }
}
