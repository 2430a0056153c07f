//! Message types for unit-to-unit communication.
//!
//! Every unit sends [`Envelope`]s upstream to the router. The router owns the
//! exhaustive translation from [`Command`] into the typed inbound command of
//! each destination unit ([`CameraCommand`], [`TrackerCommand`],
//! [`StatsCommand`], [`RecorderCommand`]), so a unit can only ever receive the
//! kinds it handles.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Names of the independently scheduled units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitName {
    Camera,
    Tracker,
    Statistics,
    RawRecorder,
    ProcessedRecorder,
    Gui,
}

impl UnitName {
    /// Units that run on the trial clock and take part in the start barrier.
    pub const TRIAL_PARTICIPANTS: [UnitName; 3] = [
        UnitName::Statistics,
        UnitName::ProcessedRecorder,
        UnitName::RawRecorder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitName::Camera => "camera",
            UnitName::Tracker => "tracker",
            UnitName::Statistics => "statistics",
            UnitName::RawRecorder => "raw_recorder",
            UnitName::ProcessedRecorder => "processed_recorder",
            UnitName::Gui => "gui",
        }
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and length of one trial. Immutable for the trial's lifetime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialParameters {
    pub name: String,
    pub duration_seconds: f64,
}

impl TrialParameters {
    pub fn new(name: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            name: name.into(),
            duration_seconds,
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.duration_seconds.max(0.0))
    }
}

/// Subject position for one tracked frame; both fields are `None` when nothing
/// was detected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: Option<i32>,
    pub y: Option<i32>,
}

impl Coordinate {
    pub const MISSING: Coordinate = Coordinate { x: None, y: None };

    pub fn detected(x: i32, y: i32) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
        }
    }

    pub fn position(&self) -> Option<(i32, i32)> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.position().is_none()
    }
}

/// Tracking bounds as two corner points in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub top_left: (u32, u32),
    pub bottom_right: (u32, u32),
}

impl Bounds {
    /// Builds bounds from any two opposite corners.
    pub fn from_points(a: (u32, u32), b: (u32, u32)) -> Self {
        Self {
            top_left: (a.0.min(b.0), a.1.min(b.1)),
            bottom_right: (a.0.max(b.0), a.1.max(b.1)),
        }
    }

    /// Whether the pixel at column `x`, row `y` lies inside the bounds.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.top_left.0 && x < self.bottom_right.0 && y >= self.top_left.1 && y < self.bottom_right.1
    }
}

/// Target region as configured from the user interface.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetParams {
    pub center: (i32, i32),
    pub normalized_center: (f64, f64),
    pub radius: u32,
}

/// Background archive published after calibration or bounds changes.
#[derive(Clone, Debug)]
pub struct BackgroundPair {
    pub bounded: Arc<GrayImage>,
    pub original: Arc<GrayImage>,
}

/// The closed set of commands exchanged through the router.
#[derive(Clone, Debug)]
pub enum Command {
    Start(TrialParameters),
    Stop,
    Exit,
    SetBounds(Option<Bounds>),
    SetTime(f64),
    GetBackground,
    ClearMaps,
    SetVideoSource(Option<PathBuf>),
    DrawTarget(Option<TargetParams>),
    SetTargetRadius(u32),
    NewBackground(BackgroundPair),
    ToggleManual,
    SendStimulus,
    ShowTracked,
    Error { destination: UnitName, reason: String },
    Saving,
    Finished,
    Started,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Start(_) => "start",
            Command::Stop => "stop",
            Command::Exit => "exit",
            Command::SetBounds(_) => "set_bounds",
            Command::SetTime(_) => "set_time",
            Command::GetBackground => "get_background",
            Command::ClearMaps => "clear_maps",
            Command::SetVideoSource(_) => "set_video_source",
            Command::DrawTarget(_) => "draw_target",
            Command::SetTargetRadius(_) => "set_target_radius",
            Command::NewBackground(_) => "new_background",
            Command::ToggleManual => "toggle_manual",
            Command::SendStimulus => "send_stimulus",
            Command::ShowTracked => "show_tracked",
            Command::Error { .. } => "error",
            Command::Saving => "saving",
            Command::Finished => "finished",
            Command::Started => "started",
        }
    }
}

/// A command tagged with the unit that sent it (`None` for the user interface).
#[derive(Clone, Debug)]
pub struct Envelope {
    pub origin: Option<UnitName>,
    pub command: Command,
}

impl Envelope {
    pub fn new(origin: Option<UnitName>, command: Command) -> Self {
        Self { origin, command }
    }

    pub fn from_unit(origin: UnitName, command: Command) -> Self {
        Self::new(Some(origin), command)
    }

    pub fn from_gui(command: Command) -> Self {
        Self::new(None, command)
    }
}

/// Inbound commands of the acquisition unit.
#[derive(Clone, Debug)]
pub enum CameraCommand {
    SetVideoSource(Option<PathBuf>),
    Exit,
}

/// Inbound commands of the tracking unit.
#[derive(Clone, Debug)]
pub enum TrackerCommand {
    SetBounds(Option<Bounds>),
    ShowTracked,
    GetBackground,
    DrawTarget(Option<TargetParams>),
    SetTargetRadius(u32),
    ShowError,
    Exit,
}

/// Inbound commands of the statistics and closed-loop unit.
#[derive(Clone, Debug)]
pub enum StatsCommand {
    Start(TrialParameters),
    Stop,
    SetTime(f64),
    ClearMaps,
    DrawTarget(Option<TargetParams>),
    SetTargetRadius(u32),
    ToggleManual,
    SendStimulus,
    Exit,
}

/// Inbound commands of a video recorder unit.
#[derive(Clone, Debug)]
pub enum RecorderCommand {
    Start(TrialParameters),
    Stop,
    Exit,
}
