//! Subject tracking.
//!
//! Per run the tracker moves NO_BACKGROUND -> CALIBRATING -> TRACKING. A
//! recalibration request or a bounds change drops the background and starts
//! over.

pub mod background;
pub mod detector;
pub mod overlay;
pub mod trail;
pub mod unit;

pub use background::{BackgroundModel, Calibration};
pub use detector::{detect, Detection, DetectorSettings, PolygonMoments};
pub use trail::Trail;
pub use unit::{TrackerHandles, TrackerUnit, TrackerView};
