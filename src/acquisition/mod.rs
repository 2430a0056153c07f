//! Acquisition unit: frame sources and the camera loop.

pub mod file;
pub mod synthetic;
pub mod unit;

pub use file::RawFileSource;
pub use synthetic::SyntheticSource;
pub use unit::{CameraHandles, CameraUnit};

use crate::error::SourceError;

/// A producer of grayscale frames. The camera driver boundary.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Live sources are reconnected while they are the active source.
    fn is_live(&self) -> bool;

    fn connect(&mut self) -> Result<(), SourceError>;

    fn is_connected(&self) -> bool;

    /// Fill `out` with the next frame.
    fn next_frame(&mut self, out: &mut [u8]) -> Result<(), SourceError>;

    fn close(&mut self);
}
