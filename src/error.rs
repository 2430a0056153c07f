//! Custom error types for the rig.
//!
//! `RigError` is the crate-wide error. The narrower enums (`FrameError`,
//! `BarrierError`, `DeviceError`, `SourceError`) belong to the primitives that
//! produce them and convert into `RigError` with `?`.
//!
//! ## Error Taxonomy
//!
//! - **Hardware-transient** (`Device`, `Source`): camera or serial failures. Units
//!   recover locally by flipping a connected flag and retrying; never fatal.
//! - **Protocol violation** (`Frame`): writing to a full `FrameChannel` or
//!   reading an empty one. A programming error that the gated call sites
//!   prevent; surfacing it means a caller bypassed `may_write`/`may_read`.
//! - **Barrier** (`Barrier`): acknowledgment timeout or a cancelled trial start.
//! - **Lifecycle** (`ChannelClosed`, `ShutdownTimeout`): a unit went away or did
//!   not close within the grace period.

use crate::messages::UnitName;
use thiserror::Error;

/// Convenience alias for results using the rig error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame channel error: {0}")]
    Frame(#[from] FrameError),

    #[error("Start barrier error: {0}")]
    Barrier(#[from] BarrierError),

    #[error("Stimulus device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Frame source error: {0}")]
    Source(#[from] SourceError),

    #[error("Image processing error: {0}")]
    Processing(String),

    #[error("Command channel to {0} is closed")]
    ChannelClosed(UnitName),

    #[error("Router queue is closed")]
    RouterClosed,

    #[error("Units failed to close within {grace:?}: {units:?}")]
    ShutdownTimeout {
        grace: std::time::Duration,
        units: Vec<UnitName>,
    },

    #[error("Export failed: {0}")]
    Export(#[from] anyhow::Error),

    #[error("Feature '{0}' is not enabled in this build")]
    FeatureNotEnabled(String),
}

/// Errors raised by the single-slot frame channel.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame slot still holds an unread frame")]
    SlotOccupied,

    #[error("Frame slot is empty")]
    SlotEmpty,

    #[error("Frame has {actual} bytes but channel shape needs {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Invalid frame channel header: {0}")]
    InvalidHeader(String),

    #[error("Frame channel write lock poisoned")]
    LockPoisoned,

    #[error("Frame channel backing file error: {0}")]
    Backing(#[from] std::io::Error),
}

/// Errors raised by the synchronized-start barrier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BarrierError {
    #[error("Trial start was cancelled before release")]
    Cancelled,

    #[error("Timed out waiting for acknowledgments from {0:?}")]
    AckTimeout(Vec<UnitName>),

    #[error("Acknowledgment channel of {0} closed")]
    AckChannelClosed(UnitName),
}

/// Errors from the stimulus hardware.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Stimulus device is not connected")]
    NotConnected,

    #[error("Failed to connect to stimulus device: {0}")]
    ConnectFailed(String),

    #[error("Write to stimulus device failed: {0}")]
    WriteFailed(String),
}

/// Errors from a frame source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Camera is not connected")]
    Disconnected,

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Video source exhausted")]
    Exhausted,

    #[error("Unusable recording: {0}")]
    InvalidRecording(String),

    #[error("Video source error: {0}")]
    File(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::Frame(FrameError::SizeMismatch {
            expected: 12,
            actual: 10,
        });
        assert_eq!(
            err.to_string(),
            "Frame channel error: Frame has 10 bytes but channel shape needs 12"
        );
    }

    #[test]
    fn test_shutdown_timeout_error() {
        let err = RigError::ShutdownTimeout {
            grace: std::time::Duration::from_secs(5),
            units: vec![UnitName::Camera, UnitName::Tracker],
        };
        let text = err.to_string();
        assert!(text.contains("failed to close"));
        assert!(text.contains("Camera"));
    }
}
