//! Raw and processed video recorders.

pub mod canvas;
pub mod unit;

pub use canvas::Canvas;
pub use unit::{RecorderHandles, RecorderUnit};
