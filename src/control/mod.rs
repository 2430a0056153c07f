//! Closed-loop stimulus control and per-trial statistics.

pub mod device;
pub mod duty_cycle;
pub mod stimulus;
pub mod stopwatch;
pub mod target;
pub mod unit;

pub use device::{MockPinDevice, StimulusDevice, StimulusLink};
#[cfg(feature = "instrument_serial")]
pub use device::SerialPinDevice;
pub use duty_cycle::{DutyCycle, DutyState, DutyTick};
pub use stimulus::{ClosedLoopController, StimulusState, TickOutcome};
pub use stopwatch::Stopwatch;
pub use target::TargetRegion;
pub use unit::{StatisticsUnit, StatsHandles};
