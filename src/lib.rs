//! Coordination layer for a closed-loop behavioral tracking rig.
//!
//! A camera feeds grayscale frames to a tracker, which locates the subject and
//! streams coordinates to a statistics unit. The statistics unit decides, on
//! every coordinate, whether the subject is inside the target region and
//! drives a stimulus line through a duty cycle. Two recorders write the raw
//! and the composed display streams to disk during a trial.
//!
//! Units never share mutable state. Bulk image data moves through
//! single-slot, memory-mapped [`frame`] channels; everything else is a
//! [`messages::Command`] routed by the [`bus::Router`]. Trial starts go
//! through the [`barrier`] so that statistics and both recorders begin on the
//! same instant.
//!
//! [`orchestrator::Rig`] builds and runs the whole thing:
//!
//! ```no_run
//! use closed_loop_rig::config::RigConfig;
//! use closed_loop_rig::messages::{Command, TrialParameters};
//! use closed_loop_rig::orchestrator::Rig;
//!
//! # async fn demo() -> closed_loop_rig::error::AppResult<()> {
//! let rig = Rig::build(RigConfig::load()?)?.spawn();
//! rig.send(Command::Start(TrialParameters::new("trial_01", 60.0)))?;
//! rig.shutdown().await
//! # }
//! ```

pub mod acquisition;
pub mod barrier;
pub mod bus;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod glyphs;
pub mod logging;
pub mod maps;
pub mod messages;
pub mod orchestrator;
pub mod recorder;
pub mod storage;
pub mod tracking;
