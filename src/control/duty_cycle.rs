//! Stimulus duty cycle.
//!
//! ```text
//!   IDLE --inside--> STIM_ACTIVE --ON elapsed--> REFRACTORY
//!    ^                    ^                          |
//!    |                    +--TOTAL elapsed, inside---+
//!    +-----------------TOTAL elapsed, outside--------+
//! ```
//!
//! A pulse always runs its full ON time; leaving the target does not cut it short.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyState {
    Idle,
    StimActive,
    Refractory,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyTick {
    pub state: DutyState,
    /// This tick entered STIM_ACTIVE
    pub pulse_started: bool,
}

#[derive(Debug, Clone)]
pub struct DutyCycle {
    on: Duration,
    total: Duration,
    pulse_start: Option<Instant>,
    state: DutyState,
}

impl DutyCycle {
    pub fn new(on: Duration, total: Duration) -> Self {
        Self {
            on,
            total,
            pulse_start: None,
            state: DutyState::Idle,
        }
    }

    pub fn state(&self) -> DutyState {
        self.state
    }

    pub fn pulse_start(&self) -> Option<Instant> {
        self.pulse_start
    }

    pub fn reset(&mut self) {
        self.pulse_start = None;
        self.state = DutyState::Idle;
    }

    pub fn tick(&mut self, inside: bool, now: Instant) -> DutyTick {
        let mut pulse_started = false;
        self.state = match self.pulse_start {
            Some(start) => {
                let elapsed = now.saturating_duration_since(start);
                if elapsed < self.on {
                    DutyState::StimActive
                } else if elapsed < self.total {
                    DutyState::Refractory
                } else if inside {
                    self.pulse_start = Some(now);
                    pulse_started = true;
                    DutyState::StimActive
                } else {
                    self.pulse_start = None;
                    DutyState::Idle
                }
            }
            None if inside => {
                self.pulse_start = Some(now);
                pulse_started = true;
                DutyState::StimActive
            }
            None => DutyState::Idle,
        };
        DutyTick {
            state: self.state,
            pulse_started,
        }
    }
}
