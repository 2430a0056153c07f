//! Closed-loop controller: containment, duty cycle and dwell statistics.

use super::duty_cycle::{DutyCycle, DutyState};
use super::stopwatch::Stopwatch;
use super::target::TargetRegion;
use crate::config::{ContainmentShape, StimulusConfig};
use crate::messages::{Coordinate, TargetParams};
use crate::storage::TrialRecord;
use std::time::{Duration, Instant};

/// Subject status and counters for the running trial.
#[derive(Debug, Clone, Default)]
pub struct StimulusState {
    pub in_target: bool,
    pub receiving_stim: bool,
    pub entry_count: u32,
    pub stim_count: u32,
    pub in_target_time: Stopwatch,
    pub stim_time: Stopwatch,
}

/// What one controller tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub duty: DutyState,
    /// Send a hardware pulse now
    pub fire_pulse: bool,
    pub entered_target: bool,
}

#[derive(Debug, Clone)]
pub struct ClosedLoopController {
    shape: ContainmentShape,
    target: Option<TargetRegion>,
    duty: DutyCycle,
    state: StimulusState,
    manual: bool,
}

impl ClosedLoopController {
    pub fn new(config: &StimulusConfig) -> Self {
        Self::with_timing(config.on_duration, config.cycle_duration, config.containment)
    }

    pub fn with_timing(on: Duration, total: Duration, shape: ContainmentShape) -> Self {
        Self {
            shape,
            target: None,
            duty: DutyCycle::new(on, total),
            state: StimulusState::default(),
            manual: false,
        }
    }

    pub fn state(&self) -> &StimulusState {
        &self.state
    }

    pub fn target(&self) -> Option<&TargetParams> {
        self.target.as_ref().map(TargetRegion::params)
    }

    pub fn set_target(&mut self, target: Option<TargetParams>) {
        self.target = target.map(|params| TargetRegion::new(params, self.shape));
    }

    pub fn set_radius(&mut self, radius: u32) {
        if let Some(target) = self.target.as_mut() {
            target.set_radius(radius);
        }
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// Flip manual mode; returns the new mode.
    pub fn toggle_manual(&mut self) -> bool {
        self.manual = !self.manual;
        self.manual
    }

    /// Clear counters and timers for a new trial.
    pub fn reset(&mut self) {
        self.duty.reset();
        self.state = StimulusState::default();
    }

    /// Containment test for a freshly tracked coordinate.
    pub fn observe(&mut self, coordinate: &Coordinate) {
        self.state.in_target = self
            .target
            .as_ref()
            .is_some_and(|target| target.contains(coordinate));
    }

    /// Advance the duty cycle and statistics to `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let duty = self.duty.tick(self.state.in_target, now);
        self.state.receiving_stim = duty.state == DutyState::StimActive;

        let mut entered_target = false;
        if self.state.in_target {
            if self.state.in_target_time.start_at(now) {
                self.state.entry_count += 1;
                entered_target = true;
            }
        } else {
            self.state.in_target_time.stop_at(now);
        }

        if self.state.receiving_stim {
            self.state.stim_time.start_at(now);
        } else {
            self.state.stim_time.stop_at(now);
        }
        if duty.pulse_started {
            self.state.stim_count += 1;
        }

        TickOutcome {
            duty: duty.state,
            fire_pulse: duty.pulse_started && !self.manual,
            entered_target,
        }
    }

    /// Log row for `coordinate` at trial time `elapsed`.
    pub fn record(&self, elapsed: Duration, coordinate: &Coordinate, now: Instant) -> TrialRecord {
        TrialRecord {
            elapsed: elapsed.as_secs_f64(),
            x: coordinate.x,
            y: coordinate.y,
            in_target: self.state.in_target,
            entry_count: self.state.entry_count,
            entry_dwell: self.state.in_target_time.current_run_at(now).as_secs_f64(),
            dwell_in_target: self.state.in_target_time.elapsed_at(now).as_secs_f64(),
            receiving_stim: self.state.receiving_stim,
            stim_count: self.state.stim_count,
            dwell_stim: self.state.stim_time.elapsed_at(now).as_secs_f64(),
        }
    }
}
