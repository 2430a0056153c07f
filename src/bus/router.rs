//! Central router.
//!
//! Every unit and the user interface send [`Envelope`]s to one inbound queue.
//! The router translates each [`Command`] into the typed commands of the units
//! that handle it, drives the start barrier, and folds per-unit `Saving` /
//! `Finished` reports into one notification for the user interface.

use super::queue::{CommandSender, PollCadence};
use crate::barrier::{AckCollector, StartBarrier};
use crate::error::AppResult;
use crate::messages::{
    BackgroundPair, CameraCommand, Command, Envelope, RecorderCommand, StatsCommand,
    TrackerCommand, TrialParameters, UnitName,
};
use crate::storage;
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Inbound queues of every addressable unit.
#[derive(Debug, Clone)]
pub struct UnitQueues {
    pub camera: CommandSender<CameraCommand>,
    pub tracker: CommandSender<TrackerCommand>,
    pub statistics: CommandSender<StatsCommand>,
    pub raw_recorder: CommandSender<RecorderCommand>,
    pub processed_recorder: CommandSender<RecorderCommand>,
    /// Notifications for the user interface
    pub gui: CommandSender<Command>,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub cadence: PollCadence,
    pub ack_timeout: Option<Duration>,
    pub output_dir: PathBuf,
}

pub struct Router {
    inbox: mpsc::UnboundedReceiver<Envelope>,
    units: UnitQueues,
    barrier: StartBarrier,
    acks: AckCollector,
    settings: RouterSettings,
    background: Option<BackgroundPair>,
    saving: BTreeSet<UnitName>,
    finished: BTreeSet<UnitName>,
}

impl Router {
    pub fn new(
        inbox: mpsc::UnboundedReceiver<Envelope>,
        units: UnitQueues,
        barrier: StartBarrier,
        acks: AckCollector,
        settings: RouterSettings,
    ) -> Self {
        Self {
            inbox,
            units,
            barrier,
            acks,
            settings,
            background: None,
            saving: BTreeSet::new(),
            finished: BTreeSet::new(),
        }
    }

    /// Serve the inbound queue until `Exit` or until every sender is dropped.
    pub async fn run(mut self) -> AppResult<()> {
        tracing::info!(participants = ?self.acks.participants(), "Router started");
        loop {
            let envelope =
                match tokio::time::timeout(self.settings.cadence.timeout, self.inbox.recv()).await {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => {
                        tracing::info!("Router inbox closed");
                        break;
                    }
                    Err(_) => {
                        tokio::time::sleep(self.settings.cadence.idle).await;
                        continue;
                    }
                };
            if self.dispatch(envelope).await.is_break() {
                break;
            }
        }
        self.barrier.clear();
        tracing::info!("Router stopped");
        Ok(())
    }

    async fn dispatch(&mut self, envelope: Envelope) -> ControlFlow<()> {
        let origin = envelope.origin;
        tracing::debug!(?origin, kind = envelope.command.kind(), "Routing command");

        match envelope.command {
            Command::Start(params) => self.start_trial(params).await,
            Command::Stop => {
                self.barrier.clear();
                self.to_participants(|| RecorderCommand::Stop, StatsCommand::Stop);
            }
            Command::Exit => {
                self.barrier.clear();
                self.deliver(&self.units.camera, CameraCommand::Exit);
                self.deliver(&self.units.tracker, TrackerCommand::Exit);
                self.to_participants(|| RecorderCommand::Exit, StatsCommand::Exit);
                return ControlFlow::Break(());
            }
            Command::SetTime(secs) => self.deliver(&self.units.statistics, StatsCommand::SetTime(secs)),
            Command::SetBounds(bounds) => {
                self.deliver(&self.units.tracker, TrackerCommand::SetBounds(bounds))
            }
            Command::ShowTracked => self.deliver(&self.units.tracker, TrackerCommand::ShowTracked),
            Command::GetBackground => {
                self.deliver(&self.units.tracker, TrackerCommand::GetBackground)
            }
            Command::DrawTarget(target) => {
                self.deliver(&self.units.tracker, TrackerCommand::DrawTarget(target));
                self.deliver(&self.units.statistics, StatsCommand::DrawTarget(target));
            }
            Command::SetTargetRadius(radius) => {
                self.deliver(&self.units.tracker, TrackerCommand::SetTargetRadius(radius));
                self.deliver(&self.units.statistics, StatsCommand::SetTargetRadius(radius));
            }
            Command::SetVideoSource(source) => {
                self.deliver(&self.units.camera, CameraCommand::SetVideoSource(source))
            }
            Command::ClearMaps => self.deliver(&self.units.statistics, StatsCommand::ClearMaps),
            Command::ToggleManual => self.deliver(&self.units.statistics, StatsCommand::ToggleManual),
            Command::SendStimulus => self.deliver(&self.units.statistics, StatsCommand::SendStimulus),
            Command::Error {
                destination,
                reason,
            } => self.route_error(origin, destination, reason),
            Command::NewBackground(pair) => {
                tracing::debug!(?origin, "Stored new background for archival");
                self.background = Some(pair);
            }
            Command::Saving => {
                if let Some(unit) = origin {
                    if record_report(&mut self.saving, unit) {
                        tracing::info!("All units saving");
                        self.deliver(&self.units.gui, Command::Saving);
                    }
                }
            }
            Command::Finished => {
                if let Some(unit) = origin {
                    if record_report(&mut self.finished, unit) {
                        tracing::info!("All units finished saving");
                        self.deliver(&self.units.gui, Command::Finished);
                    }
                }
            }
            Command::Started => self.deliver(&self.units.gui, Command::Started),
        }
        ControlFlow::Continue(())
    }

    async fn start_trial(&mut self, params: TrialParameters) {
        tracing::info!(name = %params.name, duration = params.duration_seconds, "Starting trial");
        self.saving.clear();
        self.finished.clear();

        if let Some(pair) = &self.background {
            if let Err(e) = storage::archive_backgrounds(&self.settings.output_dir, &params.name, pair)
            {
                tracing::warn!(error = %e, "Failed to archive backgrounds");
            }
        }

        let generation = self.barrier.arm();
        let start = params.clone();
        self.to_participants(
            || RecorderCommand::Start(start.clone()),
            StatsCommand::Start(params),
        );

        match self.acks.collect(generation, self.settings.ack_timeout).await {
            Ok(()) => {
                self.barrier.release();
                self.deliver(&self.units.gui, Command::Started);
            }
            Err(e) => {
                tracing::error!(error = %e, generation, "Trial start failed");
                self.barrier.clear();
                self.to_participants(|| RecorderCommand::Stop, StatsCommand::Stop);
                self.deliver(
                    &self.units.gui,
                    Command::Error {
                        destination: UnitName::Gui,
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    fn route_error(&self, origin: Option<UnitName>, destination: UnitName, reason: String) {
        tracing::warn!(?origin, %destination, %reason, "Error reported");
        match destination {
            UnitName::Tracker => self.deliver(&self.units.tracker, TrackerCommand::ShowError),
            UnitName::Gui => self.deliver(
                &self.units.gui,
                Command::Error {
                    destination,
                    reason,
                },
            ),
            UnitName::Camera
            | UnitName::Statistics
            | UnitName::RawRecorder
            | UnitName::ProcessedRecorder => {
                tracing::warn!(%destination, "Unit has no error display; error logged only");
            }
        }
    }

    fn to_participants<F>(&self, recorder: F, statistics: StatsCommand)
    where
        F: Fn() -> RecorderCommand,
    {
        self.deliver(&self.units.statistics, statistics);
        self.deliver(&self.units.processed_recorder, recorder());
        self.deliver(&self.units.raw_recorder, recorder());
    }

    fn deliver<T>(&self, queue: &CommandSender<T>, command: T) {
        if let Err(e) = queue.send(command) {
            tracing::warn!(unit = %queue.unit(), error = %e, "Dropping command for closed unit");
        }
    }
}

/// Record one unit's report; true once all trial participants have reported.
fn record_report(reported: &mut BTreeSet<UnitName>, unit: UnitName) -> bool {
    if !UnitName::TRIAL_PARTICIPANTS.contains(&unit) {
        tracing::warn!(%unit, "Ignoring report from a unit outside the trial");
        return false;
    }
    reported.insert(unit);
    if UnitName::TRIAL_PARTICIPANTS
        .iter()
        .all(|participant| reported.contains(participant))
    {
        reported.clear();
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_fold_once_all_participants_reported() {
        let mut reported = BTreeSet::new();
        assert!(!record_report(&mut reported, UnitName::Statistics));
        assert!(!record_report(&mut reported, UnitName::Statistics));
        assert!(!record_report(&mut reported, UnitName::RawRecorder));
        assert!(record_report(&mut reported, UnitName::ProcessedRecorder));
        // the set resets after emission
        assert!(reported.is_empty());
        assert!(!record_report(&mut reported, UnitName::Camera));
        assert!(reported.is_empty());
    }
}
