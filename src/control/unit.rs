//! Statistics unit: closed-loop stimulus, live maps, progress strip and trial logs.
//!
//! The command poller forwards everything to the compute loop over an internal
//! queue, so commands are applied between ticks and never mid-frame. Each
//! iteration the loop:
//!
//! 1. applies pending commands
//! 2. takes at most one coordinate, runs the containment test and updates the maps
//! 3. while a trial runs: ticks the duty cycle, fires pulses, advances the
//!    progress strip and logs the coordinate
//! 4. keeps the stimulus device alive and republishes the progress strip
//!
//! Containment and maps follow the subject at all times; pulses and records
//! only happen between barrier release and trial end.

use super::device::{StimulusDevice, StimulusLink};
use super::stimulus::ClosedLoopController;
use crate::barrier::BarrierParticipant;
use crate::bus::{poll_commands, CommandReceiver, PollCadence, Upstream};
use crate::config::RigConfig;
use crate::error::{AppResult, FrameError, RigError};
use crate::frame::{FrameProducer, FrameShape};
use crate::maps::gradient::append_legend;
use crate::maps::progress::device_error_image;
use crate::maps::{Heatmap, MapSet, MultiStreamSync, PathMap, ProgressBar, ProgressSample, PROGRESS_HEIGHT};
use crate::messages::{Command, Coordinate, StatsCommand, TargetParams, TrialParameters, UnitName};
use crate::storage::{self, TrialRecord};
use image::RgbImage;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Progress strip length until the first `SetTime` or `Start`.
const INITIAL_DURATION_SECS: f64 = 300.0;

/// Legend appended under the saved heatmap.
const SAVED_LEGEND_HEIGHT: u32 = 50;
const SAVED_LEGEND_STEPS: u32 = 64;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Channels, queues and hardware the statistics unit is built from.
pub struct StatsHandles {
    pub commands: CommandReceiver<StatsCommand>,
    pub coordinates: mpsc::UnboundedReceiver<Coordinate>,
    /// Heatmap, path and gradient producers, in that order
    pub maps: MultiStreamSync,
    pub progress: FrameProducer,
    pub upstream: Upstream,
    pub barrier: BarrierParticipant,
    pub device: Box<dyn StimulusDevice>,
}

pub struct StatisticsUnit {
    handles: StatsHandles,
    config: RigConfig,
    cadence: PollCadence,
}

impl StatisticsUnit {
    pub fn new(config: &RigConfig, handles: StatsHandles) -> AppResult<Self> {
        let expected = FrameShape::rgb(PROGRESS_HEIGHT, config.frames.cols);
        if handles.progress.shape() != expected {
            return Err(RigError::Frame(FrameError::SizeMismatch {
                expected: expected.len(),
                actual: handles.progress.shape().len(),
            }));
        }
        Ok(Self {
            cadence: PollCadence::unit(&config.bus),
            config: config.clone(),
            handles,
        })
    }

    pub async fn run(self) -> AppResult<()> {
        let StatsHandles {
            commands,
            coordinates,
            maps,
            progress,
            upstream,
            barrier,
            device,
        } = self.handles;
        let config = self.config;

        let maps = MapSet::new(&config.maps, config.frames.rows, config.frames.cols, maps)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let cadence = self.cadence;
        let poller = tokio::spawn(async move {
            poll_commands(commands, cadence, |command| {
                let exit = matches!(command, StatsCommand::Exit);
                if inbox_tx.send(command).is_err() || exit {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await;
            shutdown_tx.send_replace(true);
        });

        let mut compute = StatsLoop {
            controller: ClosedLoopController::new(&config.stimulus),
            link: StimulusLink::new(device, &config.stimulus),
            maps,
            bar: ProgressBar::new(config.frames.cols, INITIAL_DURATION_SECS),
            progress,
            upstream,
            barrier,
            coordinates,
            inbox: inbox_rx,
            trial: None,
            records: Vec::new(),
            pulses: Vec::new(),
            showing_error: false,
            stale: true,
            output_dir: config.application.output_dir.clone(),
            frame: (config.frames.rows, config.frames.cols),
            bins: (config.maps.heatmap_rows, config.maps.heatmap_cols),
        };
        let result = compute.run(shutdown_rx).await;
        compute.close().await;
        drop(compute);

        if result.is_err() {
            poller.abort();
        }
        match poller.await {
            Err(e) if e.is_panic() => tracing::warn!(error = %e, "Statistics command poller panicked"),
            _ => {}
        }
        tracing::info!("Statistics unit stopped");
        result
    }
}

struct ActiveTrial {
    params: TrialParameters,
    started: Instant,
}

struct StatsLoop {
    controller: ClosedLoopController,
    link: StimulusLink,
    maps: MapSet,
    bar: ProgressBar,
    progress: FrameProducer,
    upstream: Upstream,
    barrier: BarrierParticipant,
    coordinates: mpsc::UnboundedReceiver<Coordinate>,
    inbox: mpsc::UnboundedReceiver<StatsCommand>,
    trial: Option<ActiveTrial>,
    records: Vec<TrialRecord>,
    pulses: Vec<JoinHandle<()>>,
    showing_error: bool,
    /// Progress strip changed since it was last published
    stale: bool,
    output_dir: PathBuf,
    /// Frame rows and cols
    frame: (u32, u32),
    /// Heatmap bin rows and cols
    bins: (u32, u32),
}

impl StatsLoop {
    async fn run(&mut self, shutdown: watch::Receiver<bool>) -> AppResult<()> {
        tracing::info!(connected = self.link.is_connected(), "Statistics unit started");
        loop {
            while let Ok(command) = self.inbox.try_recv() {
                if self.handle(command).await.is_break() {
                    return Ok(());
                }
            }
            if *shutdown.borrow() && self.inbox.is_empty() {
                return Ok(());
            }

            let coordinate = self.coordinates.try_recv().ok();
            if let Some(coordinate) = &coordinate {
                self.controller.observe(coordinate);
                self.maps.update(coordinate);
                self.maps.try_publish()?;
            }

            let now = Instant::now();
            let updating = self.step_trial(coordinate.as_ref(), now).await;
            self.keep_alive(now, updating)?;

            if coordinate.is_none() {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
    }

    /// Advance the running trial. Returns whether the progress strip moved.
    async fn step_trial(&mut self, coordinate: Option<&Coordinate>, now: Instant) -> bool {
        let Some(trial) = &self.trial else {
            return false;
        };
        let elapsed = now.saturating_duration_since(trial.started);
        if elapsed.as_secs_f64() >= trial.params.duration_seconds {
            self.finish_trial().await;
            return false;
        }

        let outcome = self.controller.tick(now);
        if outcome.fire_pulse {
            self.fire();
        }
        if outcome.entered_target {
            tracing::debug!(entries = self.controller.state().entry_count, "Subject entered target");
        }

        let state = self.controller.state();
        self.bar.update(ProgressSample {
            elapsed: elapsed.as_secs_f64(),
            in_target: state.in_target,
            receiving_stim: state.receiving_stim,
            in_target_secs: state.in_target_time.elapsed_at(now).as_secs_f64(),
            stim_secs: state.stim_time.elapsed_at(now).as_secs_f64(),
            entries: state.entry_count,
            stims: state.stim_count,
        });
        if let Some(coordinate) = coordinate {
            self.records.push(self.controller.record(elapsed, coordinate, now));
        }
        true
    }

    /// Heartbeat, reconnect, and republish the strip when its consumer is ready.
    fn keep_alive(&mut self, now: Instant, updating: bool) -> AppResult<()> {
        self.link.heartbeat(now);
        self.stale |= updating;

        if self.progress.may_write() {
            if !self.link.is_connected() {
                if !self.showing_error {
                    tracing::warn!("Stimulus device disconnected");
                    self.showing_error = true;
                }
                let image = device_error_image(self.frame.1);
                self.progress.try_publish(image.as_raw())?;
            } else if self.stale || self.showing_error {
                if self.showing_error {
                    tracing::info!("Stimulus device restored");
                    self.showing_error = false;
                }
                let image: RgbImage = self.bar.render();
                if self.progress.try_publish(image.as_raw())? {
                    self.stale = false;
                }
            }
        }
        self.link.ensure_connected(now);
        Ok(())
    }

    fn fire(&mut self) {
        self.pulses.retain(|pulse| !pulse.is_finished());
        if !self.link.is_connected() {
            tracing::debug!("Skipping pulse, stimulus device disconnected");
            return;
        }
        self.pulses.push(self.link.pulse());
    }

    async fn handle(&mut self, command: StatsCommand) -> ControlFlow<()> {
        match command {
            StatsCommand::Start(params) => self.start_trial(params).await,
            StatsCommand::Stop => {
                if self.trial.is_some() {
                    self.finish_trial().await;
                } else {
                    tracing::debug!("Stop without a running trial");
                }
            }
            StatsCommand::SetTime(secs) => {
                if self.trial.is_some() {
                    tracing::warn!(secs, "Ignoring duration change during a trial");
                } else {
                    self.bar.set_duration(secs);
                    self.stale = true;
                }
            }
            StatsCommand::ClearMaps => self.maps.reset(),
            StatsCommand::DrawTarget(target) => self.controller.set_target(target),
            StatsCommand::SetTargetRadius(radius) => self.controller.set_radius(radius),
            StatsCommand::ToggleManual => {
                let manual = self.controller.toggle_manual();
                tracing::info!(manual, "Manual stimulus mode toggled");
            }
            StatsCommand::SendStimulus => {
                tracing::info!("Manual stimulus");
                self.fire();
            }
            StatsCommand::Exit => {
                if self.trial.is_some() {
                    tracing::warn!("Exit during a trial, saving what was recorded");
                    self.finish_trial().await;
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start_trial(&mut self, params: TrialParameters) {
        if self.trial.is_some() {
            tracing::warn!("Start during a running trial, finishing it first");
            self.finish_trial().await;
        }
        self.records.clear();
        self.maps.reset();
        self.controller.reset();
        self.bar.set_duration(params.duration_seconds);
        self.stale = true;
        self.link.ensure_connected(Instant::now());

        match self.barrier.acknowledge_and_wait().await {
            Ok(started) => {
                tracing::info!(name = %params.name, duration = params.duration_seconds, "Trial running");
                self.trial = Some(ActiveTrial { params, started });
            }
            Err(e) => tracing::warn!(error = %e, name = %params.name, "Trial start cancelled"),
        }
    }

    async fn finish_trial(&mut self) {
        let Some(trial) = self.trial.take() else {
            return;
        };
        self.upstream.notify(Command::Saving);
        let records = std::mem::take(&mut self.records);
        tracing::info!(name = %trial.params.name, rows = records.len(), "Trial finished, saving");

        let outputs = TrialOutputs {
            dir: self.output_dir.clone(),
            name: trial.params.name,
            target: self.controller.target().copied(),
            records,
            frame: self.frame,
            bins: self.bins,
        };
        let saved = tokio::task::spawn_blocking(move || outputs.save()).await;
        let failure = match saved {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            tracing::error!(%reason, "Failed to save trial outputs");
            self.upstream.notify(Command::Error {
                destination: UnitName::Gui,
                reason,
            });
        }
        self.upstream.notify(Command::Finished);
    }

    async fn close(&mut self) {
        for pulse in self.pulses.drain(..) {
            if let Err(e) = pulse.await {
                tracing::warn!(error = %e, "Stimulus pulse worker panicked");
            }
        }
        self.link.close().await;
    }
}

/// Everything written at the end of a trial.
struct TrialOutputs {
    dir: PathBuf,
    name: String,
    target: Option<TargetParams>,
    records: Vec<TrialRecord>,
    frame: (u32, u32),
    bins: (u32, u32),
}

impl TrialOutputs {
    fn positions(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.records.iter().filter_map(|r| Some((r.x?, r.y?)))
    }

    /// CSV, full-resolution heatmap with legend, and full-resolution path.
    fn save(self) -> anyhow::Result<()> {
        let (rows, cols) = self.frame;
        storage::write_coords_csv(&self.dir, &self.name, self.target.as_ref(), &self.records)?;

        let mut heatmap = Heatmap::new(self.bins.0, self.bins.1, cols, rows);
        for (x, y) in self.positions() {
            heatmap.add(x, y);
        }
        let (min, max) = heatmap.min_max();
        let image = append_legend(
            &heatmap.render_with_counts(),
            min,
            max,
            SAVED_LEGEND_HEIGHT,
            SAVED_LEGEND_STEPS,
        );
        save_named(&self.dir, &self.name, "_Heatmap.png", &image)?;

        let path = PathMap::render_full(cols, rows, self.positions());
        save_named(&self.dir, &self.name, "_Path.png", &path)?;
        Ok(())
    }
}

fn save_named(dir: &Path, name: &str, suffix: &str, image: &RgbImage) -> anyhow::Result<()> {
    storage::save_rgb_png(&storage::trial_path(dir, name, suffix), image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::StartBarrier;
    use crate::bus::upstream_queue;
    use crate::control::MockPinDevice;
    use crate::frame::frame_channel;
    use tempfile::tempdir;

    #[cfg(feature = "storage_csv")]
    fn record(elapsed: f64, x: Option<i32>, y: Option<i32>) -> TrialRecord {
        TrialRecord {
            elapsed,
            x,
            y,
            in_target: false,
            entry_count: 0,
            entry_dwell: 0.0,
            dwell_in_target: 0.0,
            receiving_stim: false,
            stim_count: 0,
            dwell_stim: 0.0,
        }
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_outputs_written_at_full_resolution() {
        let dir = tempdir().unwrap();
        let outputs = TrialOutputs {
            dir: dir.path().to_path_buf(),
            name: "mouse1".to_string(),
            target: None,
            records: vec![
                record(0.0, Some(10), Some(10)),
                record(0.1, None, None),
                record(0.2, Some(200), Some(100)),
            ],
            frame: (120, 160),
            bins: (12, 16),
        };
        outputs.save().unwrap();

        assert!(dir.path().join("mouse1_Coords.csv").exists());
        let heatmap = image::open(dir.path().join("mouse1_Heatmap.png")).unwrap();
        assert_eq!((heatmap.width(), heatmap.height()), (160, 120 + SAVED_LEGEND_HEIGHT));
        let path = image::open(dir.path().join("mouse1_Path.png")).unwrap();
        assert_eq!((path.width(), path.height()), (160, 120));
    }

    fn stats_loop(
        config: &RigConfig,
        dir: &Path,
        device: MockPinDevice,
    ) -> (StatsLoop, crate::frame::FrameConsumer, mpsc::UnboundedSender<StatsCommand>) {
        let spin = config.frames.spin_interval;
        let (rows, cols) = (config.frames.rows, config.frames.cols);
        let maps = MapSet::shapes(&config.maps, rows, cols)
            .iter()
            .enumerate()
            .map(|(i, shape)| frame_channel(&dir.join(i.to_string()), *shape, spin).unwrap().0)
            .collect();
        let maps = MapSet::new(&config.maps, rows, cols, MultiStreamSync::new(maps)).unwrap();
        let (progress, progress_in) =
            frame_channel(&dir.join("bar"), FrameShape::rgb(PROGRESS_HEIGHT, cols), spin).unwrap();
        let (upstream, _inbox) = upstream_queue();
        let (barrier, _ack) = StartBarrier::new().participant(UnitName::Statistics);
        let (_coordinates, coordinates) = mpsc::unbounded_channel();
        let (commands, inbox) = mpsc::unbounded_channel();

        let stats = StatsLoop {
            controller: ClosedLoopController::new(&config.stimulus),
            link: StimulusLink::new(Box::new(device), &config.stimulus),
            maps,
            bar: ProgressBar::new(cols, 60.0),
            progress,
            upstream,
            barrier,
            coordinates,
            inbox,
            trial: None,
            records: Vec::new(),
            pulses: Vec::new(),
            showing_error: false,
            stale: true,
            output_dir: dir.to_path_buf(),
            frame: (rows, cols),
            bins: (config.maps.heatmap_rows, config.maps.heatmap_cols),
        };
        (stats, progress_in, commands)
    }

    #[tokio::test]
    async fn test_device_loss_shows_error_strip_and_keeps_trial_counters() {
        let dir = tempdir().unwrap();
        let mut config = RigConfig::default();
        config.stimulus.heartbeat_interval = Duration::from_millis(50);
        let cols = config.frames.cols;
        let mock = MockPinDevice::connected();
        let (mut stats, progress_in, _commands) = stats_loop(&config, dir.path(), mock.clone());
        let ms = Duration::from_millis;
        let t0 = Instant::now();

        stats.controller.set_target(Some(TargetParams {
            center: (100, 100),
            normalized_center: (100.0 / 640.0, 100.0 / 480.0),
            radius: 20,
        }));
        // counters only, no pulses on the mock
        stats.controller.toggle_manual();
        stats.trial = Some(ActiveTrial {
            params: TrialParameters::new("mouse1", 60.0),
            started: t0,
        });
        let inside = Coordinate::detected(100, 100);
        stats.controller.observe(&inside);
        assert!(stats.step_trial(Some(&inside), t0 + ms(10)).await);
        stats.keep_alive(t0 + ms(10), true).unwrap();
        stats.link.settle().await;
        assert!(progress_in.try_take().unwrap().is_some());

        // heartbeat write fails
        mock.set_failing(true);
        stats.keep_alive(t0 + ms(100), false).unwrap();
        stats.link.settle().await;
        assert!(!stats.link.is_connected());
        let _ = progress_in.try_take().unwrap();

        // the subject keeps moving while the board is gone
        stats.controller.observe(&inside);
        assert!(stats.step_trial(Some(&inside), t0 + ms(120)).await);
        stats.keep_alive(t0 + ms(120), true).unwrap();
        stats.link.settle().await;
        let shown = progress_in.try_take().unwrap().unwrap();
        assert_eq!(shown, device_error_image(cols).into_raw());

        let later = t0 + ms(1000);
        let before = stats.controller.state().clone();
        assert_eq!(before.entry_count, 1);

        mock.set_failing(false);
        stats.keep_alive(t0 + ms(300), false).unwrap();
        stats.link.settle().await;
        assert!(stats.link.is_connected());
        let _ = progress_in.try_take().unwrap();
        stats.keep_alive(t0 + ms(310), false).unwrap();
        stats.link.settle().await;
        let shown = progress_in.try_take().unwrap().unwrap();
        assert_eq!(shown, stats.bar.render().into_raw());
        assert_ne!(shown, device_error_image(cols).into_raw());

        let after = stats.controller.state();
        assert_eq!(after.entry_count, before.entry_count);
        assert_eq!(after.stim_count, before.stim_count);
        assert_eq!(after.in_target_time.elapsed_at(later), before.in_target_time.elapsed_at(later));
        assert_eq!(after.stim_time.elapsed_at(later), before.stim_time.elapsed_at(later));
        assert!(after.in_target_time.is_running());

        stats.close().await;
    }
}
