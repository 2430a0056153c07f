//! Rig lifecycle: build every channel, queue and unit, run them, shut them down.
//!
//! Nothing is global. [`Rig::build`] creates the frame channels (memory-mapped
//! files under `frames.channel_dir`, or a private temp dir), the command queues,
//! the start barrier and the units, and hands each unit exactly the handles it
//! uses. [`Rig::spawn`] starts one task per unit plus the router and returns a
//! [`RunningRig`], which plays the user interface: it sends commands, receives
//! consolidated notifications and can look at the latest display frames.

use crate::acquisition::{CameraHandles, CameraUnit, FrameSource, SyntheticSource};
use crate::barrier::{AckCollector, StartBarrier};
use crate::bus::{command_queue, upstream_queue, CommandReceiver, PollCadence, Router, RouterSettings, UnitQueues, Upstream};
use crate::config::RigConfig;
use crate::control::{MockPinDevice, StatisticsUnit, StatsHandles, StimulusDevice};
use crate::error::{AppResult, RigError};
use crate::frame::{frame_channel, FrameConsumer, FrameDrain, FrameShape, LatestFrame, RecordSync};
use crate::maps::{MapSet, MultiStreamSync, PROGRESS_HEIGHT};
use crate::messages::{Command, UnitName};
use crate::recorder::{Canvas, RecorderHandles, RecorderUnit};
use crate::tracking::{TrackerHandles, TrackerUnit};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How often the headless display drains its channels.
const DISPLAY_POLL: Duration = Duration::from_millis(10);

type UnitFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;

/// Where the channel files live. A temp dir is removed with the rig.
#[derive(Debug)]
enum ChannelDir {
    Configured(PathBuf),
    Temporary(TempDir),
}

impl ChannelDir {
    fn path(&self) -> &Path {
        match self {
            ChannelDir::Configured(path) => path,
            ChannelDir::Temporary(dir) => dir.path(),
        }
    }
}

/// Consumers of the display-bound channels before they get drained.
struct DisplayConsumers {
    tracker: FrameConsumer,
    heatmap: FrameConsumer,
    path: FrameConsumer,
    gradient: FrameConsumer,
    progress: FrameConsumer,
}

/// Latest frame of every display-bound channel.
#[derive(Debug, Clone)]
pub struct Displays {
    pub tracker: LatestFrame,
    pub heatmap: LatestFrame,
    pub path: LatestFrame,
    pub gradient: LatestFrame,
    pub progress: LatestFrame,
}

/// A fully wired rig that has not started yet.
pub struct Rig {
    config: RigConfig,
    channel_dir: ChannelDir,
    units: Vec<(UnitName, UnitFuture)>,
    router: Router,
    control: Upstream,
    notifications: CommandReceiver<Command>,
    displays: DisplayConsumers,
}

impl Rig {
    /// Build with the synthetic camera and the device named by `stimulus.port`.
    pub fn build(config: RigConfig) -> AppResult<Self> {
        let shape = FrameShape::gray(config.frames.rows, config.frames.cols);
        let camera = SyntheticSource::new(shape, config.camera.framerate, config.camera.seed);
        let device = stimulus_device(&config)?;
        Self::build_with(config, Box::new(camera), device)
    }

    /// Build with an explicit camera and stimulus device.
    pub fn build_with(
        config: RigConfig,
        camera: Box<dyn FrameSource>,
        device: Box<dyn StimulusDevice>,
    ) -> AppResult<Self> {
        config.validate()?;
        let channel_dir = match &config.frames.channel_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                ChannelDir::Configured(dir.clone())
            }
            None => ChannelDir::Temporary(tempfile::Builder::new().prefix("rig-frames").tempdir()?),
        };
        let dir = channel_dir.path().to_path_buf();
        let spin = config.frames.spin_interval;
        let (rows, cols) = (config.frames.rows, config.frames.cols);
        let channel = |name: &str, shape: FrameShape| frame_channel(&dir.join(name), shape, spin);

        let (camera_out, tracker_in) = channel("camera.frame", FrameShape::gray(rows, cols))?;
        let (tracker_out, tracker_display) = channel("tracker.frame", FrameShape::rgb(rows, cols))?;
        let [heatmap_shape, path_shape, gradient_shape] = MapSet::shapes(&config.maps, rows, cols);
        let (heatmap_out, heatmap_display) = channel("heatmap.frame", heatmap_shape)?;
        let (path_out, path_display) = channel("path.frame", path_shape)?;
        let (gradient_out, gradient_display) = channel("gradient.frame", gradient_shape)?;
        let (progress_out, progress_display) = channel("progress.frame", FrameShape::rgb(PROGRESS_HEIGHT, cols))?;

        let raw_canvas = Canvas::single(camera_out.observer());
        let processed_canvas = Canvas::processed(
            path_out.observer(),
            heatmap_out.observer(),
            gradient_out.observer(),
            tracker_out.observer(),
            progress_out.observer(),
        )?;

        let (upstream, inbox) = upstream_queue();
        let (camera_tx, camera_rx) = command_queue(UnitName::Camera);
        let (tracker_tx, tracker_rx) = command_queue(UnitName::Tracker);
        let (stats_tx, stats_rx) = command_queue(UnitName::Statistics);
        let (raw_tx, raw_rx) = command_queue(UnitName::RawRecorder);
        let (processed_tx, processed_rx) = command_queue(UnitName::ProcessedRecorder);
        let (gui_tx, gui_rx) = command_queue(UnitName::Gui);

        let barrier = StartBarrier::new();
        let (stats_barrier, stats_ack) = barrier.participant(UnitName::Statistics);
        let (processed_barrier, processed_ack) = barrier.participant(UnitName::ProcessedRecorder);
        let (raw_barrier, raw_ack) = barrier.participant(UnitName::RawRecorder);
        let acks = AckCollector::new(vec![stats_ack, processed_ack, raw_ack]);

        let raw_sync = RecordSync::new();
        let processed_sync = RecordSync::new();
        let (coordinates_tx, coordinates_rx) = mpsc::unbounded_channel();
        let from = |unit: UnitName| upstream.with_origin(Some(unit));

        let camera = CameraUnit::new(
            camera,
            &config.camera,
            &config.bus,
            CameraHandles {
                commands: camera_rx,
                output: camera_out,
                record_sync: raw_sync.clone(),
                upstream: from(UnitName::Camera),
            },
        );
        let tracker = TrackerUnit::new(
            &config.tracker,
            &config.bus,
            TrackerHandles {
                commands: tracker_rx,
                input: tracker_in,
                output: tracker_out,
                coordinates: coordinates_tx,
                upstream: from(UnitName::Tracker),
                record_sync: processed_sync.clone(),
            },
        )?;
        let statistics = StatisticsUnit::new(
            &config,
            StatsHandles {
                commands: stats_rx,
                coordinates: coordinates_rx,
                maps: MultiStreamSync::new(vec![heatmap_out, path_out, gradient_out]),
                progress: progress_out,
                upstream: from(UnitName::Statistics),
                barrier: stats_barrier,
                device,
            },
        )?;
        let output_dir = config.application.output_dir.clone();
        let raw_recorder = RecorderUnit::new(
            UnitName::RawRecorder,
            config.recorder.raw_suffix.clone(),
            &config.recorder,
            &config.bus,
            output_dir.clone(),
            RecorderHandles {
                commands: raw_rx,
                canvas: raw_canvas,
                sync: raw_sync,
                upstream: from(UnitName::RawRecorder),
                barrier: raw_barrier,
            },
        );
        let processed_recorder = RecorderUnit::new(
            UnitName::ProcessedRecorder,
            config.recorder.processed_suffix.clone(),
            &config.recorder,
            &config.bus,
            output_dir.clone(),
            RecorderHandles {
                commands: processed_rx,
                canvas: processed_canvas,
                sync: processed_sync,
                upstream: from(UnitName::ProcessedRecorder),
                barrier: processed_barrier,
            },
        );

        let router = Router::new(
            inbox,
            UnitQueues {
                camera: camera_tx,
                tracker: tracker_tx,
                statistics: stats_tx,
                raw_recorder: raw_tx,
                processed_recorder: processed_tx,
                gui: gui_tx,
            },
            barrier,
            acks,
            RouterSettings {
                cadence: PollCadence::router(&config.bus),
                ack_timeout: config.barrier.ack_timeout,
                output_dir,
            },
        );

        let units: Vec<(UnitName, UnitFuture)> = vec![
            (UnitName::Camera, Box::pin(camera.run())),
            (UnitName::Tracker, Box::pin(tracker.run())),
            (UnitName::Statistics, Box::pin(statistics.run())),
            (UnitName::RawRecorder, Box::pin(raw_recorder.run())),
            (UnitName::ProcessedRecorder, Box::pin(processed_recorder.run())),
        ];
        tracing::info!(channels = %dir.display(), rows, cols, "Rig built");

        Ok(Self {
            config,
            channel_dir,
            units,
            router,
            control: upstream,
            notifications: gui_rx,
            displays: DisplayConsumers {
                tracker: tracker_display,
                heatmap: heatmap_display,
                path: path_display,
                gradient: gradient_display,
                progress: progress_display,
            },
        })
    }

    pub fn channel_dir(&self) -> &Path {
        self.channel_dir.path()
    }

    /// Start every unit, the router and the display drains.
    pub fn spawn(self) -> RunningRig {
        let tasks = self
            .units
            .into_iter()
            .map(|(unit, future)| (unit, tokio::spawn(future)))
            .collect();
        let router = tokio::spawn(self.router.run());

        let (drain_stop, drain_rx) = watch::channel(false);
        let drain = |name: &'static str, consumer: FrameConsumer| {
            FrameDrain::spawn(name, consumer, DISPLAY_POLL, drain_rx.clone())
        };
        let d = self.displays;
        let (tracker_drain, tracker) = drain("tracker", d.tracker);
        let (heatmap_drain, heatmap) = drain("heatmap", d.heatmap);
        let (path_drain, path) = drain("path", d.path);
        let (gradient_drain, gradient) = drain("gradient", d.gradient);
        let (progress_drain, progress) = drain("progress", d.progress);

        RunningRig {
            grace: self.config.application.shutdown_grace,
            channel_dir: self.channel_dir,
            tasks,
            router,
            control: self.control,
            notifications: self.notifications,
            drains: vec![tracker_drain, heatmap_drain, path_drain, gradient_drain, progress_drain],
            drain_stop,
            displays: Displays {
                tracker,
                heatmap,
                path,
                gradient,
                progress,
            },
        }
    }
}

/// Handle on a running rig; stands in for the user interface.
pub struct RunningRig {
    grace: Duration,
    // keeps a temporary channel dir alive until shutdown
    #[allow(dead_code)]
    channel_dir: ChannelDir,
    tasks: Vec<(UnitName, JoinHandle<AppResult<()>>)>,
    router: JoinHandle<AppResult<()>>,
    control: Upstream,
    notifications: CommandReceiver<Command>,
    drains: Vec<FrameDrain>,
    drain_stop: watch::Sender<bool>,
    displays: Displays,
}

impl RunningRig {
    /// Send a command as the user interface.
    pub fn send(&self, command: Command) -> AppResult<()> {
        self.control.send(command)
    }

    pub fn displays(&self) -> &Displays {
        &self.displays
    }

    /// Next consolidated notification for the user interface, waiting up to `timeout`.
    pub async fn next_notification(&mut self, timeout: Duration) -> Option<Command> {
        tokio::time::timeout(timeout, self.notifications.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for a notification matching `want`, skipping others, for up to `timeout`.
    pub async fn wait_for<F>(&mut self, timeout: Duration, mut want: F) -> Option<Command>
    where
        F: FnMut(&Command) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return None;
            }
            let command = self.next_notification(left).await?;
            if want(&command) {
                return Some(command);
            }
            tracing::debug!(kind = command.kind(), "Skipping notification");
        }
    }

    /// Send `Exit` and join every unit within the grace period.
    ///
    /// Units still running after the grace period are aborted and reported in
    /// [`RigError::ShutdownTimeout`]. A unit that stopped with an error is
    /// logged; the first such error is returned if every unit closed in time.
    pub async fn shutdown(self) -> AppResult<()> {
        tracing::info!(grace = ?self.grace, "Shutting down rig");
        if let Err(e) = self.control.send(Command::Exit) {
            tracing::warn!(error = %e, "Router already gone");
        }
        let deadline = tokio::time::Instant::now() + self.grace;

        let mut failed_to_close = Vec::new();
        let mut first_error = None;
        for (unit, mut task) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(Ok(()))) => tracing::debug!(%unit, "Unit closed"),
                Ok(Ok(Err(e))) => {
                    tracing::error!(%unit, error = %e, "Unit stopped with an error");
                    first_error.get_or_insert(e);
                }
                Ok(Err(e)) => {
                    tracing::error!(%unit, error = %e, "Unit task panicked");
                    first_error.get_or_insert(RigError::Processing(format!("{unit} panicked")));
                }
                Err(_) => {
                    task.abort();
                    failed_to_close.push(unit);
                }
            }
        }
        let mut router = self.router;
        match tokio::time::timeout_at(deadline, &mut router).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "Router stopped with an error"),
            Ok(Err(e)) => tracing::error!(error = %e, "Router task panicked"),
            Err(_) => {
                router.abort();
                tracing::error!("Router failed to close");
            }
        }

        self.drain_stop.send_replace(true);
        for drain in self.drains {
            let name = drain.name();
            let frames = drain.join().await;
            tracing::debug!(drain = name, frames, "Display drain joined");
        }

        if !failed_to_close.is_empty() {
            return Err(RigError::ShutdownTimeout {
                grace: self.grace,
                units: failed_to_close,
            });
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Rig shut down");
                Ok(())
            }
        }
    }
}

/// The pin board from `stimulus.port`, or an always-connected mock when unset.
pub fn stimulus_device(config: &RigConfig) -> AppResult<Box<dyn StimulusDevice>> {
    let Some(port) = &config.stimulus.port else {
        tracing::info!("No stimulus port configured, using mock pin device");
        return Ok(Box::new(MockPinDevice::connected()));
    };
    serial_device(config, port)
}

#[cfg(feature = "instrument_serial")]
fn serial_device(config: &RigConfig, port: &str) -> AppResult<Box<dyn StimulusDevice>> {
    use crate::control::SerialPinDevice;
    let pins = vec![config.stimulus.stimulus_pin, config.stimulus.status_pin];
    Ok(Box::new(SerialPinDevice::new(port, config.stimulus.baud_rate, pins)))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_device(_config: &RigConfig, _port: &str) -> AppResult<Box<dyn StimulusDevice>> {
    Err(RigError::FeatureNotEnabled("instrument_serial".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_mock_device_without_port() {
        let config = RigConfig::default();
        let device = stimulus_device(&config).unwrap();
        assert!(device.is_connected());
        assert!(logs_contain("using mock pin device"));
    }

    #[tokio::test]
    async fn test_build_uses_temporary_channel_dir() {
        let out = tempfile::tempdir().unwrap();
        let mut config = RigConfig::default();
        config.application.output_dir = out.path().to_path_buf();
        let rig = Rig::build(config).unwrap();
        let dir = rig.channel_dir().to_path_buf();
        assert!(dir.join("camera.frame").exists());
        assert!(dir.join("progress.frame").exists());
        drop(rig);
        assert!(!dir.exists());
    }
}
