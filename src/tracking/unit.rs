//! Tracker unit: background calibration, detection and the processed display stream.
//!
//! Three tasks cooperate:
//!
//! - the command poller, the only writer of [`TrackerView`]
//! - the compute loop, which takes camera frames, runs detection, sends one
//!   [`Coordinate`] per tracked frame and queues the rendered frame
//! - the submitter, which drains that unbounded queue into the gated output
//!   channel and raises the processed recorder's sync flag
//!
//! The compute loop never waits on the display consumer.

use super::background::{BackgroundModel, Calibration};
use super::detector::{detect, DetectorSettings};
use super::overlay::{calibration_frame, camera_error_frame, crop_display, render_tracked, Overlay};
use super::trail::Trail;
use crate::bus::{poll_commands, CommandReceiver, PollCadence, Upstream};
use crate::config::{BusConfig, TrackerConfig};
use crate::error::{AppResult, FrameError, RigError};
use crate::frame::{FrameConsumer, FrameProducer, FrameShape, RecordSync};
use crate::messages::{Bounds, Command, Coordinate, TargetParams, TrackerCommand, UnitName};
use image::{GrayImage, RgbImage};
use std::ops::ControlFlow;
use tokio::sync::{mpsc, watch};

/// Settings the poller publishes to the compute loop. Readers tolerate a value
/// that is one frame stale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerView {
    pub target: Option<TargetParams>,
    pub bounds: Option<Bounds>,
    /// Crop the displayed frame to the bounds too
    pub show_tracked: bool,
    /// Bumped on every recalibration request
    pub recalibrations: u64,
    /// Bumped on every camera error report
    pub errors: u64,
}

impl TrackerView {
    /// Apply one command. `Break` on exit.
    pub fn apply(&mut self, command: TrackerCommand) -> ControlFlow<()> {
        match command {
            TrackerCommand::SetBounds(bounds) => self.bounds = bounds,
            TrackerCommand::ShowTracked => self.show_tracked = !self.show_tracked,
            TrackerCommand::GetBackground => self.recalibrations += 1,
            TrackerCommand::DrawTarget(target) => self.target = target,
            TrackerCommand::SetTargetRadius(radius) => {
                if let Some(target) = self.target.as_mut() {
                    target.radius = radius;
                }
            }
            TrackerCommand::ShowError => self.errors += 1,
            TrackerCommand::Exit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}

/// Channels and queues the tracker is built from.
pub struct TrackerHandles {
    pub commands: CommandReceiver<TrackerCommand>,
    pub input: FrameConsumer,
    pub output: FrameProducer,
    pub coordinates: mpsc::UnboundedSender<Coordinate>,
    pub upstream: Upstream,
    pub record_sync: RecordSync,
}

pub struct TrackerUnit {
    handles: TrackerHandles,
    config: TrackerConfig,
    cadence: PollCadence,
}

impl TrackerUnit {
    pub fn new(config: &TrackerConfig, bus: &BusConfig, handles: TrackerHandles) -> AppResult<Self> {
        let input = handles.input.shape();
        let output = handles.output.shape();
        if input.channels != 1 || output != FrameShape::rgb(input.rows, input.cols) {
            return Err(RigError::Frame(FrameError::SizeMismatch {
                expected: FrameShape::rgb(input.rows, input.cols).len(),
                actual: output.len(),
            }));
        }
        Ok(Self {
            handles,
            config: config.clone(),
            cadence: PollCadence::unit(bus),
        })
    }

    pub async fn run(self) -> AppResult<()> {
        let TrackerHandles {
            commands,
            input,
            output,
            coordinates,
            upstream,
            record_sync,
        } = self.handles;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (view_tx, view_rx) = watch::channel(TrackerView::default());

        let cadence = self.cadence;
        let poller = tokio::spawn(async move {
            poll_commands(commands, cadence, |command| {
                let mut flow = ControlFlow::Continue(());
                view_tx.send_modify(|view| flow = view.apply(command));
                flow
            })
            .await;
            shutdown_tx.send_replace(true);
        });

        let (display_tx, display_rx) = mpsc::unbounded_channel();
        let submitter = tokio::spawn(submit_frames(
            output,
            display_rx,
            record_sync,
            shutdown_rx.clone(),
        ));

        let mut compute = ComputeLoop::new(&self.config, input.shape(), coordinates, upstream, display_tx);
        let result = compute.run(input, view_rx, shutdown_rx).await;
        drop(compute);

        let submitted = submitter.await.unwrap_or(0);
        if result.is_err() {
            poller.abort();
        }
        match poller.await {
            Err(e) if e.is_panic() => tracing::warn!(error = %e, "Tracker command poller panicked"),
            _ => {}
        }
        tracing::info!(submitted, "Tracker stopped");
        result
    }
}

/// Move queued display frames into the gated output channel.
async fn submit_frames(
    output: FrameProducer,
    mut queue: mpsc::UnboundedReceiver<RgbImage>,
    record_sync: RecordSync,
    shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut submitted = 0;
    while let Some(frame) = queue.recv().await {
        match output.publish_until(frame.as_raw(), &shutdown).await {
            Ok(true) => {
                submitted += 1;
                record_sync.raise();
            }
            Ok(false) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to submit processed frame");
                break;
            }
        }
    }
    submitted
}

struct ComputeLoop {
    shape: FrameShape,
    model: BackgroundModel,
    trail: Trail,
    detector: DetectorSettings,
    coordinates: mpsc::UnboundedSender<Coordinate>,
    upstream: Upstream,
    display: mpsc::UnboundedSender<RgbImage>,
    applied: TrackerView,
}

impl ComputeLoop {
    fn new(
        config: &TrackerConfig,
        shape: FrameShape,
        coordinates: mpsc::UnboundedSender<Coordinate>,
        upstream: Upstream,
        display: mpsc::UnboundedSender<RgbImage>,
    ) -> Self {
        Self {
            shape,
            model: BackgroundModel::new(shape.cols, shape.rows, config.calibration_frames),
            trail: Trail::new(
                config.trail_capacity,
                config.direction_lookback,
                config.direction_threshold,
            ),
            detector: DetectorSettings::from(config),
            coordinates,
            upstream,
            display,
            applied: TrackerView::default(),
        }
    }

    async fn run(
        &mut self,
        input: FrameConsumer,
        view: watch::Receiver<TrackerView>,
        shutdown: watch::Receiver<bool>,
    ) -> AppResult<()> {
        tracing::info!(
            rows = self.shape.rows,
            cols = self.shape.cols,
            calibration_frames = self.model.frames_needed(),
            "Tracker started"
        );
        let spin = input.spin();
        let (width, height) = (self.shape.cols, self.shape.rows);

        while !*shutdown.borrow() {
            let current = view.borrow().clone();
            self.apply_view(current);

            let frame = input.try_take_with(|bytes| GrayImage::from_raw(width, height, bytes.to_vec()))?;
            match frame {
                Some(Some(frame)) => self.process(&frame)?,
                Some(None) => {
                    return Err(RigError::Processing(
                        "camera frame does not match the tracker shape".to_string(),
                    ))
                }
                None => tokio::time::sleep(spin).await,
            }
        }
        Ok(())
    }

    fn apply_view(&mut self, view: TrackerView) {
        if view == self.applied {
            return;
        }
        if view.bounds != self.applied.bounds {
            // the new background is published once recalibration completes
            tracing::info!(bounds = ?view.bounds, "Tracking bounds changed, recalibrating");
            self.model.set_bounds(view.bounds);
            self.recalibrate();
        }
        if view.recalibrations != self.applied.recalibrations {
            tracing::info!("Background requested, recalibrating");
            self.recalibrate();
        }
        if view.errors != self.applied.errors {
            tracing::warn!("Camera error reported, showing error frame");
            self.trail.clear();
            self.queue(camera_error_frame(self.shape.cols, self.shape.rows));
        }
        self.applied = view;
    }

    fn recalibrate(&mut self) {
        self.model.reset();
        self.trail.clear();
    }

    fn process(&mut self, frame: &GrayImage) -> AppResult<()> {
        if !self.model.is_ready() {
            return self.calibrate(frame);
        }
        let Some(background) = self.model.background() else {
            return Ok(());
        };
        let bounds = self.applied.bounds;
        let detection = detect(frame, background, bounds.as_ref(), &self.detector)?;
        let coordinate = detection.coordinate;
        if self.coordinates.send(coordinate).is_err() {
            tracing::debug!("Coordinate queue closed");
        }
        if let Some(point) = coordinate.position() {
            self.trail.push(point);
        }

        let shown = if self.applied.show_tracked {
            crop_display(frame, bounds.as_ref())
        } else {
            frame.clone()
        };
        let rendered = render_tracked(
            &shown,
            &Overlay {
                coordinate,
                trail: &self.trail,
                target: self.applied.target.as_ref(),
                bounds: bounds.as_ref(),
            },
        );
        self.queue(rendered);
        Ok(())
    }

    fn calibrate(&mut self, frame: &GrayImage) -> AppResult<()> {
        self.trail.clear();
        match self.model.accumulate(frame)? {
            Calibration::InProgress { accumulated, total } => {
                tracing::debug!(accumulated, total, "Acquiring background");
                self.queue(calibration_frame(
                    self.shape.cols,
                    self.shape.rows,
                    accumulated,
                    total,
                ));
            }
            Calibration::Complete => {
                if let Some(pair) = self.model.pair() {
                    self.upstream.notify(Command::NewBackground(pair));
                }
                self.upstream.notify(Command::ClearMaps);
                let total = self.model.frames_needed();
                self.queue(calibration_frame(self.shape.cols, self.shape.rows, total, total));
            }
        }
        Ok(())
    }

    fn queue(&self, frame: RgbImage) {
        if self.display.send(frame).is_err() {
            tracing::debug!(unit = %UnitName::Tracker, "Display queue closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_applies_commands() {
        let mut view = TrackerView::default();
        let target = TargetParams {
            center: (10, 10),
            normalized_center: (0.1, 0.1),
            radius: 5,
        };
        assert!(view.apply(TrackerCommand::DrawTarget(Some(target))).is_continue());
        assert!(view.apply(TrackerCommand::SetTargetRadius(9)).is_continue());
        assert_eq!(view.target.unwrap().radius, 9);

        view.apply(TrackerCommand::ShowTracked);
        assert!(view.show_tracked);
        view.apply(TrackerCommand::ShowTracked);
        assert!(!view.show_tracked);

        view.apply(TrackerCommand::GetBackground);
        view.apply(TrackerCommand::GetBackground);
        assert_eq!(view.recalibrations, 2);

        assert!(view.apply(TrackerCommand::Exit).is_break());
    }

    /// For each published background, whether its corner was cropped away.
    fn published_backgrounds(inbox: &mut mpsc::UnboundedReceiver<crate::messages::Envelope>) -> Vec<bool> {
        let mut cropped = Vec::new();
        while let Ok(envelope) = inbox.try_recv() {
            if let Command::NewBackground(pair) = envelope.command {
                cropped.push(pair.bounded.get_pixel(0, 0).0[0] == 0);
            }
        }
        cropped
    }

    #[test]
    fn test_bounds_change_publishes_one_background() {
        let config = TrackerConfig {
            calibration_frames: 2,
            ..TrackerConfig::default()
        };
        let shape = FrameShape::gray(16, 16);
        let (coordinates, _coordinates_rx) = mpsc::unbounded_channel();
        let (display, _display_rx) = mpsc::unbounded_channel();
        let (upstream, mut inbox) = crate::bus::upstream_queue();
        let mut compute = ComputeLoop::new(&config, shape, coordinates, upstream, display);
        let frame = GrayImage::from_pixel(16, 16, image::Luma([50]));

        for _ in 0..2 {
            compute.process(&frame).unwrap();
        }
        assert_eq!(published_backgrounds(&mut inbox), vec![false]);

        let bounds = Bounds::from_points((4, 4), (12, 12));
        compute.apply_view(TrackerView {
            bounds: Some(bounds),
            ..TrackerView::default()
        });
        assert!(!compute.model.is_ready());
        assert!(published_backgrounds(&mut inbox).is_empty());

        for _ in 0..2 {
            compute.process(&frame).unwrap();
        }
        assert_eq!(published_backgrounds(&mut inbox), vec![true]);
    }

    #[test]
    fn test_radius_without_target_is_ignored() {
        let mut view = TrackerView::default();
        view.apply(TrackerCommand::SetTargetRadius(12));
        assert_eq!(view.target, None);
    }
}
