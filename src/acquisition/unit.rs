//! Camera unit loop.
//!
//! Frames go out at the configured rate whenever the tracker has freed the
//! slot. A live source that drops out is closed, reported to the tracker, and
//! reconnected every `reconnect_interval`. A recording that fails is closed and
//! reported once, then stays idle until the next source switch. Switching
//! sources triggers a fresh background once the first frame of the new source
//! has gone out.

use super::{FrameSource, RawFileSource};
use crate::bus::{poll_commands, CommandReceiver, PollCadence, Upstream};
use crate::config::{BusConfig, CameraConfig, SourceKind};
use crate::error::{AppResult, SourceError};
use crate::frame::{FrameProducer, RecordSync};
use crate::messages::{CameraCommand, Command, UnitName};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

pub struct CameraHandles {
    pub commands: CommandReceiver<CameraCommand>,
    pub output: FrameProducer,
    /// Raised for the raw recorder after every published frame
    pub record_sync: RecordSync,
    pub upstream: Upstream,
}

pub struct CameraUnit {
    camera: Box<dyn FrameSource>,
    handles: CameraHandles,
    config: CameraConfig,
    cadence: PollCadence,
}

impl CameraUnit {
    /// `camera` is the live source used whenever no recording is selected.
    pub fn new(
        camera: Box<dyn FrameSource>,
        config: &CameraConfig,
        bus: &BusConfig,
        handles: CameraHandles,
    ) -> Self {
        Self {
            camera,
            handles,
            config: config.clone(),
            cadence: PollCadence::unit(bus),
        }
    }

    pub async fn run(self) -> AppResult<()> {
        let CameraHandles {
            commands,
            output,
            record_sync,
            upstream,
        } = self.handles;

        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
        let cadence = self.cadence;
        let poller = tokio::spawn(async move {
            poll_commands(commands, cadence, |command| {
                let exit = matches!(command, CameraCommand::Exit);
                if inbox_tx.send(command).is_err() || exit {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await;
            shutdown_tx.send_replace(true);
        });

        let mut sources = Sources {
            camera: self.camera,
            file: None,
            output: output.shape(),
            fresh: false,
        };
        if let Err(e) = sources.camera.connect() {
            tracing::warn!(error = %e, "Camera not available at startup");
            report_camera_error(&upstream, &e);
        }
        if let (SourceKind::File, Some(path)) = (self.config.source, &self.config.video_path) {
            sources.select(Some(path.clone()), &upstream);
        }

        let mut pace = tokio::time::interval(Duration::from_secs_f64(1.0 / self.config.framerate.max(1.0)));
        pace.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut frame = vec![0u8; output.shape().len()];
        let mut published = 0u64;
        tracing::info!(source = sources.active().name(), framerate = self.config.framerate, "Camera started");

        'frames: loop {
            while let Ok(command) = inbox.try_recv() {
                match command {
                    CameraCommand::SetVideoSource(path) => sources.select(path, &upstream),
                    CameraCommand::Exit => break 'frames,
                }
            }
            if *shutdown.borrow_and_update() {
                break;
            }

            let active = sources.active();
            let (live, connected) = (active.is_live(), active.is_connected());
            if live && !connected {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                    _ = shutdown.changed() => continue,
                }
                match sources.active().connect() {
                    Ok(()) => tracing::info!("Camera reconnected"),
                    Err(e) => tracing::debug!(error = %e, "Camera still unavailable"),
                }
                continue;
            }
            if !live && !connected {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.exhausted_retry) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            tokio::select! {
                _ = pace.tick() => {}
                _ = shutdown.changed() => continue,
            }
            if !output.may_write() {
                continue;
            }
            match sources.active().next_frame(&mut frame) {
                Ok(()) => {
                    if output.try_publish(&frame)? {
                        published += 1;
                        record_sync.raise();
                        if std::mem::take(&mut sources.fresh) {
                            upstream.notify(Command::GetBackground);
                        }
                    }
                }
                Err(SourceError::Exhausted) => {
                    tokio::time::sleep(self.config.exhausted_retry).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, source = sources.active().name(), "Frame source failed");
                    sources.active().close();
                    report_camera_error(&upstream, &e);
                }
            }
        }

        sources.camera.close();
        if let Some(file) = sources.file.as_mut() {
            file.close();
        }
        if let Err(e) = poller.await {
            if e.is_panic() {
                tracing::warn!(error = %e, "Camera command poller panicked");
            }
        }
        tracing::info!(published, "Camera stopped");
        Ok(())
    }
}

fn report_camera_error(upstream: &Upstream, error: &SourceError) {
    upstream.notify(Command::Error {
        destination: UnitName::Tracker,
        reason: error.to_string(),
    });
}

struct Sources {
    camera: Box<dyn FrameSource>,
    file: Option<RawFileSource>,
    output: crate::frame::FrameShape,
    /// A source switch happened and no frame of the new source went out yet
    fresh: bool,
}

impl Sources {
    fn active(&mut self) -> &mut dyn FrameSource {
        match self.file.as_mut() {
            Some(file) => file,
            None => self.camera.as_mut(),
        }
    }

    fn select(&mut self, path: Option<PathBuf>, upstream: &Upstream) {
        match path {
            None => {
                if let Some(mut file) = self.file.take() {
                    file.close();
                }
                tracing::info!("Video source set to camera");
            }
            Some(path) => match RawFileSource::open(&path, self.output) {
                Ok(file) => {
                    tracing::info!(path = %path.display(), "Video source set to recording");
                    if let Some(mut old) = self.file.replace(file) {
                        old.close();
                    }
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Cannot open recording");
                    upstream.notify(Command::Error {
                        destination: UnitName::Gui,
                        reason: format!("{}: {e}", path.display()),
                    });
                    return;
                }
            },
        }
        self.fresh = true;
    }
}
