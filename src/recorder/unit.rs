//! Video recorder unit.
//!
//! On `Start` the recorder opens its sink, acknowledges the barrier and waits
//! for release. While recording, each raised [`RecordSync`] flag composes one
//! canvas frame and hands it to a blocking writer worker. After the last frame
//! (or `Stop`) it reports `Saving`; the worker drains its queue, closes the
//! sink and reports `Finished`.

use super::canvas::Canvas;
use crate::barrier::BarrierParticipant;
use crate::bus::{poll_commands, CommandReceiver, PollCadence, Upstream};
use crate::config::{BusConfig, RecorderConfig};
use crate::error::AppResult;
use crate::frame::RecordSync;
use crate::messages::{Command, RecorderCommand, TrialParameters, UnitName};
use crate::storage::{trial_path, RawVideoSink, RecordingMeta};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const RECORD_SPIN: Duration = Duration::from_millis(1);

/// Queues and channels one recorder is built from.
pub struct RecorderHandles {
    pub commands: CommandReceiver<RecorderCommand>,
    pub canvas: Canvas,
    pub sync: RecordSync,
    pub upstream: Upstream,
    pub barrier: BarrierParticipant,
}

pub struct RecorderUnit {
    name: UnitName,
    handles: RecorderHandles,
    config: RecorderConfig,
    suffix: String,
    output_dir: PathBuf,
    cadence: PollCadence,
}

impl RecorderUnit {
    /// `suffix` is appended to the trial name to form the recording's file name.
    pub fn new(
        name: UnitName,
        suffix: impl Into<String>,
        config: &RecorderConfig,
        bus: &BusConfig,
        output_dir: PathBuf,
        handles: RecorderHandles,
    ) -> Self {
        Self {
            name,
            handles,
            config: config.clone(),
            suffix: suffix.into(),
            output_dir,
            cadence: PollCadence::unit(bus),
        }
    }

    pub async fn run(self) -> AppResult<()> {
        let RecorderHandles {
            commands,
            canvas,
            sync,
            upstream,
            barrier,
        } = self.handles;
        let name = self.name;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let cadence = self.cadence;
        let poller = tokio::spawn(async move {
            poll_commands(commands, cadence, |command| {
                let exit = matches!(command, RecorderCommand::Exit);
                if inbox_tx.send(command).is_err() || exit {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await;
            shutdown_tx.send_replace(true);
        });

        let mut recorder = Recorder {
            name,
            canvas,
            sync,
            upstream,
            barrier,
            inbox,
            config: self.config,
            suffix: self.suffix,
            output_dir: self.output_dir,
            idle: self.cadence.idle,
            session: None,
            writers: Vec::new(),
        };
        tracing::info!(unit = %name, shape = ?recorder.canvas.shape(), "Recorder started");
        let result = recorder.run(shutdown_rx).await;
        recorder.close().await;
        drop(recorder);

        if result.is_err() {
            poller.abort();
        }
        match poller.await {
            Err(e) if e.is_panic() => tracing::warn!(unit = %name, error = %e, "Recorder command poller panicked"),
            _ => {}
        }
        tracing::info!(unit = %name, "Recorder stopped");
        result
    }
}

/// One trial's recording in progress.
struct Session {
    trial: String,
    frames_wanted: u64,
    frames_queued: u64,
    queue: std_mpsc::Sender<Vec<u8>>,
}

struct Recorder {
    name: UnitName,
    canvas: Canvas,
    sync: RecordSync,
    upstream: Upstream,
    barrier: BarrierParticipant,
    inbox: mpsc::UnboundedReceiver<RecorderCommand>,
    config: RecorderConfig,
    suffix: String,
    output_dir: PathBuf,
    idle: Duration,
    session: Option<Session>,
    writers: Vec<JoinHandle<()>>,
}

impl Recorder {
    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        loop {
            while let Ok(command) = self.inbox.try_recv() {
                match command {
                    RecorderCommand::Start(params) => self.start(params).await,
                    RecorderCommand::Stop => self.finish("stopped"),
                    RecorderCommand::Exit => {
                        self.finish("exiting");
                        return Ok(());
                    }
                }
            }
            if *shutdown.borrow_and_update() && self.inbox.is_empty() {
                return Ok(());
            }

            if self.session.is_none() {
                tokio::select! {
                    _ = tokio::time::sleep(self.idle) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            if self.sync.take() {
                self.record_frame()?;
            } else {
                tokio::time::sleep(RECORD_SPIN).await;
            }
        }
    }

    async fn start(&mut self, params: TrialParameters) {
        if self.session.is_some() {
            tracing::warn!(unit = %self.name, "Start during a recording, closing it first");
            self.finish("restarted");
        }
        let frames_wanted = (params.duration_seconds * self.config.framerate).round().max(0.0) as u64;
        let path = trial_path(&self.output_dir, &params.name, &self.suffix);
        let sink = RawVideoSink::create(&path, self.canvas.shape(), self.config.framerate);

        // Acknowledge even without a sink so the other units are not held up.
        let released = self.barrier.acknowledge_and_wait().await;
        let sink = match (released, sink) {
            (Ok(_), Ok(sink)) => sink,
            (Err(e), _) => {
                tracing::warn!(unit = %self.name, error = %e, "Recording start cancelled");
                return;
            }
            (Ok(_), Err(e)) => {
                tracing::error!(unit = %self.name, error = %e, "Failed to open recording");
                self.upstream.notify(Command::Error {
                    destination: UnitName::Gui,
                    reason: format!("{}: {e:#}", self.name),
                });
                self.upstream.notify(Command::Saving);
                self.upstream.notify(Command::Finished);
                return;
            }
        };

        // frames raised before release belong to no trial
        self.sync.take();
        let (queue, frames) = std_mpsc::channel();
        self.writers.push(spawn_writer(
            self.name,
            sink,
            frames,
            self.config.worker_timeout,
            self.upstream.clone(),
        ));
        self.writers.retain(|writer| !writer.is_finished());
        tracing::info!(unit = %self.name, trial = %params.name, frames_wanted, path = %path.display(), "Recording");
        self.session = Some(Session {
            trial: params.name,
            frames_wanted,
            frames_queued: 0,
            queue,
        });
        if frames_wanted == 0 {
            self.finish("complete");
        }
    }

    fn record_frame(&mut self) -> AppResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.frames_queued >= session.frames_wanted {
            self.finish("complete");
            return Ok(());
        }
        let frame = self.canvas.compose()?.to_vec();
        if session.queue.send(frame).is_err() {
            tracing::error!(unit = %self.name, "Writer worker gone, ending recording");
            self.finish("writer lost");
            return Ok(());
        }
        session.frames_queued += 1;
        if session.frames_queued >= session.frames_wanted {
            self.finish("complete");
        }
        Ok(())
    }

    /// Stop queueing frames. The worker finishes the file on its own.
    fn finish(&mut self, reason: &'static str) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::info!(
            unit = %self.name,
            trial = %session.trial,
            frames = session.frames_queued,
            reason,
            "Recording ended, saving"
        );
        self.upstream.notify(Command::Saving);
        // dropping the sender lets the worker drain and exit
        drop(session.queue);
    }

    async fn close(&mut self) {
        for writer in self.writers.drain(..) {
            if let Err(e) = writer.await {
                tracing::warn!(unit = %self.name, error = %e, "Recording writer panicked");
            }
        }
    }
}

/// Blocking worker that appends queued frames and closes the sink once the
/// queue is drained and its sender dropped.
fn spawn_writer(
    unit: UnitName,
    mut sink: RawVideoSink,
    frames: std_mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
    upstream: Upstream,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let written = loop {
            match frames.recv_timeout(timeout) {
                Ok(frame) => {
                    if let Err(e) = sink.write_frame(&frame) {
                        break Err(e);
                    }
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    tracing::trace!(%unit, frames = sink.frame_count(), "Writer idle");
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break Ok(()),
            }
        };
        let closed: anyhow::Result<RecordingMeta> = written.and_then(|()| sink.finish());
        if let Err(e) = closed {
            tracing::error!(%unit, error = %e, "Failed to save recording");
            upstream.notify(Command::Error {
                destination: UnitName::Gui,
                reason: format!("{unit}: {e:#}"),
            });
        }
        upstream.notify(Command::Finished);
    })
}
