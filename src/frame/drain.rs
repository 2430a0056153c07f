//! Headless display consumer.
//!
//! The display is an external collaborator. Without one, a producer would stall
//! on its first unread frame, so the rig attaches a `FrameDrain` to every
//! display-bound channel. It takes each frame as soon as it is ready and keeps
//! only the latest copy for whoever wants to look at it.

use super::{FrameConsumer, FrameShape};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Most recent frame seen by a drain.
#[derive(Debug, Clone)]
pub struct LatestFrame {
    shape: FrameShape,
    rx: watch::Receiver<Option<Arc<Vec<u8>>>>,
}

impl LatestFrame {
    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn get(&self) -> Option<Arc<Vec<u8>>> {
        self.rx.borrow().clone()
    }

    /// Wait for the next frame after the last one observed through this handle.
    pub async fn changed(&mut self) -> Option<Arc<Vec<u8>>> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }
}

/// Background task that empties one channel.
pub struct FrameDrain {
    name: &'static str,
    handle: JoinHandle<u64>,
}

impl FrameDrain {
    /// Spawn a drain on `consumer`, polling every `interval` until `shutdown` turns true.
    pub fn spawn(
        name: &'static str,
        consumer: FrameConsumer,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, LatestFrame) {
        let shape = consumer.shape();
        let (tx, rx) = watch::channel(None);

        let handle = tokio::spawn(async move {
            let mut drained = 0u64;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match consumer.try_take() {
                    Ok(Some(frame)) => {
                        drained += 1;
                        tx.send_replace(Some(Arc::new(frame)));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(drain = name, error = %e, "Frame drain read failed");
                        break;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(drain = name, drained, "Frame drain stopped");
            drained
        });

        (Self { name, handle }, LatestFrame { shape, rx })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the drain to stop; returns the number of frames it took.
    pub async fn join(self) -> u64 {
        self.handle.await.unwrap_or(0)
    }
}
