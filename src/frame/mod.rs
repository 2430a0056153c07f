//! Frame hand-off between units.
//!
//! [`FrameChannel`] is the raw single-slot primitive. Units never hold a bare
//! channel: [`frame_channel`] splits one into a [`FrameProducer`] and a
//! [`FrameConsumer`], neither of which is `Clone`, so each channel has exactly
//! one writer and one reader. Recorders attach as [`FrameObserver`]s and copy
//! the slot without taking part in flow control.

pub mod channel;
pub mod drain;

pub use channel::{FrameChannel, FrameShape};
pub use drain::{FrameDrain, LatestFrame};

use crate::error::FrameError;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Create a channel file and split it into its producer and consumer ends.
///
/// `spin` is the sleep between flag checks in the async `publish`/`take`.
pub fn frame_channel(
    path: &Path,
    shape: FrameShape,
    spin: Duration,
) -> Result<(FrameProducer, FrameConsumer), FrameError> {
    let channel = Arc::new(FrameChannel::create(path, shape)?);
    Ok((
        FrameProducer {
            channel: channel.clone(),
            spin,
        },
        FrameConsumer { channel, spin },
    ))
}

/// Writing end of a frame channel.
#[derive(Debug)]
pub struct FrameProducer {
    channel: Arc<FrameChannel>,
    spin: Duration,
}

impl FrameProducer {
    /// Layout every published frame must have.
    pub fn shape(&self) -> FrameShape {
        self.channel.shape()
    }

    /// Whether the consumer has taken the last frame.
    pub fn may_write(&self) -> bool {
        self.channel.may_write()
    }

    /// Write and publish `frame` if the slot is free. Returns whether it was published.
    pub fn try_publish(&self, frame: &[u8]) -> Result<bool, FrameError> {
        if !self.channel.may_write() {
            return Ok(false);
        }
        self.channel.write(frame)?;
        self.channel.mark_produced();
        Ok(true)
    }

    /// Like [`try_publish`](Self::try_publish) but fills the slot in place.
    pub fn try_publish_with<F>(&self, fill: F) -> Result<bool, FrameError>
    where
        F: FnOnce(&mut [u8]),
    {
        if !self.channel.may_write() {
            return Ok(false);
        }
        self.channel.write_with(fill)?;
        self.channel.mark_produced();
        Ok(true)
    }

    /// Spin until the consumer frees the slot, then publish.
    pub async fn publish(&self, frame: &[u8]) -> Result<(), FrameError> {
        loop {
            if self.try_publish(frame)? {
                return Ok(());
            }
            tokio::time::sleep(self.spin).await;
        }
    }

    /// Like [`publish`](Self::publish) but gives up once `shutdown` turns true.
    /// Returns whether the frame was published.
    pub async fn publish_until(
        &self,
        frame: &[u8],
        shutdown: &watch::Receiver<bool>,
    ) -> Result<bool, FrameError> {
        loop {
            if *shutdown.borrow() {
                return Ok(false);
            }
            if self.try_publish(frame)? {
                return Ok(true);
            }
            tokio::time::sleep(self.spin).await;
        }
    }

    /// Observer handle for recorders.
    pub fn observer(&self) -> FrameObserver {
        FrameObserver {
            channel: self.channel.clone(),
        }
    }

    /// Direct access for joint publication across several channels.
    pub(crate) fn channel(&self) -> &FrameChannel {
        &self.channel
    }
}

/// Reading end of a frame channel.
#[derive(Debug)]
pub struct FrameConsumer {
    channel: Arc<FrameChannel>,
    spin: Duration,
}

impl FrameConsumer {
    /// Layout of every frame taken from this channel.
    pub fn shape(&self) -> FrameShape {
        self.channel.shape()
    }

    /// Whether an unread frame is waiting.
    pub fn may_read(&self) -> bool {
        self.channel.may_read()
    }

    /// Sleep between flag checks.
    pub fn spin(&self) -> Duration {
        self.spin
    }

    /// Take the pending frame, if any, and free the slot.
    pub fn try_take(&self) -> Result<Option<Vec<u8>>, FrameError> {
        self.try_take_with(|frame| frame.to_vec())
    }

    /// Borrow the pending frame, if any, then free the slot.
    pub fn try_take_with<R, F>(&self, f: F) -> Result<Option<R>, FrameError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        if !self.channel.may_read() {
            return Ok(None);
        }
        let out = self.channel.with_frame(f)?;
        self.channel.mark_consumed();
        Ok(Some(out))
    }

    /// Spin until a frame is available and take it.
    pub async fn take(&self) -> Result<Vec<u8>, FrameError> {
        loop {
            if let Some(frame) = self.try_take()? {
                return Ok(frame);
            }
            tokio::time::sleep(self.spin).await;
        }
    }

    /// Observer handle for recorders.
    pub fn observer(&self) -> FrameObserver {
        FrameObserver {
            channel: self.channel.clone(),
        }
    }
}

/// Read-only view of a channel that never touches the ready flag.
#[derive(Debug, Clone)]
pub struct FrameObserver {
    channel: Arc<FrameChannel>,
}

impl FrameObserver {
    /// Layout of the observed channel.
    pub fn shape(&self) -> FrameShape {
        self.channel.shape()
    }

    /// Seqlock-consistent copy of the last written frame.
    pub fn snapshot_into(&self, out: &mut [u8]) -> Result<bool, FrameError> {
        self.channel.snapshot(out)
    }
}

/// One-bit "new frame worth recording" signal from a producer to a recorder.
#[derive(Debug, Clone, Default)]
pub struct RecordSync {
    flag: Arc<AtomicBool>,
}

impl RecordSync {
    /// A lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a new frame as worth recording.
    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns true once per `raise`.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_gated_publish_never_overwrites_unread_frame() {
        let dir = tempdir().unwrap();
        let (producer, consumer) = frame_channel(
            &dir.path().join("gated"),
            FrameShape::gray(1, 1),
            Duration::from_millis(1),
        )
        .unwrap();

        let mut delivered = Vec::new();
        let mut next = 0u8;
        // interleave producer attempts and occasional consumer reads
        for step in 0..100u32 {
            if producer.try_publish(&[next]).unwrap() {
                next = next.wrapping_add(1);
            }
            if step % 3 == 0 {
                if let Some(frame) = consumer.try_take().unwrap() {
                    delivered.push(frame[0]);
                }
            }
        }
        // every published frame is read exactly once, in order
        let expected: Vec<u8> = (0..delivered.len() as u8).collect();
        assert_eq!(delivered, expected);
        assert!(next as usize - delivered.len() <= 1);
    }

    #[tokio::test]
    async fn test_publish_waits_for_consumer() {
        let dir = tempdir().unwrap();
        let (producer, consumer) = frame_channel(
            &dir.path().join("wait"),
            FrameShape::gray(1, 2),
            Duration::from_millis(1),
        )
        .unwrap();

        producer.publish(&[1, 1]).await.unwrap();
        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = consumer.take().await.unwrap();
            let second = consumer.take().await.unwrap();
            (first, second)
        });
        producer.publish(&[2, 2]).await.unwrap();
        let (first, second) = reader.await.unwrap();
        assert_eq!(first, vec![1, 1]);
        assert_eq!(second, vec![2, 2]);
    }

    #[test]
    fn test_record_sync_fires_once() {
        let sync = RecordSync::new();
        assert!(!sync.take());
        sync.raise();
        sync.raise();
        assert!(sync.take());
        assert!(!sync.take());
    }
}
