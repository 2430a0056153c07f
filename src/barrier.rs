//! Synchronized trial start.
//!
//! The router owns a [`StartBarrier`] and an [`AckCollector`]; every unit that
//! runs on the trial clock owns a [`BarrierParticipant`]. One start goes:
//!
//! 1. Router `arm()`s the barrier (IDLE -> AWAITING_ACKS, new generation) and
//!    sends `Start` to each participant.
//! 2. Each participant finishes its own setup, then
//!    [`BarrierParticipant::acknowledge_and_wait`] sends one ack on its private
//!    channel and blocks on the shared phase.
//! 3. Router collects one ack per participant for this generation, in any order,
//!    then `release()`s (AWAITING_ACKS -> RELEASED).
//! 4. Every waiting participant wakes on the same phase change and stamps its
//!    trial start.
//!
//! `clear()` returns to IDLE; a participant still waiting then gets
//! [`BarrierError::Cancelled`].

use crate::error::BarrierError;
use crate::messages::UnitName;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Idle,
    AwaitingAcks,
    Released,
}

/// Barrier state tagged with the start it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierPhase {
    pub generation: u64,
    pub state: BarrierState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ack {
    unit: UnitName,
    generation: u64,
}

/// Shared readiness event, written only by the router.
#[derive(Debug)]
pub struct StartBarrier {
    tx: watch::Sender<BarrierPhase>,
}

impl Default for StartBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl StartBarrier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(BarrierPhase {
            generation: 0,
            state: BarrierState::Idle,
        });
        Self { tx }
    }

    /// Enter AWAITING_ACKS for a new start; returns its generation.
    pub fn arm(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|phase| {
            phase.generation += 1;
            phase.state = BarrierState::AwaitingAcks;
            generation = phase.generation;
        });
        tracing::debug!(generation, "Start barrier armed");
        generation
    }

    pub fn release(&self) {
        self.tx.send_modify(|phase| phase.state = BarrierState::Released);
        tracing::debug!(generation = self.phase().generation, "Start barrier released");
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|phase| {
            if phase.state == BarrierState::Idle {
                false
            } else {
                phase.state = BarrierState::Idle;
                true
            }
        });
    }

    pub fn phase(&self) -> BarrierPhase {
        *self.tx.borrow()
    }

    /// Create the private acknowledgment channel of `unit`.
    pub fn participant(&self, unit: UnitName) -> (BarrierParticipant, AckReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            BarrierParticipant {
                unit,
                phase: self.tx.subscribe(),
                ack: tx,
            },
            AckReceiver { unit, rx },
        )
    }
}

/// Participant side: one private ack sender plus a view of the shared phase.
#[derive(Debug)]
pub struct BarrierParticipant {
    unit: UnitName,
    phase: watch::Receiver<BarrierPhase>,
    ack: mpsc::UnboundedSender<Ack>,
}

impl BarrierParticipant {
    pub fn unit(&self) -> UnitName {
        self.unit
    }

    pub fn phase(&self) -> BarrierPhase {
        *self.phase.borrow()
    }

    /// Acknowledge the pending start and block until it is released.
    ///
    /// Returns the instant the release was observed. Fails with `Cancelled` if no
    /// start is pending or the barrier is cleared or re-armed first.
    pub async fn acknowledge_and_wait(&mut self) -> Result<Instant, BarrierError> {
        let phase = *self.phase.borrow_and_update();
        if phase.state != BarrierState::AwaitingAcks {
            return Err(BarrierError::Cancelled);
        }
        let generation = phase.generation;
        self.ack
            .send(Ack {
                unit: self.unit,
                generation,
            })
            .map_err(|_| BarrierError::AckChannelClosed(self.unit))?;
        tracing::debug!(unit = %self.unit, generation, "Acknowledged start, waiting for release");

        loop {
            let phase = *self.phase.borrow_and_update();
            if phase.generation != generation {
                return Err(BarrierError::Cancelled);
            }
            match phase.state {
                BarrierState::Released => return Ok(Instant::now()),
                BarrierState::Idle => return Err(BarrierError::Cancelled),
                BarrierState::AwaitingAcks => {
                    self.phase
                        .changed()
                        .await
                        .map_err(|_| BarrierError::Cancelled)?;
                }
            }
        }
    }
}

/// Router side of one participant's ack channel.
#[derive(Debug)]
pub struct AckReceiver {
    unit: UnitName,
    rx: mpsc::UnboundedReceiver<Ack>,
}

impl AckReceiver {
    pub fn unit(&self) -> UnitName {
        self.unit
    }

    async fn next_ack(&mut self, generation: u64) -> Result<UnitName, BarrierError> {
        loop {
            match self.rx.recv().await {
                Some(ack) if ack.generation == generation => return Ok(ack.unit),
                Some(stale) => {
                    tracing::debug!(
                        unit = %stale.unit,
                        stale = stale.generation,
                        current = generation,
                        "Discarding stale acknowledgment"
                    );
                }
                None => return Err(BarrierError::AckChannelClosed(self.unit)),
            }
        }
    }
}

/// Collects one ack from every participant.
#[derive(Debug, Default)]
pub struct AckCollector {
    receivers: Vec<AckReceiver>,
}

impl AckCollector {
    pub fn new(receivers: Vec<AckReceiver>) -> Self {
        Self { receivers }
    }

    pub fn participants(&self) -> Vec<UnitName> {
        self.receivers.iter().map(AckReceiver::unit).collect()
    }

    /// Wait for every participant to ack `generation`, bounded by `timeout` when set.
    pub async fn collect(
        &mut self,
        generation: u64,
        timeout: Option<Duration>,
    ) -> Result<(), BarrierError> {
        let expected: BTreeSet<UnitName> = self.receivers.iter().map(AckReceiver::unit).collect();
        let mut acked = BTreeSet::new();

        let gather = async {
            let mut pending: FuturesUnordered<_> = self
                .receivers
                .iter_mut()
                .map(|receiver| receiver.next_ack(generation))
                .collect();
            while let Some(result) = pending.next().await {
                let unit = result?;
                tracing::debug!(%unit, generation, "Start acknowledged");
                acked.insert(unit);
            }
            Ok::<(), BarrierError>(())
        };

        match timeout {
            None => gather.await,
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, gather).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(BarrierError::AckTimeout(
                        expected.difference(&acked).copied().collect(),
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig(units: &[UnitName]) -> (StartBarrier, Vec<BarrierParticipant>, AckCollector) {
        let barrier = StartBarrier::new();
        let mut participants = Vec::new();
        let mut receivers = Vec::new();
        for &unit in units {
            let (participant, receiver) = barrier.participant(unit);
            participants.push(participant);
            receivers.push(receiver);
        }
        (barrier, participants, AckCollector::new(receivers))
    }

    #[tokio::test]
    async fn test_release_only_after_all_acks() {
        let (barrier, participants, mut collector) = rig(&UnitName::TRIAL_PARTICIPANTS);
        let generation = barrier.arm();

        let mut handles = Vec::new();
        for (i, mut participant) in participants.into_iter().enumerate() {
            handles.push(tokio::spawn(async move {
                // unequal setup latency
                tokio::time::sleep(Duration::from_millis(10 * (3 - i as u64))).await;
                participant.acknowledge_and_wait().await
            }));
        }

        collector.collect(generation, None).await.unwrap();
        for handle in &handles {
            assert!(!handle.is_finished());
        }
        barrier.release();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_missing_ack_times_out_with_names() {
        let (barrier, mut participants, mut collector) =
            rig(&[UnitName::Statistics, UnitName::RawRecorder]);
        let generation = barrier.arm();

        let mut stats = participants.remove(0);
        let waiter = tokio::spawn(async move { stats.acknowledge_and_wait().await });

        let err = collector
            .collect(generation, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err, BarrierError::AckTimeout(vec![UnitName::RawRecorder]));

        barrier.clear();
        assert_eq!(waiter.await.unwrap(), Err(BarrierError::Cancelled));
    }

    #[tokio::test]
    async fn test_stale_acks_are_discarded() {
        let (barrier, mut participants, mut collector) = rig(&[UnitName::ProcessedRecorder]);
        let first = barrier.arm();
        let mut recorder = participants.remove(0);

        // ack the first start, then give up waiting on it
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), recorder.acknowledge_and_wait()).await;
        assert!(abandoned.is_err());

        let second = barrier.arm();
        assert_ne!(first, second);

        // the old ack must not satisfy the new generation
        let timed_out = collector
            .collect(second, Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(timed_out, Err(BarrierError::AckTimeout(_))));

        let waiter = tokio::spawn(async move { recorder.acknowledge_and_wait().await });
        collector.collect(second, None).await.unwrap();
        barrier.release();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ack_without_pending_start_is_cancelled() {
        let (_barrier, mut participants, _collector) = rig(&[UnitName::Statistics]);
        let result = participants[0].acknowledge_and_wait().await;
        assert_eq!(result, Err(BarrierError::Cancelled));
    }
}
