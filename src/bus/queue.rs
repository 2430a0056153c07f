//! Per-unit command queues and the polling loop that serves them.

use crate::config::BusConfig;
use crate::error::{AppResult, RigError};
use crate::messages::{Command, Envelope, UnitName};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::mpsc;

/// Timeout and idle sleep of a polling loop.
#[derive(Debug, Clone, Copy)]
pub struct PollCadence {
    pub timeout: Duration,
    pub idle: Duration,
}

impl PollCadence {
    pub fn unit(config: &BusConfig) -> Self {
        Self {
            timeout: config.poll_timeout,
            idle: config.unit_idle,
        }
    }

    pub fn router(config: &BusConfig) -> Self {
        Self {
            timeout: config.poll_timeout,
            idle: config.router_idle,
        }
    }
}

/// Create the inbound queue of `unit`.
pub fn command_queue<T>(unit: UnitName) -> (CommandSender<T>, CommandReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender { unit, tx }, CommandReceiver { unit, rx })
}

/// Sending half of a unit's inbound queue. Held by the router.
#[derive(Debug)]
pub struct CommandSender<T> {
    unit: UnitName,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for CommandSender<T> {
    fn clone(&self) -> Self {
        Self {
            unit: self.unit,
            tx: self.tx.clone(),
        }
    }
}

impl<T> CommandSender<T> {
    pub fn unit(&self) -> UnitName {
        self.unit
    }

    pub fn send(&self, command: T) -> AppResult<()> {
        self.tx
            .send(command)
            .map_err(|_| RigError::ChannelClosed(self.unit))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outcome of one poll.
#[derive(Debug)]
pub enum Polled<T> {
    Command(T),
    Empty,
    Closed,
}

/// Receiving half of a unit's inbound queue.
#[derive(Debug)]
pub struct CommandReceiver<T> {
    unit: UnitName,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> CommandReceiver<T> {
    pub fn unit(&self) -> UnitName {
        self.unit
    }

    /// Wait up to `cadence.timeout` for a command; sleeps `cadence.idle` when none came.
    pub async fn poll(&mut self, cadence: PollCadence) -> Polled<T> {
        match tokio::time::timeout(cadence.timeout, self.rx.recv()).await {
            Ok(Some(command)) => Polled::Command(command),
            Ok(None) => Polled::Closed,
            Err(_) => {
                tokio::time::sleep(cadence.idle).await;
                Polled::Empty
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next command; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Serve a queue until the handler breaks or every sender is gone.
///
/// Commands are handled one at a time in arrival order. The handler runs on the
/// polling task, never on the unit's compute loop.
pub async fn poll_commands<T, F>(mut rx: CommandReceiver<T>, cadence: PollCadence, mut handle: F)
where
    T: std::fmt::Debug,
    F: FnMut(T) -> ControlFlow<()>,
{
    let unit = rx.unit();
    loop {
        match rx.poll(cadence).await {
            Polled::Command(command) => {
                tracing::debug!(%unit, ?command, "Command received");
                if handle(command).is_break() {
                    break;
                }
            }
            Polled::Empty => {}
            Polled::Closed => {
                tracing::debug!(%unit, "Command queue closed");
                break;
            }
        }
    }
    tracing::debug!(%unit, "Command poller stopped");
}

/// A unit's handle on the router's inbound queue; tags everything with the unit's name.
#[derive(Debug, Clone)]
pub struct Upstream {
    origin: Option<UnitName>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Upstream {
    pub fn origin(&self) -> Option<UnitName> {
        self.origin
    }

    pub fn send(&self, command: Command) -> AppResult<()> {
        self.tx
            .send(Envelope::new(self.origin, command))
            .map_err(|_| RigError::RouterClosed)
    }

    /// Send and log instead of failing; used where the router going away means shutdown.
    pub fn notify(&self, command: Command) {
        let kind = command.kind();
        if self.send(command).is_err() {
            tracing::warn!(origin = ?self.origin, kind, "Router gone, dropping notification");
        }
    }

    /// Handle for another sender, e.g. the user interface (`None`).
    pub fn with_origin(&self, origin: Option<UnitName>) -> Self {
        Self {
            origin,
            tx: self.tx.clone(),
        }
    }
}

/// The router's inbound queue.
pub fn upstream_queue() -> (Upstream, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Upstream { origin: None, tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RecorderCommand;

    fn fast() -> PollCadence {
        PollCadence {
            timeout: Duration::from_millis(20),
            idle: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_poll_reports_empty_then_command() {
        let (tx, mut rx) = command_queue::<RecorderCommand>(UnitName::RawRecorder);
        assert!(matches!(rx.poll(fast()).await, Polled::Empty));
        tx.send(RecorderCommand::Stop).unwrap();
        assert!(matches!(
            rx.poll(fast()).await,
            Polled::Command(RecorderCommand::Stop)
        ));
        drop(tx);
        assert!(matches!(rx.poll(fast()).await, Polled::Closed));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send_and_ends_on_close() {
        let (tx, mut rx) = command_queue::<u32>(UnitName::Gui);
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(7).unwrap();
        });
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got, Some(7));
        sender.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_poll_commands_is_fifo_and_stops_on_break() {
        let (tx, rx) = command_queue::<u32>(UnitName::Tracker);
        for n in 1..=4 {
            tx.send(n).unwrap();
        }
        let mut seen = Vec::new();
        poll_commands(rx, fast(), |n| {
            seen.push(n);
            if n == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await;
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_send_to_dropped_unit_names_it() {
        let (tx, rx) = command_queue::<u32>(UnitName::Statistics);
        drop(rx);
        let err = tx.send(1).unwrap_err();
        assert!(matches!(err, RigError::ChannelClosed(UnitName::Statistics)));
    }

    #[tokio::test]
    async fn test_upstream_tags_origin() {
        let (gui, mut rx) = upstream_queue();
        let camera = gui.with_origin(Some(UnitName::Camera));
        camera.send(Command::GetBackground).unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.origin, Some(UnitName::Camera));
        assert!(matches!(envelope.command, Command::GetBackground));
    }
}
