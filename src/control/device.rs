//! Stimulus hardware.
//!
//! [`StimulusDevice`] is the pin-level boundary. [`StimulusLink`] wraps one
//! device for the statistics unit: pulses run on a blocking worker so a tick is
//! never held up by serial latency, and a periodic heartbeat on the status pin
//! detects a lost board.

use crate::config::StimulusConfig;
use crate::error::DeviceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Digital output pins on an external board.
pub trait StimulusDevice: Send {
    fn connect(&mut self) -> Result<(), DeviceError>;

    fn is_connected(&self) -> bool;

    fn write_pin(&mut self, pin: u8, high: bool) -> Result<(), DeviceError>;

    fn close(&mut self);
}

type SharedDevice = Arc<Mutex<Box<dyn StimulusDevice>>>;

/// One device plus the connection flag the statistics unit reports on.
///
/// Every call into the device runs on a blocking worker. The compute loop only
/// starts work and reads the connection flag.
pub struct StimulusLink {
    device: SharedDevice,
    connected: Arc<AtomicBool>,
    stimulus_pin: u8,
    status_pin: u8,
    on_duration: Duration,
    /// Heartbeat period, also the minimum gap between reconnect attempts
    heartbeat_interval: Duration,
    last_heartbeat: Option<Instant>,
    last_connect_attempt: Option<Instant>,
    heartbeat_level: bool,
    /// In-flight connect or heartbeat write
    io: Option<JoinHandle<()>>,
}

impl StimulusLink {
    pub fn new(device: Box<dyn StimulusDevice>, config: &StimulusConfig) -> Self {
        let connected = device.is_connected();
        Self {
            device: Arc::new(Mutex::new(device)),
            connected: Arc::new(AtomicBool::new(connected)),
            stimulus_pin: config.stimulus_pin,
            status_pin: config.status_pin,
            on_duration: config.on_duration,
            heartbeat_interval: config.heartbeat_interval,
            last_heartbeat: None,
            last_connect_attempt: None,
            heartbeat_level: false,
            io: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn io_busy(&mut self) -> bool {
        if self.io.as_ref().is_some_and(|io| !io.is_finished()) {
            return true;
        }
        self.io = None;
        false
    }

    fn due(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
        last.map_or(true, |last| now.saturating_duration_since(last) >= interval)
    }

    /// Start a reconnect attempt if the link is down. At most one attempt per
    /// heartbeat interval; the result shows up in [`is_connected`](Self::is_connected).
    pub fn ensure_connected(&mut self, now: Instant) {
        if self.is_connected()
            || self.io_busy()
            || !Self::due(self.last_connect_attempt, now, self.heartbeat_interval)
        {
            return;
        }
        self.last_connect_attempt = Some(now);
        let device = self.device.clone();
        let connected = self.connected.clone();
        self.io = Some(tokio::task::spawn_blocking(move || {
            match device.blocking_lock().connect() {
                Ok(()) => {
                    tracing::info!("Stimulus device connected");
                    connected.store(true, Ordering::Release);
                }
                Err(e) => tracing::debug!(error = %e, "Stimulus device still unavailable"),
            }
        }));
    }

    /// Toggle the status pin once per heartbeat interval; a failed write marks
    /// the link disconnected.
    pub fn heartbeat(&mut self, now: Instant) {
        if !self.is_connected()
            || self.io_busy()
            || !Self::due(self.last_heartbeat, now, self.heartbeat_interval)
        {
            return;
        }
        self.last_heartbeat = Some(now);
        self.heartbeat_level = !self.heartbeat_level;
        let device = self.device.clone();
        let connected = self.connected.clone();
        let (pin, level) = (self.status_pin, self.heartbeat_level);
        self.io = Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = device.blocking_lock().write_pin(pin, level) {
                tracing::warn!(error = %e, pin, "Heartbeat failed, stimulus device lost");
                connected.store(false, Ordering::Release);
            }
        }));
    }

    /// Wait for the in-flight connect or heartbeat write, if any.
    pub async fn settle(&mut self) {
        if let Some(io) = self.io.take() {
            if let Err(e) = io.await {
                tracing::warn!(error = %e, "Stimulus device worker panicked");
            }
        }
    }

    /// Drive the stimulus pin high for the ON duration on a blocking worker.
    pub fn pulse(&self) -> JoinHandle<()> {
        let device = self.device.clone();
        let connected = self.connected.clone();
        let pin = self.stimulus_pin;
        let on = self.on_duration;
        tokio::task::spawn_blocking(move || {
            let write = |high: bool| {
                let result = device.blocking_lock().write_pin(pin, high);
                if let Err(e) = &result {
                    tracing::warn!(error = %e, pin, high, "Stimulus pulse write failed");
                    connected.store(false, Ordering::Release);
                }
                result
            };
            if write(true).is_ok() {
                std::thread::sleep(on);
                let _ = write(false);
            }
        })
    }

    /// Close the device once no pulse or heartbeat is in flight.
    pub async fn close(&mut self) {
        self.settle().await;
        self.device.lock().await.close();
        self.connected.store(false, Ordering::Release);
    }
}

// ============================================================================
// Firmata board over a serial line
// ============================================================================

#[cfg(feature = "instrument_serial")]
mod serial {
    use super::*;
    use serialport::SerialPort;
    use std::io::Write;

    const SET_PIN_MODE: u8 = 0xF4;
    const SET_DIGITAL_PIN_VALUE: u8 = 0xF5;
    const MODE_OUTPUT: u8 = 0x01;

    /// Board running standard Firmata, written with single-pin digital messages.
    pub struct SerialPinDevice {
        port_name: String,
        baud_rate: u32,
        output_pins: Vec<u8>,
        port: Option<Box<dyn SerialPort>>,
    }

    impl SerialPinDevice {
        pub fn new(port_name: impl Into<String>, baud_rate: u32, output_pins: Vec<u8>) -> Self {
            Self {
                port_name: port_name.into(),
                baud_rate,
                output_pins,
                port: None,
            }
        }

        fn send(&mut self, message: &[u8]) -> Result<(), DeviceError> {
            let port = self.port.as_mut().ok_or(DeviceError::NotConnected)?;
            let result = port.write_all(message).and_then(|()| port.flush());
            if let Err(e) = result {
                self.port = None;
                return Err(DeviceError::WriteFailed(e.to_string()));
            }
            Ok(())
        }
    }

    impl StimulusDevice for SerialPinDevice {
        fn connect(&mut self) -> Result<(), DeviceError> {
            self.port = None;
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| {
                    DeviceError::ConnectFailed(format!(
                        "{} at {} baud: {}",
                        self.port_name, self.baud_rate, e
                    ))
                })?;
            self.port = Some(port);
            for pin in self.output_pins.clone() {
                self.send(&[SET_PIN_MODE, pin, MODE_OUTPUT])?;
            }
            tracing::debug!(port = %self.port_name, "Pin board opened");
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.port.is_some()
        }

        fn write_pin(&mut self, pin: u8, high: bool) -> Result<(), DeviceError> {
            self.send(&[SET_DIGITAL_PIN_VALUE, pin & 0x7F, u8::from(high)])
        }

        fn close(&mut self) {
            if self.port.take().is_some() {
                tracing::debug!(port = %self.port_name, "Pin board closed");
            }
        }
    }
}

#[cfg(feature = "instrument_serial")]
pub use serial::SerialPinDevice;

// ============================================================================
// Mock
// ============================================================================

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    fail_connect: bool,
    fail_writes: bool,
    writes: Vec<(u8, bool)>,
    connects: u32,
}

/// In-memory device for tests and headless runs. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockPinDevice {
    state: Arc<std::sync::Mutex<MockState>>,
}

impl MockPinDevice {
    /// A device that is already connected.
    pub fn connected() -> Self {
        let device = Self::default();
        device.with(|s| s.connected = true);
        device
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Make writes fail (and drop the connection) until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.with(|s| {
            s.fail_writes = failing;
            s.fail_connect = failing;
        });
    }

    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.with(|s| s.writes.clone())
    }

    /// Rising edges on `pin`.
    pub fn pulses(&self, pin: u8) -> usize {
        self.with(|s| s.writes.iter().filter(|&&(p, high)| p == pin && high).count())
    }

    pub fn connects(&self) -> u32 {
        self.with(|s| s.connects)
    }
}

impl StimulusDevice for MockPinDevice {
    fn connect(&mut self) -> Result<(), DeviceError> {
        self.with(|s| {
            if s.fail_connect {
                return Err(DeviceError::ConnectFailed("mock device unplugged".to_string()));
            }
            s.connected = true;
            s.connects += 1;
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.with(|s| s.connected)
    }

    fn write_pin(&mut self, pin: u8, high: bool) -> Result<(), DeviceError> {
        self.with(|s| {
            if !s.connected {
                return Err(DeviceError::NotConnected);
            }
            if s.fail_writes {
                s.connected = false;
                return Err(DeviceError::WriteFailed("mock write failure".to_string()));
            }
            s.writes.push((pin, high));
            Ok(())
        })
    }

    fn close(&mut self) {
        self.with(|s| s.connected = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StimulusConfig {
        StimulusConfig {
            on_duration: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(100),
            ..StimulusConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pulse_writes_high_then_low() {
        let mock = MockPinDevice::connected();
        let link = StimulusLink::new(Box::new(mock.clone()), &config());
        link.pulse().await.unwrap();
        assert_eq!(mock.writes(), vec![(6, true), (6, false)]);
        assert_eq!(mock.pulses(6), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_failure_then_reconnect() {
        let mock = MockPinDevice::connected();
        let mut link = StimulusLink::new(Box::new(mock.clone()), &config());
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        link.heartbeat(t0);
        link.settle().await;
        assert_eq!(mock.writes(), vec![(13, true)]);
        // within the interval nothing is written
        link.heartbeat(t0 + ms(50));
        link.settle().await;
        assert_eq!(mock.writes().len(), 1);

        mock.set_failing(true);
        link.heartbeat(t0 + ms(150));
        link.settle().await;
        assert!(!link.is_connected());
        link.ensure_connected(t0 + ms(150));
        link.settle().await;
        assert!(!link.is_connected());

        mock.set_failing(false);
        // next attempt waits a full interval after the failed one
        link.ensure_connected(t0 + ms(200));
        link.settle().await;
        assert!(!link.is_connected());
        assert_eq!(mock.connects(), 0);

        link.ensure_connected(t0 + ms(250));
        link.settle().await;
        assert!(link.is_connected());
        assert_eq!(mock.connects(), 1);
    }

    /// Connect that takes as long as a serial open timing out.
    struct SlowDevice {
        delay: Duration,
        inner: MockPinDevice,
    }

    impl StimulusDevice for SlowDevice {
        fn connect(&mut self) -> Result<(), DeviceError> {
            std::thread::sleep(self.delay);
            self.inner.connect()
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn write_pin(&mut self, pin: u8, high: bool) -> Result<(), DeviceError> {
            std::thread::sleep(self.delay);
            self.inner.write_pin(pin, high)
        }

        fn close(&mut self) {
            self.inner.close();
        }
    }

    #[tokio::test]
    async fn test_slow_device_never_blocks_the_caller() {
        let mock = MockPinDevice::default();
        let slow = SlowDevice {
            delay: Duration::from_millis(300),
            inner: mock.clone(),
        };
        let mut link = StimulusLink::new(Box::new(slow), &config());

        let started = Instant::now();
        for _ in 0..50 {
            link.ensure_connected(Instant::now());
            link.heartbeat(Instant::now());
        }
        assert!(started.elapsed() < Duration::from_millis(100), "{:?}", started.elapsed());

        link.settle().await;
        assert!(link.is_connected());
        // one attempt despite fifty calls
        assert_eq!(mock.connects(), 1);

        let started = Instant::now();
        link.heartbeat(Instant::now());
        assert!(started.elapsed() < Duration::from_millis(100));
        link.settle().await;
        assert_eq!(mock.writes(), vec![(13, true)]);
    }

    #[tokio::test]
    async fn test_pulse_on_disconnected_device_flags_link() {
        let mock = MockPinDevice::default();
        let link = StimulusLink::new(Box::new(mock.clone()), &config());
        link.pulse().await.unwrap();
        assert!(!link.is_connected());
        assert_eq!(mock.pulses(6), 0);
    }
}
