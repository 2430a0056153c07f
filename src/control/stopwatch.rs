//! Dwell timing for the statistics unit.

use std::time::{Duration, Instant};

/// Accumulating stopwatch driven by explicit instants.
///
/// Total time is kept across start/stop pairs until [`reset`](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    /// Start a run. Returns false if already running.
    pub fn start_at(&mut self, now: Instant) -> bool {
        if self.running_since.is_some() {
            return false;
        }
        self.running_since = Some(now);
        true
    }

    pub fn stop_at(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
    }

    /// Total over all runs, including the current one.
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        self.accumulated + self.current_run_at(now)
    }

    /// Length of the current run; zero while stopped.
    pub fn current_run_at(&self, now: Instant) -> Duration {
        self.running_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        self.running_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_across_runs() {
        let t0 = Instant::now();
        let ms = Duration::from_millis;
        let mut watch = Stopwatch::new();
        assert!(watch.start_at(t0));
        assert!(!watch.start_at(t0 + ms(5)));
        watch.stop_at(t0 + ms(100));
        assert_eq!(watch.elapsed_at(t0 + ms(500)), ms(100));
        assert_eq!(watch.current_run_at(t0 + ms(500)), Duration::ZERO);

        watch.start_at(t0 + ms(200));
        assert_eq!(watch.elapsed_at(t0 + ms(250)), ms(150));
        assert_eq!(watch.current_run_at(t0 + ms(250)), ms(50));

        watch.reset();
        assert!(!watch.is_running());
        assert_eq!(watch.elapsed_at(t0 + ms(300)), Duration::ZERO);
    }
}
