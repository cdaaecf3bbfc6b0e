//! Reconnect delay schedule.

use std::time::Duration;

/// Exponential backoff: `next = min(floor(current * factor), cap)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    factor: f64,
    current_ms: u64,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        let base_ms = base.as_millis() as u64;
        Self {
            base_ms,
            cap_ms: (cap.as_millis() as u64).max(base_ms),
            factor: factor.max(1.0),
            current_ms: base_ms,
        }
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) will return.
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    /// Return the current delay and advance the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        let grown = (self.current_ms as f64 * self.factor).floor() as u64;
        self.current_ms = grown.min(self.cap_ms);
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.base_ms;
    }
}
