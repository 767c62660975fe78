use std::time::Duration;

pub const DEFAULT_BASE: Duration = Duration::from_millis(1_000);
pub const DEFAULT_CAP: Duration = Duration::from_millis(30_000);

/// Capped exponential reconnect schedule with a single in-flight guard.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
    in_flight: bool,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
            in_flight: false,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// `min(base * 2^attempt, cap)`, saturating at `cap` on overflow.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Reserves the next reconnect slot. Returns `None` while one is already pending.
    pub fn schedule(&mut self) -> Option<Duration> {
        if self.in_flight {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.in_flight = true;
        Some(delay)
    }

    /// The pending reconnect timer fired.
    pub fn fired(&mut self) {
        self.in_flight = false;
    }

    /// Called on a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.in_flight = false;
    }

    /// Drops a pending reconnect without touching the attempt counter.
    pub fn cancel(&mut self) {
        self.in_flight = false;
    }
}

#[cfg(test)]
#[path = "tests/backoff_tests.rs"]
mod tests;
