//! Retry delay that doubles on failure and resets on success

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// `None` means no failure since the last success
    delay: Option<Duration>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            delay: None,
        }
    }

    /// Current failure delay, `None` when healthy
    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Record a failure and return the grown delay
    pub fn on_failure(&mut self) -> Duration {
        let next = match self.delay {
            None => self.base.min(self.max),
            Some(delay) => delay.saturating_mul(2).min(self.max),
        };
        self.delay = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.delay = None;
    }

    /// Delay before the next scheduled attempt; the uncapped base while healthy
    pub fn next_interval(&self) -> Duration {
        self.delay.unwrap_or(self.base)
    }
}
