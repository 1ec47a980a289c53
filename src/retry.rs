//! Exponential backoff
//!
//! Delay sequence: `base, 2*base, 4*base, ...` capped at `max`.

use std::thread;
use std::time::{Duration, Instant};

/// Stateful delay generator
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Sleep for `total`, waking early once `stop` returns true
pub fn sleep_unless(total: Duration, stop: impl Fn() -> bool) {
    const SLICE: Duration = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    loop {
        if stop() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SLICE.min(deadline - now));
    }
}
