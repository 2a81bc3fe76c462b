//! Reconnect backoff schedule: exponential from ~1 s to ~30 s with jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter on the upper half of each step.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            attempt: 0,
        }
    }

    /// The standard bus reconnect schedule.
    pub fn reconnect() -> Self {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Next delay; each call advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(5))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        // Jitter: uniformly within [exp/2, exp].
        let half = exp / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
