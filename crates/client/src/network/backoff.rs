//! Capped exponential reconnect backoff.

use std::time::Duration;

/// Delay schedule for reconnect attempts.
///
/// Each failed attempt multiplies the delay until it hits the cap; a
/// successful open starts over from the initial delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            current: initial.min(max),
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(
            Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier),
            self.max,
        );
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    /// The delay `next_delay` would return, without advancing.
    pub fn peek(&self) -> Duration {
        self.current
    }
}
