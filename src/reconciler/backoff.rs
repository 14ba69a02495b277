//! Capped exponential backoff between failed passes

use std::time::Duration;
use rand::Rng;
use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: config.initial,
            max: config.max,
            multiplier: config.multiplier,
            jitter: config.jitter,
            current: config.initial,
        }
    }

    /// Current delay with jitter applied; advances the sequence, capped at `max`
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.current;
        self.current = scale(self.current, self.multiplier).map_or(self.max, |d| d.min(self.max));

        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            scale(delay, factor).unwrap_or(delay)
        } else {
            delay
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// None when the product is negative, not finite, or beyond `Duration::MAX`
fn scale(duration: Duration, factor: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).ok()
}
