use std::time::Duration;

use super::config::BackoffConfig;

/// Exponential reconnect schedule with an attempt limit.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    attempt: u32,
    max_attempts: u32,
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial_delay = Duration::from_millis(config.initial_delay_ms);
        Self {
            attempt: 0,
            max_attempts: config.max_attempts,
            initial_delay,
            current_delay: initial_delay,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Delay before the next attempt, doubling up to the cap. `None` once
    /// the limit is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = std::cmp::min(self.current_delay * 2, self.max_delay);
        Some(delay)
    }
}
