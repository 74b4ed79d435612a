//! Bounded exponential backoff for broker reconnection.

use std::time::Duration;

/// Default first reconnect delay.
pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_millis(500);

/// Default reconnect delay cap.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_BACKOFF_MIN,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Doubling delay sequence: `min, 2*min, 4*min, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            next: config.min.min(config.max),
            attempts: 0,
        }
    }

    /// The delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.config.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Start over after a successful attempt.
    pub fn reset(&mut self) {
        self.next = self.config.min.min(self.config.max);
        self.attempts = 0;
    }

    /// Delays handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            min: Duration::from_secs(1),
            max: Duration::from_secs(5),
        });

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), DEFAULT_BACKOFF_MIN);
    }

    #[test]
    fn test_min_above_max_is_clamped() {
        let mut backoff = Backoff::new(BackoffConfig {
            min: Duration::from_secs(10),
            max: Duration::from_secs(3),
        });
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }
}
