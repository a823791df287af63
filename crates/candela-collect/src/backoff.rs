//! Reconnect backoff policy.

use std::time::Duration;

/// Backoff parameters for stream reconnects.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Multiplier applied per consecutive failure.
    pub factor: u32,
    /// Ceiling on the delay.
    pub max: Duration,
    /// Sustained streaming time after which the backoff resets.
    pub stability_threshold: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            factor: 2,
            max: Duration::from_secs(300),
            stability_threshold: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff: attempt `k` waits `min(initial * factor^(k-1), max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff at attempt zero.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the delay for the next attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for(self.attempt)
    }

    /// Resets after a stable connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Sustained-streaming threshold for resetting.
    #[must_use]
    pub const fn stability_threshold(&self) -> Duration {
        self.config.stability_threshold
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = u64::from(self.config.factor).saturating_pow(exponent);
        let millis = u64::try_from(self.config.initial.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(multiplier);
        Duration::from_millis(millis).min(self.config.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence_doubles_to_cap() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let seq: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(seq, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn test_delays_are_monotone_nondecreasing() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let mut prev = Duration::ZERO;
        for _ in 0..20 {
            let next = backoff.next_delay();
            assert!(next >= prev);
            assert!(next <= Duration::from_secs(300));
            prev = next;
        }
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_extreme_attempts_do_not_overflow() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..1000 {
            assert!(backoff.next_delay() <= Duration::from_secs(300));
        }
    }
}
