//! Retry scheduling — exponential backoff with jitter
//!
//! Stateless: the delay depends only on how many attempts an entry has
//! already failed. The worker asks for a delay per entry after a failed send.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Largest exponent applied to the base delay; beyond this the cap always wins.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Backoff parameters for failed deliveries
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay used as the ± jitter range (0.0 – 1.0)
    pub jitter_fraction: f64,
    /// Failed attempts after which an entry is abandoned
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_fraction: config.jitter_fraction,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay without jitter: `base * 2^attempt`, capped at `max_delay`.
    ///
    /// Non-decreasing in `attempt`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay with jitter applied, still bounded by `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        let spread = base.as_secs_f64() * self.jitter_fraction.clamp(0.0, 1.0);
        if spread <= 0.0 {
            return base;
        }

        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (base.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(jittered).min(self.max_delay)
    }

    /// Whether an entry with `attempts` failures should be abandoned.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_fraction: jitter,
            max_attempts: 8,
        }
    }

    #[test]
    fn test_base_delay_doubles() {
        let p = policy(0.0);
        assert_eq!(p.base_delay_for(0), Duration::from_millis(100));
        assert_eq!(p.base_delay_for(1), Duration::from_millis(200));
        assert_eq!(p.base_delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_base_delay_monotonic_and_capped() {
        let p = policy(0.0);
        let mut prev = Duration::ZERO;
        for attempt in 0..64 {
            let d = p.base_delay_for(attempt);
            assert!(d >= prev, "attempt {attempt} decreased");
            assert!(d <= p.max_delay);
            prev = d;
        }
        assert_eq!(p.base_delay_for(63), p.max_delay);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy(0.2);
        for attempt in 0..10 {
            let base = p.base_delay_for(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = p.delay_for(attempt);
                assert!(d <= p.max_delay);
                assert!(d.as_secs_f64() >= base * 0.8 - 1e-9);
                assert!(d.as_secs_f64() <= base * 1.2 + 1e-9);
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let p = policy(0.0);
        assert_eq!(p.delay_for(2), p.base_delay_for(2));
    }

    #[test]
    fn test_exhaustion() {
        let p = policy(0.0);
        assert!(!p.is_exhausted(7));
        assert!(p.is_exhausted(8));
    }
}
