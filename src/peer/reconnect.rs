//! Exponential backoff with jitter for outbound peers
//!
//! Delay for attempt n is `min(max_delay, initial_delay * multiplier^(n-1))`
//! scaled by `1 ± jitter`. The RNG is seedable so tests can pin the bounds.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ReconnectConfig;

pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    rng: StdRng,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self::with_seed(config, rand::thread_rng().gen())
    }

    pub fn with_seed(config: ReconnectConfig, seed: u64) -> Self {
        Self {
            config,
            attempt: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.base_delay(self.attempt);
        let jitter = self.config.jitter;
        if jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + self.rng.gen_range(-jitter..=jitter);
        base.mul_f64(factor.max(0.0))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let scaled = self
            .config
            .initial_delay
            .mul_f64(self.config.multiplier.powi(exponent as i32));
        scaled.min(self.config.max_delay)
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// True once `max_retries` is reached (0 means never).
    pub fn exhausted(&self) -> bool {
        self.config.max_retries > 0 && self.attempt >= self.config.max_retries
    }

    /// Call after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: 0,
        }
    }

    #[test]
    fn test_delay_within_jitter_bounds() {
        let mut policy = ReconnectPolicy::with_seed(config(), 42);
        for attempt in 1..=10u32 {
            let base = Duration::from_secs(1)
                .mul_f64(2f64.powi(attempt as i32 - 1))
                .min(Duration::from_secs(60));
            let delay = policy.next_delay();
            assert!(
                delay >= base.mul_f64(0.8) && delay <= base.mul_f64(1.2),
                "attempt {}: {:?} outside [{:?}, {:?}]",
                attempt,
                delay,
                base.mul_f64(0.8),
                base.mul_f64(1.2)
            );
        }
    }

    #[test]
    fn test_delay_caps_at_max() {
        let mut policy = ReconnectPolicy::with_seed(
            ReconnectConfig { jitter: 0.0, ..config() },
            1,
        );
        for _ in 0..20 {
            policy.next_delay();
        }
        assert_eq!(policy.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_deterministic_with_seed() {
        let mut a = ReconnectPolicy::with_seed(config(), 7);
        let mut b = ReconnectPolicy::with_seed(config(), 7);
        for _ in 0..5 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn test_exhaustion() {
        let mut policy = ReconnectPolicy::with_seed(
            ReconnectConfig { max_retries: 2, ..config() },
            1,
        );
        assert!(!policy.exhausted());
        policy.next_delay();
        assert!(!policy.exhausted());
        policy.next_delay();
        assert!(policy.exhausted());

        policy.reset();
        assert!(!policy.exhausted());
    }

    #[test]
    fn test_zero_retries_never_exhausts() {
        let mut policy = ReconnectPolicy::with_seed(config(), 1);
        for _ in 0..100 {
            policy.next_delay();
        }
        assert!(!policy.exhausted());
    }
}
