//! Token-bucket pacing for bulk stream kinds
//!
//! Forward and file streams can be rate-limited without touching the
//! control plane: the pacer runs inside the splice task of the paced stream
//! only, so keepalives and route adverts never wait behind it.

use std::time::{Duration, Instant};

/// Default burst allowance.
pub const DEFAULT_BURST: usize = 16 * 1024;

pub struct Pacer {
    /// Bytes per second; 0 disables pacing.
    rate: u64,
    burst: f64,
    available: f64,
    refilled_at: Instant,
}

impl Pacer {
    pub fn new(rate: u64, burst: usize) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate,
            burst,
            available: burst,
            refilled_at: Instant::now(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, DEFAULT_BURST)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.available = (self.available + elapsed * self.rate as f64).min(self.burst);
        self.refilled_at = now;
    }

    /// Time to wait before `n` bytes may pass, given `now`.
    fn delay_for(&mut self, n: usize, now: Instant) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        self.refill(now);
        let n = n as f64;
        if self.available >= n {
            self.available -= n;
            return Duration::ZERO;
        }
        let deficit = n - self.available;
        self.available = 0.0;
        Duration::from_secs_f64(deficit / self.rate as f64)
    }

    /// Debit `n` bytes, sleeping while the bucket refills.
    pub async fn pace(&mut self, n: usize) {
        let delay = self.delay_for(n, Instant::now());
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_passes_immediately() {
        let mut pacer = Pacer::new(1000, 4096);
        let now = Instant::now();
        assert_eq!(pacer.delay_for(4096, now), Duration::ZERO);
    }

    #[test]
    fn test_deficit_delays_proportionally() {
        let mut pacer = Pacer::new(1000, 1000);
        let now = Instant::now();
        assert_eq!(pacer.delay_for(1000, now), Duration::ZERO);
        // Bucket empty: 500 bytes at 1000 B/s is half a second.
        let delay = pacer.delay_for(500, now);
        assert!((delay.as_secs_f64() - 0.5).abs() < 0.01, "{:?}", delay);
    }

    #[test]
    fn test_refill_over_time() {
        let mut pacer = Pacer::new(1000, 1000);
        let start = Instant::now();
        assert_eq!(pacer.delay_for(1000, start), Duration::ZERO);
        // One second later the bucket holds ~1000 again.
        assert_eq!(
            pacer.delay_for(900, start + Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_unlimited_never_delays() {
        let mut pacer = Pacer::unlimited();
        let now = Instant::now();
        assert_eq!(pacer.delay_for(usize::MAX / 2, now), Duration::ZERO);
    }
}
