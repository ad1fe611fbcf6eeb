//! Token-bucket limiter for HTTP request start rate.

use std::time::Instant;

/// Classic token bucket. `refill` computes how many tokens should exist by
/// now from the total elapsed time, so bursts never exceed `burst` and the
/// long-run rate never exceeds `rate_per_sec` regardless of call cadence.
pub struct Throttler {
    rate_per_ms: f64,
    burst: u32,
    bucket: u32,
    generated: u64,
    start: Instant,
}

impl Throttler {
    /// `rate_per_sec == 0` means unlimited.
    pub fn new(rate_per_sec: u32, burst: u32) -> Throttler {
        Throttler {
            rate_per_ms: f64::from(rate_per_sec) / 1000.0,
            burst,
            bucket: burst,
            generated: 0,
            start: Instant::now(),
        }
    }

    /// Burst size used when the caller doesn't pick one: a tenth of the
    /// rate, at least 5, never more than the transfer parallelism.
    pub fn default_burst(rate_per_sec: u32, max_parallel: u32) -> u32 {
        max_parallel.min((rate_per_sec / 10).max(5))
    }

    pub fn refill(&mut self) {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        let generated = (elapsed_ms as f64 * self.rate_per_ms) as u64;
        let fresh = (generated - self.generated).min(u64::from(self.burst)) as u32;
        self.bucket = self.burst.min(self.bucket.saturating_add(fresh));
        self.generated = generated;
    }

    /// Take one token if available. Always succeeds when unlimited.
    pub fn get_token(&mut self) -> bool {
        if self.rate_per_ms == 0.0 {
            return true;
        }
        if self.bucket == 0 {
            return false;
        }
        self.bucket -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_rate_is_unlimited() {
        let mut t = Throttler::new(0, 5);
        for _ in 0..10_000 {
            assert!(t.get_token());
        }
    }

    #[test]
    fn burst_bounds_initial_tokens() {
        let mut t = Throttler::new(1000, 3);
        t.refill();
        assert!(t.get_token());
        assert!(t.get_token());
        assert!(t.get_token());
        assert!(!t.get_token());
    }

    #[test]
    fn tokens_come_back_over_time() {
        let mut t = Throttler::new(1000, 2);
        t.refill();
        assert!(t.get_token());
        assert!(t.get_token());
        assert!(!t.get_token());
        std::thread::sleep(Duration::from_millis(20));
        t.refill();
        assert!(t.get_token());
    }

    #[test]
    fn refill_caps_at_burst() {
        let mut t = Throttler::new(1_000_000, 4);
        std::thread::sleep(Duration::from_millis(10));
        t.refill();
        let mut issued = 0;
        while t.get_token() {
            issued += 1;
        }
        assert_eq!(issued, 4);
    }

    #[test]
    fn window_rate_is_bounded_by_rate_plus_burst() {
        // over any window, issued tokens <= rate * window + burst
        let mut t = Throttler::new(100, 5);
        let start = Instant::now();
        let mut issued = 0u32;
        while start.elapsed() < Duration::from_millis(200) {
            t.refill();
            while t.get_token() {
                issued += 1;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        // 100/s over 200ms = 20 generated, plus the burst of 5
        assert!(issued <= 26, "issued {issued} tokens in 200ms");
    }

    #[test]
    fn default_burst_clamps_to_parallelism() {
        assert_eq!(Throttler::default_burst(100, 32), 10);
        assert_eq!(Throttler::default_burst(10, 32), 5);
        assert_eq!(Throttler::default_burst(1000, 8), 8);
        assert_eq!(Throttler::default_burst(0, 8), 5);
    }
}
