//! Token-bucket limiter for outbound file streams.
use std::time::Instant;

/// Bytes-per-second bucket with a one-second burst cap. A limit of zero
/// (or below) disables throttling entirely.
pub struct Throttler {
    limit: f64,
    tokens: f64,
    last_update: Instant,
}

impl Throttler {
    pub fn new(limit_bytes_per_sec: i64) -> Self {
        Self {
            limit: limit_bytes_per_sec as f64,
            tokens: limit_bytes_per_sec as f64,
            last_update: Instant::now(),
        }
    }

    /// Block until `amount` tokens are available, then deduct them.
    pub fn wait_for_tokens(&mut self, amount: usize) {
        if self.limit <= 0.0 {
            return;
        }
        let amount = amount as f64;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last_update).as_secs_f64();
            self.last_update = now;

            self.tokens = (self.tokens + elapsed * self.limit).min(self.limit);
            if self.tokens >= amount {
                self.tokens -= amount;
                return;
            }
            let needed = amount - self.tokens;
            std::thread::sleep(std::time::Duration::from_secs_f64(needed / self.limit));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unlimited_never_blocks() {
        let mut t = Throttler::new(0);
        let start = Instant::now();
        for _ in 0..100 {
            t.wait_for_tokens(10_000_000);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn initial_burst_is_free_then_rate_applies() {
        let mut t = Throttler::new(100_000);
        let start = Instant::now();
        // First second's worth is pre-filled.
        t.wait_for_tokens(100_000);
        assert!(start.elapsed() < Duration::from_millis(100));
        // The next half-second's worth has to accrue.
        t.wait_for_tokens(50_000);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
    }

    #[test]
    fn window_admission_is_burst_bounded() {
        // Over a ~1s window the bucket admits at most limit + accrual,
        // which stays under twice the limit.
        let limit = 200_000usize;
        let mut t = Throttler::new(limit as i64);
        let start = Instant::now();
        let mut admitted = 0usize;
        while start.elapsed() < Duration::from_secs(1) {
            t.wait_for_tokens(20_000);
            admitted += 20_000;
        }
        assert!(admitted <= 2 * limit + 20_000, "admitted {admitted}");
    }
}
