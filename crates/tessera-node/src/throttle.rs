//! Global outbound bandwidth budget.

use std::time::Duration;

use tokio::time::Instant;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Token bucket measured in bytes. A rate of zero means unlimited.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: u64,
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket refilling at `rate` bytes per second.
    pub fn new(rate: u64, capacity: u64, now: Instant) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn unlimited(now: Instant) -> Self {
        Self::new(0, 0, now)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    pub fn refill(&mut self, now: Instant) {
        if self.is_unlimited() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let earned = elapsed * u128::from(self.rate) / NANOS_PER_SEC;
        if earned == 0 {
            return;
        }
        let tokens = (u128::from(self.tokens) + earned).min(u128::from(self.capacity));
        self.tokens = tokens as u64;
        if self.tokens == self.capacity {
            self.last_refill = now;
        } else {
            // keep the fractional token for the next refill
            let spent = earned * NANOS_PER_SEC / u128::from(self.rate);
            self.last_refill += Duration::from_nanos(spent as u64);
        }
    }

    pub fn available_tokens(&self) -> u64 {
        if self.is_unlimited() {
            u64::MAX
        } else {
            self.tokens
        }
    }

    pub fn consume(&mut self, n: u64) {
        if !self.is_unlimited() {
            self.tokens = self.tokens.saturating_sub(n);
        }
    }

    /// Nanoseconds until `n` tokens are available, assuming no other use.
    pub fn nanos_until(&self, n: u64) -> u64 {
        if self.is_unlimited() || self.tokens >= n {
            return 0;
        }
        let missing = u128::from(n.min(self.capacity) - self.tokens.min(n));
        let nanos = (missing * NANOS_PER_SEC).div_ceil(u128::from(self.rate));
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_runs_out() {
        let now = Instant::now();
        let mut bucket = TokenBucket::unlimited(now);
        bucket.consume(1 << 40);
        assert_eq!(bucket.available_tokens(), u64::MAX);
        assert_eq!(bucket.nanos_until(1 << 40), 0);
    }

    #[test]
    fn refills_at_rate_up_to_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1000, 2000, now);
        bucket.consume(2000);
        assert_eq!(bucket.available_tokens(), 0);

        bucket.refill(now + Duration::from_millis(500));
        assert_eq!(bucket.available_tokens(), 500);

        bucket.refill(now + Duration::from_secs(10));
        assert_eq!(bucket.available_tokens(), 2000);
    }

    #[test]
    fn fractional_tokens_are_not_lost() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(3, 100, now);
        bucket.consume(100);
        // 3 tokens/s: a refill every 200ms earns 0.6 tokens each time
        for i in 1..=5 {
            bucket.refill(now + Duration::from_millis(200 * i));
        }
        assert_eq!(bucket.available_tokens(), 3);
    }

    #[test]
    fn nanos_until_covers_the_deficit() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1000, 1500, now);
        bucket.consume(1500);
        assert_eq!(bucket.nanos_until(0), 0);
        assert_eq!(bucket.nanos_until(1), 1_000_000);
        assert_eq!(bucket.nanos_until(1280), 1_280_000_000);

        bucket.refill(now + Duration::from_nanos(bucket.nanos_until(1280)));
        assert!(bucket.available_tokens() >= 1280);
    }
}
