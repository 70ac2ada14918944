//! Per-client submit throttling (token bucket)

use parking_lot::Mutex;
use std::time::Instant;

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained submits per second
    pub requests_per_second: u32,
    /// Bucket capacity
    pub burst_size: u32,
}

impl RateLimitConfig {
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        Self {
            requests_per_second,
            burst_size,
        }
    }

    /// Burst defaults to twice the rate
    pub fn from_rate(requests_per_second: u32) -> Self {
        Self::new(requests_per_second, requests_per_second.saturating_mul(2))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from_rate(1000)
    }
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket owned by one client session.
///
/// Starts full; refills continuously at `requests_per_second`.
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens: config.burst_size as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take one token. Returns false when the client is over its rate.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens as u32
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        let capacity = self.config.burst_size as f64;

        bucket.tokens = (bucket.tokens + elapsed * self.config.requests_per_second as f64).min(capacity);
        bucket.refilled_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_burst_then_limit() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, 3));

        for _ in 0..3 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_refill_is_capped_at_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1000, 5));
        while limiter.try_acquire() {}

        thread::sleep(Duration::from_millis(30));
        assert_eq!(limiter.available_tokens(), 5);
    }

    #[test]
    fn test_from_rate_doubles_burst() {
        let config = RateLimitConfig::from_rate(50);
        assert_eq!(config.burst_size, 100);
        assert_eq!(RateLimiter::new(config).available_tokens(), 100);
    }
}
