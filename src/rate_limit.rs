//! Per-connection request rate limiting.
//!
//! Sliding window: each connection may spend `limit` requests per
//! `window_ms` milliseconds. Requests are charged after the auth gate and
//! before dispatch. A denied request learns how long until the oldest
//! charge leaves the window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub limit: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_ms: u64 },
}

pub struct RateLimiter {
    limit: usize,
    window: Duration,
    /// Timestamps of charged requests within the window, per connection.
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limit: config.limit as usize,
            window: Duration::from_millis(config.window_ms),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Charge one request against `connection_id`'s bucket.
    pub fn check(&self, connection_id: &str) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let stamps = buckets.entry(connection_id.to_string()).or_default();

        while stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            stamps.pop_front();
        }

        if stamps.len() >= self.limit {
            // Denials are not charged; the denied request does not push
            // the retry horizon further out.
            let oldest = *stamps.front().expect("bucket non-empty at limit");
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return RateDecision::Limited {
                retry_after_ms: (retry_after.as_millis() as u64).max(1),
            };
        }

        stamps.push_back(now);
        RateDecision::Allowed
    }

    /// Drop the bucket for a connection that went away.
    pub fn forget(&self, connection_id: &str) {
        self.buckets
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig { limit, window_ms })
    }

    #[test]
    fn nth_request_passes_nth_plus_one_fails() {
        let rl = limiter(2, 1_000);
        assert_eq!(rl.check("conn-1"), RateDecision::Allowed);
        assert_eq!(rl.check("conn-1"), RateDecision::Allowed);
        match rl.check("conn-1") {
            RateDecision::Limited { retry_after_ms } => assert!(retry_after_ms > 0),
            RateDecision::Allowed => panic!("third request should be limited"),
        }
    }

    #[test]
    fn buckets_are_per_connection() {
        let rl = limiter(1, 1_000);
        assert_eq!(rl.check("conn-1"), RateDecision::Allowed);
        assert_eq!(rl.check("conn-2"), RateDecision::Allowed);
        assert!(matches!(rl.check("conn-1"), RateDecision::Limited { .. }));
    }

    #[test]
    fn window_slides() {
        let rl = limiter(1, 40);
        assert_eq!(rl.check("conn-1"), RateDecision::Allowed);
        assert!(matches!(rl.check("conn-1"), RateDecision::Limited { .. }));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(rl.check("conn-1"), RateDecision::Allowed);
    }

    #[test]
    fn forget_resets_the_bucket() {
        let rl = limiter(1, 10_000);
        assert_eq!(rl.check("conn-1"), RateDecision::Allowed);
        rl.forget("conn-1");
        assert_eq!(rl.check("conn-1"), RateDecision::Allowed);
    }
}
