//! # Admission Control
//!
//! Token bucket rate limiting keyed by client identity (API key digest or IP).
//!
//! Each key gets a bucket of `burst` tokens refilled continuously at
//! `rate_per_sec`. Buckets are created lazily and live in an LRU table
//! bounded by `max_keys`; `sweep_idle` drops buckets nobody touched for a
//! while, so the table cannot grow without bound.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

// Guards against 0.1 * 10.0 style rounding leaving a bucket just short of a token.
const TOKEN_EPSILON: f64 = 1e-9;

/// Token bucket for a single client key
#[derive(Clone, Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed, then try to take one token
    fn try_consume(&mut self, now: Instant, rate: f64, burst: f64) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(burst);
        self.last_refill = now;

        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }
}

/// Shared rate limiter state
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<LruCache<String, TokenBucket>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            buckets: Arc::new(Mutex::new(LruCache::new(capacity))),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one token for `key` if available
    pub async fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now()).await
    }

    pub async fn allow_at(&self, key: &str, now: Instant) -> bool {
        let rate = self.config.rate_per_sec;
        let burst = f64::from(self.config.burst);
        let mut buckets = self.buckets.lock().await;

        if let Some(bucket) = buckets.get_mut(key) {
            return bucket.try_consume(now, rate, burst);
        }

        let mut bucket = TokenBucket::new(burst, now);
        let allowed = bucket.try_consume(now, rate, burst);
        buckets.put(key.to_string(), bucket);
        allowed
    }

    /// Drop buckets idle for at least `max_idle`. Returns how many were dropped.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let mut swept = 0;

        // LRU order is last-touch order, so idle buckets sit at the tail.
        while let Some((_, bucket)) = buckets.peek_lru() {
            if now.saturating_duration_since(bucket.last_refill) < max_idle {
                break;
            }
            buckets.pop_lru();
            swept += 1;
        }

        if swept > 0 {
            debug!(swept, remaining = buckets.len(), "Swept idle rate-limit buckets");
        }
        swept
    }

    /// Number of keys currently tracked
    pub async fn tracked_keys(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_one_token_per_interval() {
        let limiter = RateLimiter::new(RateLimitConfig::new(10.0, 5));

        for _ in 0..5 {
            assert!(limiter.allow("client").await);
        }
        assert!(!limiter.allow("client").await);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.allow("client").await);
        assert!(!limiter.allow("client").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::new(100.0, 3));
        for _ in 0..3 {
            assert!(limiter.allow("k").await);
        }

        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..3 {
            assert!(limiter.allow("k").await);
        }
        assert!(!limiter.allow("k").await);
    }

    #[tokio::test]
    async fn test_keys_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1.0, 2));

        assert!(limiter.allow("a").await);
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);

        assert!(limiter.allow("b").await);
        assert!(limiter.allow("b").await);
        assert!(!limiter.allow("b").await);
    }

    #[tokio::test]
    async fn test_table_is_bounded_by_max_keys() {
        let mut config = RateLimitConfig::new(1.0, 1);
        config.max_keys = 2;
        let limiter = RateLimiter::new(config);

        assert!(limiter.allow("a").await);
        assert!(limiter.allow("b").await);
        assert!(limiter.allow("c").await);
        assert_eq!(limiter.tracked_keys().await, 2);

        // "a" was evicted, so it starts over with a full bucket
        assert!(limiter.allow("a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_only_idle_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1.0, 1));
        limiter.allow("old").await;

        tokio::time::advance(Duration::from_secs(300)).await;
        limiter.allow("fresh").await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.sweep_idle(Duration::from_secs(60)).await, 1);
        assert_eq!(limiter.tracked_keys().await, 1);
    }
}
