//! # Rate Limiting
//!
//! Token-bucket limiter keyed by source IP x endpoint. Buckets refill
//! continuously at the configured per-minute rate and allow bursts up to
//! the bucket size; an exhausted bucket yields HTTP 429 with a
//! `Retry-After` computed from the token deficit.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Single token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// `rate` is requests per minute, `burst` the bucket size.
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate_per_sec: rate as f64 / 60.0,
            burst: burst as f64,
            tokens: burst as f64,
            last_update: Instant::now(),
        }
    }

    /// Try to consume one token.
    pub fn consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until one token becomes available.
    pub fn retry_after(&self) -> u64 {
        let deficit = 1.0 - self.tokens;
        if deficit <= 0.0 {
            return 0;
        }
        (deficit / self.rate_per_sec).ceil() as u64 + 1
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_update.elapsed()
    }
}

/// Per-client x endpoint limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn limits_for(&self, endpoint: &str) -> (u32, u32) {
        match endpoint {
            "/rpc" => (self.config.rpc_rate, self.config.rpc_burst),
            "/health" | "/metrics" => (self.config.health_rate, self.config.health_burst),
            _ => (self.config.default_rate, self.config.default_burst),
        }
    }

    /// Check a request. `Err(retry_after_secs)` when the bucket is exhausted.
    pub fn check(&self, client: &str, endpoint: &str) -> Result<(), u64> {
        if !self.config.enabled {
            return Ok(());
        }

        let key = format!("{client}:{endpoint}");
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key).or_insert_with(|| {
            let (rate, burst) = self.limits_for(endpoint);
            TokenBucket::new(rate, burst)
        });

        if bucket.consume() {
            Ok(())
        } else {
            let retry_after = bucket.retry_after();
            warn!(
                "Rate limit exceeded for {} on {}, retry after {}s",
                client, endpoint, retry_after
            );
            Err(retry_after)
        }
    }

    /// Drop buckets idle for longer than `max_idle_secs`.
    pub fn cleanup_stale(&self, max_idle_secs: u64) {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| b.idle_for().as_secs() < max_idle_secs);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!("Cleaned up {} idle rate limit buckets", removed);
        }
    }
}
