//! Per-host rate limiting using the token bucket algorithm.
//!
//! Every remote call acquires one token before issuing the request; the
//! bucket refills continuously at the configured rate up to a burst cap.
//! Exhaustion never surfaces as an error — `acquire` suspends the caller
//! until a token is available.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// Rate limit configuration for one host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Sustained tokens per second.
    pub tokens_per_second: f64,
    /// Burst capacity (max tokens).
    pub burst_capacity: f64,
}

impl RateLimit {
    #[must_use]
    pub fn new(tokens_per_second: f64, burst_capacity: f64) -> Self {
        let tokens_per_second = if tokens_per_second.is_finite() && tokens_per_second > 0.0 {
            tokens_per_second
        } else {
            1.0
        };
        let burst_capacity = if burst_capacity >= 1.0 { burst_capacity } else { 1.0 };
        Self {
            tokens_per_second,
            burst_capacity,
        }
    }
}

/// Default limits per remote host key.
fn default_limit(host: &str) -> RateLimit {
    match host {
        // Conservative for the crawl APIs
        "deviantart" => RateLimit::new(2.0, 4.0),
        "civitai" => RateLimit::new(2.0, 5.0),
        // Paid per-request providers
        "tineye" => RateLimit::new(1.0, 2.0),
        "hive" => RateLimit::new(2.0, 4.0),
        // Storage service tolerates more
        "supabase_storage" => RateLimit::new(5.0, 10.0),
        _ => RateLimit::new(2.0, 4.0),
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single host's token bucket.
pub struct TokenBucket {
    limit: RateLimit,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    #[must_use]
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new(BucketState {
                tokens: limit.burst_capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquire one token, suspending until it is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                // Time until one full token accrues
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.limit.tokens_per_second)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limit wait");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token if one is immediately available.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens =
            (state.tokens + elapsed * self.limit.tokens_per_second).min(self.limit.burst_capacity);
        state.last_refill = now;
    }
}

/// Lazily-created per-host token buckets.
#[derive(Default)]
pub struct RateLimiterRegistry {
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket for a host key, created with the host's default limit on first
    /// use.
    pub async fn get(&self, host: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().await;
        Arc::clone(
            buckets
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(default_limit(host)))),
        )
    }

    /// Register a host with an explicit limit, replacing any existing bucket.
    pub async fn configure(&self, host: &str, limit: RateLimit) {
        let mut buckets = self.buckets.lock().await;
        buckets.insert(host.to_string(), Arc::new(TokenBucket::new(limit)));
    }
}
