//! Per-host circuit breakers.
//!
//! A breaker counts consecutive failures for one remote host. At the
//! threshold it opens and subsequent attempts fail fast with
//! [`Error::CircuitOpen`] until the cooldown elapses, after which a
//! half-open probe is allowed through: success closes the breaker, failure
//! re-opens it. The crawl state machine special-cases `CircuitOpen` to abort
//! a platform's tick while preserving cursor progress.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// How long an open breaker fails fast before allowing a half-open probe.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerPhase {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
}

/// Circuit breaker for a single remote host.
pub struct CircuitBreaker {
    host: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_settings(host, DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }

    #[must_use]
    pub fn with_settings(host: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            host: host.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// Run a guarded call through the breaker.
    ///
    /// # Errors
    ///
    /// Fails fast with [`Error::CircuitOpen`] while the breaker is open;
    /// otherwise returns the call's own result, recording its outcome.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.check().await?;
        match fut.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(e)
            }
        }
    }

    /// Admission check: `Err(CircuitOpen)` while open, `Ok` when closed or
    /// when the cooldown has elapsed (moving to half-open).
    pub async fn check(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.phase {
            BreakerPhase::Closed | BreakerPhase::HalfOpen => Ok(()),
            BreakerPhase::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    debug!(host = %self.host, "circuit half-open probe allowed");
                    state.phase = BreakerPhase::HalfOpen;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.host.clone()))
                }
            }
        }
    }

    /// Record a successful call, closing the breaker.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
        if state.phase != BreakerPhase::Closed {
            debug!(host = %self.host, "circuit closed");
        }
        state.phase = BreakerPhase::Closed;
    }

    /// Record a failed call; opens the breaker at the threshold, and
    /// immediately on a failed half-open probe.
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let reopen = state.phase == BreakerPhase::HalfOpen
            || state.consecutive_failures >= self.failure_threshold;
        if reopen {
            warn!(
                host = %self.host,
                consecutive_failures = state.consecutive_failures,
                "circuit opened"
            );
            state.phase = BreakerPhase::Open {
                since: Instant::now(),
            };
        }
    }

    /// Whether the breaker currently fails fast.
    pub async fn is_open(&self) -> bool {
        let state = self.state.lock().await;
        match state.phase {
            BreakerPhase::Open { since } => since.elapsed() < self.cooldown,
            _ => false,
        }
    }
}

/// Lazily-created per-host breakers.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        Arc::clone(
            breakers
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(host))),
        )
    }
}
