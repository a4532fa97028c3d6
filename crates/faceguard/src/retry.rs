//! Generic retry helper with exponential backoff.
//!
//! Recovers transient network and I/O failures locally. Terminal errors
//! (validation, circuit-open, logic) propagate on the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Retry policy: attempt count and backoff window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (1-based attempt that just failed):
    /// `min_wait * 2^(attempt-1)`, capped at `max_wait`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min_wait.saturating_mul(factor).min(self.max_wait)
    }
}

/// Run `operation` up to `policy.max_attempts` times, sleeping between
/// attempts, retrying only errors classified retryable.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-retryable error immediately.
pub async fn retry_async<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && e.is_retryable() => {
                let wait = policy.backoff(attempt);
                warn!(
                    operation = op_name,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::Io(std::io::Error::other("transient"))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let out = retry_async(RetryPolicy::default(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(42) }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        tokio::time::pause();
        let calls = AtomicU32::new(0);
        let out = retry_async(RetryPolicy::default(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        tokio::time::pause();
        let calls = AtomicU32::new(0);
        let out: Result<()> = retry_async(RetryPolicy::default(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<()> = retry_async(RetryPolicy::default(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::InvalidImage("bad magic".to_string())) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_open_is_never_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<()> = retry_async(RetryPolicy::default(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::CircuitOpen("civitai".to_string())) }
        })
        .await;
        assert!(out.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
