//! Hooks for the external collaborators the scheduler drives but does not
//! own: the platform-taxonomy mapper, honeypot-detection checks, and the
//! ML-intelligence analyzer suite.
//!
//! Hook failures are swallowed at the tick boundary — they never block the
//! pipeline.

use async_trait::async_trait;
use faceguard::error::Result;
use std::sync::Arc;
use tracing::error;

/// One externally-owned step the scheduler runs each tick. Implementations
/// track their own cadence (the mapper runs weekly, the others per tick).
#[async_trait]
pub trait PipelineHook: Send + Sync {
    /// Stable name for log events.
    fn name(&self) -> &'static str;

    /// Run the step if it is due; a no-op otherwise.
    async fn run_if_due(&self) -> Result<()>;
}

/// Optional hook slots, all empty by default.
#[derive(Default, Clone)]
pub struct PipelineHooks {
    pub taxonomy_mapper: Option<Arc<dyn PipelineHook>>,
    pub honeypot: Option<Arc<dyn PipelineHook>>,
    pub intelligence: Option<Arc<dyn PipelineHook>>,
}

impl PipelineHooks {
    /// Run one hook slot, logging and swallowing any error.
    pub async fn run(slot: Option<&Arc<dyn PipelineHook>>) {
        let Some(hook) = slot else { return };
        if let Err(e) = hook.run_if_due().await {
            error!(hook = hook.name(), error = %e, "pipeline hook error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceguard::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHook {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl PipelineHook for CountingHook {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_if_due(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Other("analyzer exploded".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_empty_slot_is_noop() {
        PipelineHooks::run(None).await;
    }

    #[tokio::test]
    async fn test_hook_invoked() {
        let hook = Arc::new(CountingHook {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let slot: Arc<dyn PipelineHook> = Arc::clone(&hook) as _;
        PipelineHooks::run(Some(&slot)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hook_errors_are_swallowed() {
        let hook = Arc::new(CountingHook {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let slot: Arc<dyn PipelineHook> = Arc::clone(&hook) as _;
        // Does not panic or propagate.
        PipelineHooks::run(Some(&slot)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }
}
