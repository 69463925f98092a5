//! Loop supervision.
//!
//! Each loop runs in its own task. When the task dies (a panic inside a
//! pass), the supervisor builds a fresh loop from its factory and starts it
//! again after an exponential backoff. A loop that dies too often within the
//! restart window is given up on.
//!
//! Loops keep no state that is not recoverable from the store, so a fresh
//! loop picks up exactly where the dead one stopped.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use trainvm_reconcile::{BackoffPolicy, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

use crate::worker::{LoopWorker, ReconcileLoop};

/// Loop restart policy.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum restarts within the window.
    pub max_restarts: u32,

    /// Time window for counting restarts.
    pub window: Duration,

    /// Delay before each restart.
    pub backoff: BackoffPolicy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RETRIES,
            window: DEFAULT_RETRY_WINDOW,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Why a supervised loop stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Shutdown was signaled.
    Shutdown,
    /// The loop died more often than the policy allows.
    GaveUp,
}

/// Run a loop built by `factory` until shutdown, restarting it when it dies.
pub async fn supervise<F, L>(
    name: &'static str,
    interval: Duration,
    policy: RestartPolicy,
    mut shutdown: watch::Receiver<bool>,
    factory: F,
) -> SupervisorExit
where
    F: Fn() -> L,
    L: ReconcileLoop + 'static,
{
    let mut restarts = RetryTracker::new(policy.max_restarts, policy.window);

    loop {
        let worker = LoopWorker::new(factory(), interval);
        let result = tokio::spawn(worker.run(shutdown.clone())).await;

        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            info!(worker = name, "Supervised loop stopped");
            return SupervisorExit::Shutdown;
        }

        match result {
            Ok(()) => warn!(worker = name, "Loop exited unexpectedly"),
            Err(e) => error!(worker = name, error = %e, "Loop task died"),
        }

        if restarts.record_failure(name) {
            error!(
                worker = name,
                max_restarts = policy.max_restarts,
                window_secs = policy.window.as_secs(),
                "Loop exceeded max restarts, giving up"
            );
            return SupervisorExit::GaveUp;
        }

        let attempt = restarts.failure_count(name).saturating_sub(1);
        let delay = policy.backoff.delay(attempt);
        info!(
            worker = name,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Restarting loop"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return SupervisorExit::Shutdown;
                }
            }
        }
    }
}
