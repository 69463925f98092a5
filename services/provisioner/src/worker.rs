//! Periodic loop driver.
//!
//! Runs a [`ReconcileLoop`] on a fixed interval until shutdown is signaled.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

/// One independently scheduled reconciliation loop.
///
/// A tick must be safe to repeat: the loop may be rebuilt from scratch at
/// any time and resume from the store alone.
#[async_trait]
pub trait ReconcileLoop: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run one pass observed at `now`.
    async fn tick(&mut self, now: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Runs a loop on its interval.
pub struct LoopWorker<L> {
    inner: L,
    interval: Duration,
}

impl<L: ReconcileLoop> LoopWorker<L> {
    pub fn new(inner: L, interval: Duration) -> Self {
        Self { inner, interval }
    }

    /// Run until shutdown is signaled or the sender is dropped.
    ///
    /// A pass in flight always completes before the worker exits.
    #[instrument(skip(self, shutdown), fields(worker = self.inner.name()))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reconciliation worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                info!("Reconciliation worker shutting down");
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.inner.tick(Utc::now()).await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciliation worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Counting {
        ticks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ReconcileLoop for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn tick(&mut self, _now: DateTime<Utc>) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("every pass fails")
        }
    }

    #[tokio::test]
    async fn test_worker_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        let worker = LoopWorker::new(
            Counting {
                ticks: ticks.clone(),
            },
            Duration::from_millis(10),
        );

        let handle = tokio::spawn(worker.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_worker_stops_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        let worker = LoopWorker::new(
            Counting {
                ticks: Arc::new(AtomicU32::new(0)),
            },
            Duration::from_secs(3600),
        );

        let handle = tokio::spawn(worker.run(rx));
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
