//! Garbage collection loop.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use super::ExpiryPolicy;
use crate::backend::ElasticProvider;
use crate::model::ProvisioningRequest;
use crate::reconciler::{transition, ReconcileError};
use crate::store::Api;
use crate::worker::ReconcileLoop;

/// Statistics from one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub expired_requests: usize,
    pub deleted_instances: usize,
    pub errors: usize,
}

/// Enforces the allocation timeout on every request and the elastic
/// instance TTLs.
pub struct GarbageCollector {
    requests: Api<ProvisioningRequest>,
    elastic: Option<Arc<ElasticProvider>>,
    policy: ExpiryPolicy,
}

impl GarbageCollector {
    pub fn new(
        requests: Api<ProvisioningRequest>,
        elastic: Option<Arc<ElasticProvider>>,
        policy: ExpiryPolicy,
    ) -> Self {
        Self {
            requests,
            elastic,
            policy,
        }
    }

    /// Run one cleanup pass observed at `now`.
    #[instrument(skip(self))]
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<CleanupStats, ReconcileError> {
        let mut stats = CleanupStats::default();

        for request in self.requests.list().await? {
            if !self.policy.allocation_expired(&request, now) {
                continue;
            }
            let Some(current) = &request.status else {
                continue;
            };

            let status = self.policy.expired_status(current);
            match transition(&self.requests, request.id(), current.state, &status).await {
                Ok(true) => {
                    stats.expired_requests += 1;
                    warn!(
                        request = %request.id(),
                        handle = request.handle().unwrap_or_default(),
                        timeout_secs = self.policy.allocation_timeout.as_secs(),
                        "Expired unprovisioned request"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    stats.errors += 1;
                    warn!(request = %request.id(), error = %e, "Failed to expire request");
                }
            }
        }

        if let Some(elastic) = &self.elastic {
            match elastic.collect_garbage(now, self.policy.instance_ttl).await {
                Ok(deleted) => stats.deleted_instances = deleted,
                Err(e) => {
                    stats.errors += 1;
                    warn!(error = %e, "Elastic instance cleanup failed");
                }
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl ReconcileLoop for GarbageCollector {
    fn name(&self) -> &'static str {
        "garbage-collector"
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let stats = self.collect(now).await?;
        if stats.expired_requests > 0 || stats.deleted_instances > 0 || stats.errors > 0 {
            info!(
                expired_requests = stats.expired_requests,
                deleted_instances = stats.deleted_instances,
                errors = stats.errors,
                "Cleanup pass complete"
            );
        }
        Ok(())
    }
}
