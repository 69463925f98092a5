//! Lifecycle reconciler for one intake path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use trainvm_reconcile::TrackingSet;

use super::decision::{self, ProbeVerdict, Step};
use super::{transition, ReconcileError};
use crate::backend::{used_handles, BackendPolicy, Backends};
use crate::cleanup::ExpiryPolicy;
use crate::model::{
    BackendType, ProvisioningRequest, RequestSource, RequestState, RequestStatus,
};
use crate::provision::{resolve_or_default, ConfigResolver, ProvisionTarget, Provisioner};
use crate::store::Api;
use crate::worker::ReconcileLoop;

/// Settled markers are keyed by name and creation time so a recreated
/// request with the same name is reported again.
type SettledKey = (String, Option<DateTime<Utc>>);

/// Statistics from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub seen: usize,
    pub allocated: usize,
    pub provisioned: usize,
    pub released: usize,
    pub failed: usize,
    pub errors: usize,
}

impl ReconcileStats {
    fn changed(&self) -> bool {
        self.allocated + self.provisioned + self.released + self.failed + self.errors > 0
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Unchanged => {}
            Outcome::Allocated => self.allocated += 1,
            Outcome::Provisioned => self.provisioned += 1,
            Outcome::Released => self.released += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unchanged,
    Allocated,
    Provisioned,
    Released,
    Failed,
}

/// Advances requests of one intake path through the lifecycle.
pub struct LifecycleReconciler {
    source: RequestSource,
    requests: Api<ProvisioningRequest>,
    backends: Backends,
    provisioner: Arc<dyn Provisioner>,
    resolver: Arc<dyn ConfigResolver>,
    expiry: ExpiryPolicy,
    settled: TrackingSet<SettledKey>,
}

impl LifecycleReconciler {
    pub fn new(
        source: RequestSource,
        requests: Api<ProvisioningRequest>,
        backends: Backends,
        provisioner: Arc<dyn Provisioner>,
        resolver: Arc<dyn ConfigResolver>,
        expiry: ExpiryPolicy,
    ) -> Self {
        Self {
            source,
            requests,
            backends,
            provisioner,
            resolver,
            expiry,
            settled: TrackingSet::new(),
        }
    }

    /// Number of settled-request markers currently held.
    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    /// When `request` was first seen settled, if it is still tracked.
    pub fn settled_since(&self, request: &ProvisioningRequest) -> Option<DateTime<Utc>> {
        self.settled.marked_at(&Self::settled_key(request))
    }

    fn settled_key(request: &ProvisioningRequest) -> SettledKey {
        (request.id().to_string(), request.metadata.creation_timestamp)
    }

    /// Run one reconciliation pass observed at `now`.
    ///
    /// A failed listing fails the pass. Per-request failures are logged and
    /// retried on the next pass.
    #[instrument(skip(self), fields(source = %self.source))]
    pub async fn reconcile(&mut self, now: DateTime<Utc>) -> Result<ReconcileStats, ReconcileError> {
        let all = self.requests.list().await?;

        // Static handles are shared by both intake paths.
        let mut used = used_handles(&all);
        self.prune_settled(&all, now);

        let source = self.source;
        let mut stats = ReconcileStats::default();
        for request in all.iter().filter(|r| r.spec.source == source) {
            stats.seen += 1;
            match self.reconcile_one(request, &mut used, now).await {
                Ok(outcome) => stats.record(outcome),
                Err(e) => {
                    stats.errors += 1;
                    warn!(request = %request.id(), error = %e, "Failed to reconcile request");
                }
            }
        }

        Ok(stats)
    }

    async fn reconcile_one(
        &mut self,
        request: &ProvisioningRequest,
        used: &mut BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, ReconcileError> {
        match decision::next_step(request, now, &self.expiry) {
            Step::Initialize => {
                let initial = RequestStatus::default();
                if !transition(&self.requests, request.id(), RequestState::Requested, &initial).await? {
                    return Ok(Outcome::Unchanged);
                }
                debug!(request = %request.id(), "Initialized request status");
                self.allocate(request, RequestState::Requested, used, now).await
            }
            Step::Allocate => self.allocate(request, request.state(), used, now).await,
            Step::Expire => self.expire(request).await,
            Step::BootWait { remaining } => {
                debug!(
                    request = %request.id(),
                    remaining_secs = remaining.as_secs(),
                    "Waiting for machine to boot"
                );
                Ok(Outcome::Unchanged)
            }
            Step::Probe {
                backend,
                handle,
                age,
            } => self.probe(request, backend, &handle, age, now).await,
            Step::Resume { backend } => {
                let address = request
                    .status
                    .as_ref()
                    .and_then(|s| s.connect_address())
                    .map(str::to_string);
                match address {
                    Some(address) => {
                        info!(request = %request.id(), "Resuming interrupted provisioning");
                        self.provision(request, RequestState::Provisioning, backend, address, now)
                            .await
                    }
                    None => self.release(request, "provisioning without an address").await,
                }
            }
            Step::Release { reason } => self.release(request, &reason).await,
            Step::Settled => {
                self.note_settled(request, now);
                Ok(Outcome::Unchanged)
            }
        }
    }

    /// Hand a machine to a waiting request, static pool first.
    async fn allocate(
        &self,
        request: &ProvisioningRequest,
        from: RequestState,
        used: &mut BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, ReconcileError> {
        let preference = request.spec.backend_preference;

        if preference.prefer_static {
            if let Some(acquired) = self.backends.static_pool.acquire(request, used).await? {
                used.insert(acquired.handle.clone());
                let status = RequestStatus::allocated(
                    BackendType::Static,
                    acquired.handle.clone(),
                    acquired.address,
                    now,
                );
                if !transition(&self.requests, request.id(), from, &status).await? {
                    return Ok(Outcome::Unchanged);
                }
                info!(request = %request.id(), handle = %acquired.handle, "Allocated static machine");
                return Ok(Outcome::Allocated);
            }
        }

        if preference.elastic_fallback_enabled {
            if let Some(elastic) = &self.backends.elastic {
                let Some(acquired) = elastic.acquire(request, used).await? else {
                    debug!(request = %request.id(), "Elastic instance not available yet");
                    return Ok(Outcome::Unchanged);
                };
                let status = RequestStatus::allocated(
                    BackendType::Elastic,
                    acquired.handle.clone(),
                    acquired.address,
                    now,
                );
                if !transition(&self.requests, request.id(), from, &status).await? {
                    return Ok(Outcome::Unchanged);
                }
                info!(request = %request.id(), handle = %acquired.handle, "Allocated elastic machine");
                return Ok(Outcome::Allocated);
            }
        }

        let reason = if preference.elastic_fallback_enabled {
            "no static machine available and no elastic backend configured"
        } else {
            "no static machine available and elastic fallback disabled"
        };
        let status = RequestStatus {
            state: RequestState::Failed,
            message: Some(reason.to_string()),
            ..Default::default()
        };
        if !transition(&self.requests, request.id(), from, &status).await? {
            return Ok(Outcome::Unchanged);
        }
        warn!(request = %request.id(), reason, "Request failed: resources exhausted");
        Ok(Outcome::Failed)
    }

    async fn probe(
        &self,
        request: &ProvisioningRequest,
        backend: BackendType,
        handle: &str,
        age: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<Outcome, ReconcileError> {
        let Some(policy) = BackendPolicy::for_backend(backend) else {
            return self.release(request, "allocated without a backend type").await;
        };
        let report = self.backends.get(backend)?.probe_liveness(handle).await?;

        match decision::after_probe(report.status, age, &policy) {
            ProbeVerdict::Wait => {
                debug!(
                    request = %request.id(),
                    handle = %handle,
                    status = ?report.status,
                    age_secs = age.as_secs(),
                    "Machine not reachable yet"
                );
                Ok(Outcome::Unchanged)
            }
            ProbeVerdict::Release { reason } => self.release(request, &reason).await,
            ProbeVerdict::Gate => {
                let address = report
                    .address
                    .or_else(|| {
                        request
                            .status
                            .as_ref()
                            .and_then(|s| s.connect_address())
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| handle.to_string());
                self.provision(request, RequestState::Allocated, backend, address, now)
                    .await
            }
        }
    }

    /// Run the readiness gate and configuration on a reachable machine.
    ///
    /// A gate failure leaves the request where it is for the next pass. A
    /// configuration failure fails the request and keeps its machine.
    async fn provision(
        &self,
        request: &ProvisioningRequest,
        from: RequestState,
        backend: BackendType,
        address: String,
        now: DateTime<Utc>,
    ) -> Result<Outcome, ReconcileError> {
        let Some(policy) = BackendPolicy::for_backend(backend) else {
            return self.release(request, "provisioning without a backend type").await;
        };
        let Some(current) = request.status.clone() else {
            return Ok(Outcome::Unchanged);
        };

        let target = ProvisionTarget {
            address: address.clone(),
            ssh_username: policy.ssh_username.to_string(),
        };

        if let Err(e) = self
            .provisioner
            .wait_for_ready(&target, policy.ready_timeout)
            .await
        {
            info!(request = %request.id(), address = %address, error = %e, "Readiness gate not passed, retrying next pass");
            return Ok(Outcome::Unchanged);
        }

        let mut status = current;
        status.address = Some(address.clone());
        status.state = RequestState::Provisioning;
        status.message = None;
        if from == RequestState::Allocated {
            if !transition(&self.requests, request.id(), RequestState::Allocated, &status).await? {
                return Ok(Outcome::Unchanged);
            }
            info!(request = %request.id(), address = %address, "Provisioning machine");
        }

        let bundle = resolve_or_default(self.resolver.as_ref(), request.id()).await;
        let started = Instant::now();
        let result = self
            .provisioner
            .run_configuration(&target, request.id(), &request.spec.workload, &bundle)
            .await;

        match result {
            Ok(()) => {
                status.state = RequestState::Ready;
                status.provisioned = true;
                // Configuration can take minutes; stamp when it finished.
                let elapsed = chrono::Duration::from_std(started.elapsed())
                    .unwrap_or(chrono::Duration::zero());
                status.ready_at = Some(now + elapsed);
                if !transition(&self.requests, request.id(), RequestState::Provisioning, &status).await? {
                    return Ok(Outcome::Unchanged);
                }
                info!(request = %request.id(), address = %address, backend = %backend, "Request ready");
                Ok(Outcome::Provisioned)
            }
            Err(e) => {
                let failed = status.with_state(
                    RequestState::Failed,
                    Some(format!("configuration failed: {e}")),
                );
                if !transition(&self.requests, request.id(), RequestState::Provisioning, &failed).await? {
                    return Ok(Outcome::Unchanged);
                }
                warn!(request = %request.id(), address = %address, error = %e, "Provisioning failed, machine kept");
                Ok(Outcome::Failed)
            }
        }
    }

    /// Give the machine back and send the request back to intake.
    async fn release(&self, request: &ProvisioningRequest, reason: &str) -> Result<Outcome, ReconcileError> {
        if let (Some(handle), Ok(provider)) = (request.handle(), self.backends.get(request.backend_type())) {
            provider.release(handle).await?;
            debug!(
                request = %request.id(),
                handle = %handle,
                backend = %provider.backend_type(),
                "Machine given back to its backend"
            );
        }

        let status = RequestStatus::released(reason);
        if !transition(&self.requests, request.id(), request.state(), &status).await? {
            return Ok(Outcome::Unchanged);
        }
        warn!(
            request = %request.id(),
            handle = request.handle().unwrap_or_default(),
            reason,
            "Released machine, request re-enters intake"
        );
        Ok(Outcome::Released)
    }

    async fn expire(&self, request: &ProvisioningRequest) -> Result<Outcome, ReconcileError> {
        let Some(current) = &request.status else {
            return Ok(Outcome::Unchanged);
        };
        let status = self.expiry.expired_status(current);
        if !transition(&self.requests, request.id(), current.state, &status).await? {
            return Ok(Outcome::Unchanged);
        }
        warn!(
            request = %request.id(),
            timeout_secs = self.expiry.allocation_timeout.as_secs(),
            "Request not provisioned in time"
        );
        Ok(Outcome::Failed)
    }

    fn note_settled(&mut self, request: &ProvisioningRequest, now: DateTime<Utc>) {
        if !self.settled.mark(Self::settled_key(request), now) {
            return;
        }
        let message = request.status.as_ref().and_then(|s| s.message.as_deref());
        match request.state() {
            RequestState::Ready => info!(request = %request.id(), handle = request.handle().unwrap_or_default(), "Request settled ready"),
            state => info!(request = %request.id(), state = %state, message, "Request settled"),
        }
    }

    /// Drop markers of vanished requests, and of failed ones past the
    /// tracking TTL so they are reported again.
    fn prune_settled(&mut self, all: &[ProvisioningRequest], now: DateTime<Utc>) {
        let present: BTreeMap<SettledKey, RequestState> = all
            .iter()
            .filter(|r| r.spec.source == self.source)
            .map(|r| (Self::settled_key(r), r.state()))
            .collect();

        let expiry = self.expiry;
        let removed = self.settled.retain(|key, marked_at| match present.get(key) {
            None => false,
            Some(RequestState::Failed | RequestState::Released) => {
                !expiry.tracking_expired(marked_at, now)
            }
            Some(_) => true,
        });
        if removed > 0 {
            debug!(removed, "Pruned settled-request markers");
        }
    }
}

#[async_trait]
impl ReconcileLoop for LifecycleReconciler {
    fn name(&self) -> &'static str {
        match self.source {
            RequestSource::Platform => "platform-reconciler",
            RequestSource::Broker => "broker-reconciler",
        }
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let stats = self.reconcile(now).await?;
        if stats.changed() {
            info!(
                source = %self.source,
                seen = stats.seen,
                allocated = stats.allocated,
                provisioned = stats.provisioned,
                released = stats.released,
                failed = stats.failed,
                errors = stats.errors,
                "Reconciliation pass complete"
            );
        } else {
            debug!(source = %self.source, seen = stats.seen, "Reconciliation pass complete");
        }
        Ok(())
    }
}
