//! Propagation of ready requests onto platform machine records.
//!
//! The platform keeps its own record per student machine and waits for an
//! address to appear on it. The bridge writes the address and login details
//! onto that record once a platform-path request is ready.
//!
//! The bridge does not own the target record, so it cannot tell "not yet
//! projected" from "projected and then edited back" by looking at it.
//! Instead a [`PropagationLedger`] keyed by `(request id, handle)` records
//! every completed projection. A recorded key is never projected again, even
//! if the target diverges later; the ledger only forgets keys whose request
//! is gone.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use trainvm_reconcile::{PropagationLedger, TrackingSet};

use crate::backend::BackendPolicy;
use crate::model::{PlatformMachine, ProvisioningRequest, RequestSource, RequestState};
use crate::store::{Api, StoreError};
use crate::worker::ReconcileLoop;

/// Platform machine status value written on projection.
pub const MACHINE_STATUS_READY: &str = "ready";

/// Statistics from one bridge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub candidates: usize,
    pub projected: usize,
    pub already_projected: usize,
    pub unmatched: usize,
    pub errors: usize,
    pub pruned: usize,
}

/// Projects ready platform requests onto platform machine records.
pub struct PropagationBridge {
    requests: Api<ProvisioningRequest>,
    machines: Api<PlatformMachine>,
    secret_name: String,
    ledger: PropagationLedger<(String, String)>,
    unmatched: TrackingSet<String>,
}

impl PropagationBridge {
    pub fn new(
        requests: Api<ProvisioningRequest>,
        machines: Api<PlatformMachine>,
        secret_name: impl Into<String>,
    ) -> Self {
        Self {
            requests,
            machines,
            secret_name: secret_name.into(),
            ledger: PropagationLedger::new(),
            unmatched: TrackingSet::new(),
        }
    }

    /// Completed projections.
    pub fn ledger(&self) -> &PropagationLedger<(String, String)> {
        &self.ledger
    }

    /// Run one bridge pass observed at `now`.
    #[instrument(skip(self))]
    pub async fn propagate(&mut self, now: DateTime<Utc>) -> Result<BridgeStats, StoreError> {
        let requests = self.requests.list().await?;
        let mut stats = BridgeStats::default();

        let ids: BTreeSet<&str> = requests.iter().map(|r| r.id()).collect();
        stats.pruned = self.ledger.retain(|(id, _)| ids.contains(id.as_str()));
        self.unmatched.retain(|id, _| ids.contains(id.as_str()));

        let mut candidates: Vec<&ProvisioningRequest> = requests
            .iter()
            .filter(|r| r.spec.source == RequestSource::Platform)
            .filter(|r| r.state() == RequestState::Ready)
            .filter(|r| r.handle().is_some())
            .collect();
        candidates.sort_by(|a, b| a.id().cmp(b.id()));
        stats.candidates = candidates.len();

        let pending: Vec<(&ProvisioningRequest, String)> = candidates
            .into_iter()
            .filter_map(|r| r.handle().map(|h| (r, h.to_string())))
            .filter(|(r, h)| {
                let done = self.ledger.contains(&(r.id().to_string(), h.clone()));
                if done {
                    stats.already_projected += 1;
                }
                !done
            })
            .collect();
        if pending.is_empty() {
            return Ok(stats);
        }

        let mut machines = self.machines.list().await?;
        machines.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        let mut claimed: BTreeSet<String> = BTreeSet::new();

        for (request, handle) in pending {
            let target = machines.iter().find(|m| {
                !claimed.contains(&m.metadata.name) && m.awaits_address_for(&request.spec.requester)
            });
            let Some(target) = target else {
                stats.unmatched += 1;
                if self.unmatched.mark(request.id().to_string(), now) {
                    warn!(
                        request = %request.id(),
                        requester = %request.spec.requester,
                        "No platform machine awaiting an address, retrying next pass"
                    );
                } else {
                    debug!(request = %request.id(), "Still no platform machine awaiting an address");
                }
                continue;
            };

            let machine_name = target.metadata.name.clone();
            match self.project(request, &machine_name).await {
                Ok(()) => {
                    claimed.insert(machine_name.clone());
                    self.ledger.record((request.id().to_string(), handle.clone()));
                    self.unmatched.clear(&request.id().to_string());
                    stats.projected += 1;
                    info!(
                        request = %request.id(),
                        machine = %machine_name,
                        handle = %handle,
                        "Projected ready request onto platform machine"
                    );
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(
                        request = %request.id(),
                        machine = %machine_name,
                        error = %e,
                        "Failed to project request, retrying next pass"
                    );
                }
            }
        }

        Ok(stats)
    }

    /// Write credentials and labels through the main path, then the address
    /// through the status path.
    async fn project(&self, request: &ProvisioningRequest, machine: &str) -> Result<(), StoreError> {
        let backend = request.backend_type();
        let ssh_username = BackendPolicy::for_backend(backend)
            .map(|p| p.ssh_username)
            .unwrap_or(BackendPolicy::STATIC.ssh_username);
        let address = request
            .status
            .as_ref()
            .and_then(|s| s.connect_address())
            .unwrap_or_default();

        self.machines
            .patch(
                machine,
                json!({
                    "metadata": {
                        "labels": {
                            "ready": "true",
                            "vm-type": backend.as_str(),
                        }
                    },
                    "spec": {
                        "secret_name": self.secret_name,
                        "ssh_username": ssh_username,
                    }
                }),
            )
            .await?;

        self.machines
            .patch_status(
                machine,
                json!({
                    "status": {
                        "status": MACHINE_STATUS_READY,
                        "public_ip": address,
                        "private_ip": address,
                        "hostname": address,
                    }
                }),
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl ReconcileLoop for PropagationBridge {
    fn name(&self) -> &'static str {
        "propagation-bridge"
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let stats = self.propagate(now).await?;
        if stats.projected > 0 || stats.errors > 0 || stats.pruned > 0 {
            info!(
                projected = stats.projected,
                already_projected = stats.already_projected,
                unmatched = stats.unmatched,
                errors = stats.errors,
                pruned = stats.pruned,
                ledger = self.ledger.len(),
                "Propagation pass complete"
            );
        }
        Ok(())
    }
}
