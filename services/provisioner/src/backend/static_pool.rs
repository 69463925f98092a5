//! Fixed pool of pre-built machines.
//!
//! Machines are never created or destroyed, only handed out and freed. The
//! set of handles in use is not stored anywhere; it is recomputed from the
//! request records every pass with [`used_handles`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{
    Acquisition, BackendError, BackendPolicy, BackendProvider, LivenessProbe, ResourceReport,
    ResourceStatus,
};
use crate::model::{BackendType, ProvisioningRequest, RequestState};

/// Default pool membership.
pub const DEFAULT_STATIC_POOL: &[&str] = &["192.168.2.37", "192.168.2.38"];

/// Static handles held by some request.
///
/// Live requests hold their handle. Failed requests keep theirs too: a
/// machine that failed configuration is not recycled while its request
/// record exists.
pub fn used_handles(requests: &[ProvisioningRequest]) -> BTreeSet<String> {
    requests
        .iter()
        .filter(|r| r.backend_type() == BackendType::Static)
        .filter(|r| r.state().is_live() || r.state() == RequestState::Failed)
        .filter_map(|r| r.handle().map(str::to_string))
        .collect()
}

/// First-fit provider over a fixed address list.
pub struct StaticPoolProvider {
    pool: Vec<String>,
    probe: Arc<dyn LivenessProbe>,
}

impl StaticPoolProvider {
    pub fn new(pool: Vec<String>, probe: Arc<dyn LivenessProbe>) -> Self {
        Self { pool, probe }
    }
}

#[async_trait]
impl BackendProvider for StaticPoolProvider {
    fn backend_type(&self) -> BackendType {
        BackendType::Static
    }

    async fn acquire(
        &self,
        request: &ProvisioningRequest,
        used: &BTreeSet<String>,
    ) -> Result<Option<Acquisition>, BackendError> {
        for handle in &self.pool {
            if used.contains(handle) {
                continue;
            }
            if !self.probe.probe(handle, &BackendPolicy::STATIC.probe).await {
                debug!(request = %request.id(), handle = %handle, "Skipping unreachable static machine");
                continue;
            }
            return Ok(Some(Acquisition {
                handle: handle.clone(),
                address: Some(handle.clone()),
            }));
        }
        Ok(None)
    }

    async fn probe_liveness(&self, handle: &str) -> Result<ResourceReport, BackendError> {
        let status = if self.probe.probe(handle, &BackendPolicy::STATIC.probe).await {
            ResourceStatus::Live
        } else {
            ResourceStatus::Pending
        };
        Ok(ResourceReport::new(status, Some(handle.to_string())))
    }

    async fn release(&self, handle: &str) -> Result<(), BackendError> {
        debug!(handle = %handle, "Static machine freed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockProbe;
    use crate::model::{RequestSpec, RequestStatus};
    use chrono::Utc;

    fn request(name: &str, state: RequestState, handle: Option<&str>) -> ProvisioningRequest {
        let mut req = ProvisioningRequest::new(name, RequestSpec::default());
        let mut status = match handle {
            Some(h) => RequestStatus::allocated(BackendType::Static, h.to_string(), None, Utc::now()),
            None => RequestStatus::default(),
        };
        status.state = state;
        req.status = Some(status);
        req
    }

    fn provider(probe: MockProbe) -> StaticPoolProvider {
        StaticPoolProvider::new(
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            Arc::new(probe),
        )
    }

    #[test]
    fn test_used_handles_counts_live_and_failed() {
        let requests = vec![
            request("a", RequestState::Ready, Some("10.0.0.1")),
            request("b", RequestState::Failed, Some("10.0.0.2")),
            request("c", RequestState::Released, None),
            request("d", RequestState::Requested, None),
        ];

        let used = used_handles(&requests);

        assert_eq!(used.len(), 2);
        assert!(used.contains("10.0.0.1"));
        assert!(used.contains("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_acquire_first_fit() {
        let pool = provider(MockProbe::all_live());
        let req = request("r", RequestState::Requested, None);

        let got = pool.acquire(&req, &BTreeSet::new()).await.unwrap().unwrap();
        assert_eq!(got.handle, "10.0.0.1");

        let used = BTreeSet::from(["10.0.0.1".to_string()]);
        let got = pool.acquire(&req, &used).await.unwrap().unwrap();
        assert_eq!(got.handle, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_acquire_skips_unreachable() {
        let probe = MockProbe::all_live();
        probe.set_live("10.0.0.1", false).await;
        let pool = provider(probe);
        let req = request("r", RequestState::Requested, None);

        let got = pool.acquire(&req, &BTreeSet::new()).await.unwrap().unwrap();

        assert_eq!(got.handle, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_acquire_exhausted() {
        let pool = provider(MockProbe::all_live());
        let req = request("r", RequestState::Requested, None);
        let used = BTreeSet::from(["10.0.0.1".to_string(), "10.0.0.2".to_string()]);

        assert!(pool.acquire(&req, &used).await.unwrap().is_none());
    }
}
