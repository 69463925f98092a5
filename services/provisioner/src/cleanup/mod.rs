//! Expiry and garbage collection.
//!
//! Three independent timeouts:
//! - requests that hold a machine but never finish provisioning fail after
//!   the allocation timeout
//! - settled-request markers are dropped after the tracking TTL
//! - elastic instance records that died or never started are deleted
//!
//! Garbage collection never hands a static machine to anyone. Machines are
//! only freed by the reconciler's release path or when a request record
//! disappears.

mod collector;

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use collector::{CleanupStats, GarbageCollector};

use crate::backend::InstanceTtl;
use crate::model::{ProvisioningRequest, RequestState, RequestStatus};

/// Timeouts shared by the reconciler and the garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Longest time a request may hold a machine without being provisioned.
    pub allocation_timeout: Duration,

    /// How long settled-request markers are kept.
    pub tracking_ttl: Duration,

    /// Elastic instance record TTLs.
    pub instance_ttl: InstanceTtl,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            allocation_timeout: Duration::from_secs(60 * 60),
            tracking_ttl: Duration::from_secs(24 * 60 * 60),
            instance_ttl: InstanceTtl::default(),
        }
    }
}

impl ExpiryPolicy {
    /// A request holding a machine past the allocation timeout without
    /// having been provisioned.
    pub fn allocation_expired(&self, request: &ProvisioningRequest, now: DateTime<Utc>) -> bool {
        let Some(status) = &request.status else {
            return false;
        };
        if !matches!(status.state, RequestState::Allocated | RequestState::Provisioning) {
            return false;
        }
        if status.provisioned {
            return false;
        }
        status
            .allocated_at
            .and_then(|at| (now - at).to_std().ok())
            .is_some_and(|age| age > self.allocation_timeout)
    }

    /// Status written when a request expires. The handle is kept.
    pub fn expired_status(&self, status: &RequestStatus) -> RequestStatus {
        status.with_state(
            RequestState::Failed,
            Some(format!(
                "not provisioned within {}s of allocation",
                self.allocation_timeout.as_secs()
            )),
        )
    }

    /// Whether a marker set at `marked_at` has outlived the tracking TTL.
    pub fn tracking_expired(&self, marked_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - marked_at)
            .to_std()
            .is_ok_and(|age| age >= self.tracking_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackendType, RequestSpec};
    use chrono::Duration as ChronoDuration;
    use rstest::rstest;

    fn allocated_at(at: DateTime<Utc>, state: RequestState) -> ProvisioningRequest {
        let mut req = ProvisioningRequest::new("r", RequestSpec::default());
        let mut status = RequestStatus::allocated(BackendType::Static, "10.0.0.1".into(), None, at);
        status.state = state;
        req.status = Some(status);
        req
    }

    #[rstest]
    #[case(RequestState::Allocated, 59, false)]
    #[case(RequestState::Allocated, 61, true)]
    #[case(RequestState::Provisioning, 61, true)]
    #[case(RequestState::Ready, 61, false)]
    #[case(RequestState::Failed, 61, false)]
    fn test_allocation_expiry(
        #[case] state: RequestState,
        #[case] minutes: i64,
        #[case] expected: bool,
    ) {
        let t = Utc::now();
        let req = allocated_at(t, state);

        let expired = ExpiryPolicy::default().allocation_expired(&req, t + ChronoDuration::minutes(minutes));

        assert_eq!(expired, expected);
    }

    #[test]
    fn test_expired_status_keeps_handle() {
        let t = Utc::now();
        let req = allocated_at(t, RequestState::Allocated);

        let status = ExpiryPolicy::default().expired_status(req.status.as_ref().unwrap());

        assert_eq!(status.state, RequestState::Failed);
        assert_eq!(status.resource_handle.as_deref(), Some("10.0.0.1"));
        assert!(status.message.is_some());
    }

    #[test]
    fn test_tracking_expiry() {
        let t = Utc::now();
        let policy = ExpiryPolicy::default();

        assert!(!policy.tracking_expired(t, t + ChronoDuration::hours(23)));
        assert!(policy.tracking_expired(t, t + ChronoDuration::hours(24)));
    }
}
