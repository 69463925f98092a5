//! Pure lifecycle decisions.
//!
//! Nothing here touches the store or a machine. Backend timing comes from
//! [`BackendPolicy::for_backend`], so two requests on the same backend type
//! in the same situation always get the same answer.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backend::{BackendPolicy, ResourceStatus};
use crate::cleanup::ExpiryPolicy;
use crate::model::{BackendType, ProvisioningRequest, RequestState};

/// What to do with a request this pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// No status yet; write the initial one, then allocate.
    Initialize,
    /// Find a machine.
    Allocate,
    /// Held a machine too long without being provisioned.
    Expire,
    /// Too early to probe.
    BootWait { remaining: Duration },
    /// Probe the machine.
    Probe {
        backend: BackendType,
        handle: String,
        age: Duration,
    },
    /// Configuration was interrupted; gate and configure again.
    Resume { backend: BackendType },
    /// Status is inconsistent; give the machine back and start over.
    Release { reason: String },
    /// Ready or Failed.
    Settled,
}

/// Outcome of a liveness probe on an allocated machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeVerdict {
    /// Reachable; run the readiness gate and configure it.
    Gate,
    /// Not reachable yet but still within the backend's grace.
    Wait,
    /// Give up on this machine.
    Release { reason: String },
}

fn age_since(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - at).to_std().unwrap_or_default()
}

/// Decide the next step for a request.
pub fn next_step(request: &ProvisioningRequest, now: DateTime<Utc>, expiry: &ExpiryPolicy) -> Step {
    let Some(status) = &request.status else {
        return Step::Initialize;
    };

    if status.state.awaits_allocation() {
        return Step::Allocate;
    }
    if status.state.is_terminal() {
        return Step::Settled;
    }

    if expiry.allocation_expired(request, now) {
        return Step::Expire;
    }

    let Some(policy) = BackendPolicy::for_backend(status.backend_type) else {
        return Step::Release {
            reason: format!("{} without a backend type", status.state),
        };
    };
    let Some(handle) = request.handle() else {
        return Step::Release {
            reason: format!("{} without a resource handle", status.state),
        };
    };
    let Some(allocated_at) = status.allocated_at else {
        return Step::Release {
            reason: format!("{} without an allocation time", status.state),
        };
    };

    if status.state == RequestState::Provisioning {
        return Step::Resume {
            backend: status.backend_type,
        };
    }

    let age = age_since(allocated_at, now);
    if age < policy.boot_wait {
        return Step::BootWait {
            remaining: policy.boot_wait - age,
        };
    }

    Step::Probe {
        backend: status.backend_type,
        handle: handle.to_string(),
        age,
    }
}

/// Decide what a probe result means for an allocated machine of `age`.
pub fn after_probe(status: ResourceStatus, age: Duration, policy: &BackendPolicy) -> ProbeVerdict {
    match status {
        ResourceStatus::Live => ProbeVerdict::Gate,
        ResourceStatus::Pending if age < policy.unreachable_grace => ProbeVerdict::Wait,
        ResourceStatus::Pending => ProbeVerdict::Release {
            reason: format!(
                "unreachable {}s after allocation",
                age.as_secs()
            ),
        },
        ResourceStatus::Absent => ProbeVerdict::Release {
            reason: "backing machine disappeared".to_string(),
        },
        ResourceStatus::PermanentlyFailed => ProbeVerdict::Release {
            reason: "backing machine failed permanently".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RequestSpec, RequestStatus};
    use chrono::Duration as ChronoDuration;
    use rstest::rstest;

    fn request(state: RequestState, backend: BackendType, at: DateTime<Utc>) -> ProvisioningRequest {
        let mut req = ProvisioningRequest::new("r1", RequestSpec::default());
        let mut status = RequestStatus::allocated(backend, "h1".to_string(), None, at);
        status.state = state;
        req.status = Some(status);
        req
    }

    #[test]
    fn test_missing_status_initializes() {
        let req = ProvisioningRequest::new("r1", RequestSpec::default());
        assert_eq!(next_step(&req, Utc::now(), &ExpiryPolicy::default()), Step::Initialize);
    }

    #[rstest]
    #[case(RequestState::Requested, Step::Allocate)]
    #[case(RequestState::Released, Step::Allocate)]
    #[case(RequestState::Ready, Step::Settled)]
    #[case(RequestState::Failed, Step::Settled)]
    fn test_state_driven_steps(#[case] state: RequestState, #[case] expected: Step) {
        let t = Utc::now();
        let req = request(state, BackendType::Static, t);
        assert_eq!(next_step(&req, t, &ExpiryPolicy::default()), expected);
    }

    #[rstest]
    #[case(BackendType::Static, 10, true)]
    #[case(BackendType::Static, 31, false)]
    #[case(BackendType::Elastic, 31, true)]
    #[case(BackendType::Elastic, 121, false)]
    fn test_boot_wait_is_per_backend(
        #[case] backend: BackendType,
        #[case] secs: i64,
        #[case] waiting: bool,
    ) {
        let t = Utc::now();
        let req = request(RequestState::Allocated, backend, t);

        let step = next_step(&req, t + ChronoDuration::seconds(secs), &ExpiryPolicy::default());

        assert_eq!(matches!(step, Step::BootWait { .. }), waiting);
        if !waiting {
            assert!(matches!(step, Step::Probe { .. }));
        }
    }

    #[test]
    fn test_expiry_wins_over_probe() {
        let t = Utc::now();
        let req = request(RequestState::Allocated, BackendType::Elastic, t);

        let step = next_step(&req, t + ChronoDuration::minutes(61), &ExpiryPolicy::default());

        assert_eq!(step, Step::Expire);
    }

    #[test]
    fn test_provisioning_resumes() {
        let t = Utc::now();
        let req = request(RequestState::Provisioning, BackendType::Static, t);

        let step = next_step(&req, t + ChronoDuration::seconds(1), &ExpiryPolicy::default());

        assert_eq!(
            step,
            Step::Resume {
                backend: BackendType::Static
            }
        );
    }

    #[test]
    fn test_allocated_without_handle_is_released() {
        let t = Utc::now();
        let mut req = request(RequestState::Allocated, BackendType::Static, t);
        if let Some(status) = req.status.as_mut() {
            status.resource_handle = None;
        }

        assert!(matches!(
            next_step(&req, t, &ExpiryPolicy::default()),
            Step::Release { .. }
        ));
    }

    #[rstest]
    #[case(BackendType::Elastic, 9 * 60, ProbeVerdict::Wait)]
    #[case(BackendType::Static, 20, ProbeVerdict::Wait)]
    fn test_pending_within_grace_waits(
        #[case] backend: BackendType,
        #[case] secs: u64,
        #[case] expected: ProbeVerdict,
    ) {
        let policy = BackendPolicy::for_backend(backend).unwrap();
        assert_eq!(
            after_probe(ResourceStatus::Pending, Duration::from_secs(secs), &policy),
            expected
        );
    }

    #[rstest]
    #[case(BackendType::Elastic, 11 * 60)]
    #[case(BackendType::Static, 31)]
    fn test_pending_past_grace_releases(#[case] backend: BackendType, #[case] secs: u64) {
        let policy = BackendPolicy::for_backend(backend).unwrap();
        assert!(matches!(
            after_probe(ResourceStatus::Pending, Duration::from_secs(secs), &policy),
            ProbeVerdict::Release { .. }
        ));
    }

    #[test]
    fn test_live_gates_and_dead_releases() {
        let policy = BackendPolicy::ELASTIC;
        let age = Duration::from_secs(150);

        assert_eq!(after_probe(ResourceStatus::Live, age, &policy), ProbeVerdict::Gate);
        assert!(matches!(
            after_probe(ResourceStatus::Absent, age, &policy),
            ProbeVerdict::Release { .. }
        ));
        assert!(matches!(
            after_probe(ResourceStatus::PermanentlyFailed, age, &policy),
            ProbeVerdict::Release { .. }
        ));
    }
}
