//! Backend resource providers.
//!
//! A provider hands out machines for requests and reports their health as a
//! four-way [`ResourceStatus`]. The lifecycle reconciler only sees that status,
//! so adding another backend never touches the state machine.
//!
//! Timing and probe behaviour is a pure function of [`BackendType`], see
//! [`BackendPolicy::for_backend`].

mod elastic;
mod probe;
mod static_pool;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use elastic::{instance_name, ElasticProvider, ElasticTemplate, InstanceTtl, INSTANCE_TYPE_LABEL};
pub use probe::{LivenessProbe, MockProbe, TcpProbe, DEFAULT_PROBE_PORT};
pub use static_pool::{used_handles, StaticPoolProvider, DEFAULT_STATIC_POOL};

use crate::model::{BackendType, ProvisioningRequest};
use crate::store::StoreError;

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("no {0} backend configured")]
    NotConfigured(BackendType),
}

/// Health of an acquired machine, as the reconciler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    /// The backing resource does not exist.
    Absent,
    /// Exists but is not reachable yet.
    Pending,
    /// Reachable.
    Live,
    /// Will never become reachable.
    PermanentlyFailed,
}

/// A probe result with the address the machine is reachable on, if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReport {
    pub status: ResourceStatus,
    pub address: Option<String>,
}

impl ResourceReport {
    pub fn new(status: ResourceStatus, address: Option<String>) -> Self {
        Self { status, address }
    }
}

/// A machine handed to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub handle: String,
    pub address: Option<String>,
}

/// How a liveness probe retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub connect_timeout: Duration,
    pub attempts: u32,
    pub sleep_between: Duration,
}

/// Per-backend timing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendPolicy {
    /// Minimum time after allocation before probing.
    pub boot_wait: Duration,
    /// How long after allocation a failing probe is tolerated.
    pub unreachable_grace: Duration,
    pub probe: ProbePolicy,
    /// Timeout handed to the provisioner's readiness gate.
    pub ready_timeout: Duration,
    /// Login user projected onto platform machines.
    pub ssh_username: &'static str,
}

impl BackendPolicy {
    pub const STATIC: BackendPolicy = BackendPolicy {
        boot_wait: Duration::from_secs(30),
        unreachable_grace: Duration::from_secs(30),
        probe: ProbePolicy {
            connect_timeout: Duration::from_secs(5),
            attempts: 1,
            sleep_between: Duration::ZERO,
        },
        ready_timeout: Duration::from_secs(2 * 60),
        ssh_username: "kube",
    };

    pub const ELASTIC: BackendPolicy = BackendPolicy {
        boot_wait: Duration::from_secs(2 * 60),
        unreachable_grace: Duration::from_secs(10 * 60),
        probe: ProbePolicy {
            connect_timeout: Duration::from_secs(15),
            attempts: 3,
            sleep_between: Duration::from_secs(10),
        },
        ready_timeout: Duration::from_secs(5 * 60),
        ssh_username: "ubuntu",
    };

    /// Policy for a backend type. `None` for requests without a backend.
    pub fn for_backend(backend: BackendType) -> Option<BackendPolicy> {
        match backend {
            BackendType::Static => Some(Self::STATIC),
            BackendType::Elastic => Some(Self::ELASTIC),
            BackendType::None => None,
        }
    }
}

/// A source of training machines.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Hand a machine to `request`. `used` holds static handles owned by
    /// other requests. Returns `None` when nothing can be handed out now.
    async fn acquire(
        &self,
        request: &ProvisioningRequest,
        used: &BTreeSet<String>,
    ) -> Result<Option<Acquisition>, BackendError>;

    /// Report the health of an acquired machine.
    async fn probe_liveness(&self, handle: &str) -> Result<ResourceReport, BackendError>;

    /// Give a machine back.
    async fn release(&self, handle: &str) -> Result<(), BackendError>;
}

/// The providers available to a reconciler.
#[derive(Clone)]
pub struct Backends {
    pub static_pool: Arc<dyn BackendProvider>,
    pub elastic: Option<Arc<dyn BackendProvider>>,
}

impl Backends {
    pub fn new(static_pool: Arc<dyn BackendProvider>, elastic: Option<Arc<dyn BackendProvider>>) -> Self {
        Self {
            static_pool,
            elastic,
        }
    }

    /// Provider for a backend type.
    pub fn get(&self, backend: BackendType) -> Result<&dyn BackendProvider, BackendError> {
        match backend {
            BackendType::Static => Ok(self.static_pool.as_ref()),
            BackendType::Elastic => self
                .elastic
                .as_deref()
                .ok_or(BackendError::NotConfigured(BackendType::Elastic)),
            BackendType::None => Err(BackendError::NotConfigured(BackendType::None)),
        }
    }
}
