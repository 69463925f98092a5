//! On-demand cloud instances.
//!
//! One instance record is created per request, named after the request id, so
//! acquiring twice for the same request finds the existing instance instead
//! of creating a second one. The cloud side reports the public address and
//! instance state into the record's status.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{
    Acquisition, BackendError, BackendPolicy, BackendProvider, LivenessProbe, ResourceReport,
    ResourceStatus,
};
use crate::model::{
    BackendType, ElasticInstance, InstanceParameters, InstanceSpec, ObjectMeta, ProviderConfigRef,
    ProvisioningRequest,
};
use crate::store::{Api, StoreError};

/// Label marking instances owned by this service.
pub const INSTANCE_TYPE_LABEL: (&str, &str) = ("type", "training-vm");

/// Instance states that never recover.
const DEAD_STATES: &[&str] = &["terminated", "failed", "shutting-down", "stopped"];

/// Instance record name for a request.
pub fn instance_name(request_id: &str) -> String {
    format!("training-{request_id}")
}

/// Parameters every training instance is created with.
#[derive(Debug, Clone, PartialEq)]
pub struct ElasticTemplate {
    pub image: String,
    pub instance_type: String,
    pub region: String,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub key_name: Option<String>,
    pub associate_public_ip: bool,
    pub provider_config: String,
    pub tags: BTreeMap<String, String>,
}

impl Default for ElasticTemplate {
    fn default() -> Self {
        Self {
            image: "ami-0c02fb55956c7d316".to_string(),
            instance_type: "t3.micro".to_string(),
            region: "us-east-1".to_string(),
            subnet_id: None,
            security_group_ids: Vec::new(),
            key_name: None,
            associate_public_ip: true,
            provider_config: "default".to_string(),
            tags: BTreeMap::from([("Purpose".to_string(), "training".to_string())]),
        }
    }
}

impl ElasticTemplate {
    /// Instance record for a request.
    pub fn instance_for(&self, request_id: &str) -> ElasticInstance {
        let name = instance_name(request_id);

        let mut tags = self.tags.clone();
        tags.insert("Name".to_string(), name.clone());
        tags.insert("Session".to_string(), request_id.to_string());

        let mut metadata = ObjectMeta::named(name);
        metadata
            .labels
            .insert("session".to_string(), request_id.to_string());
        metadata.labels.insert(
            INSTANCE_TYPE_LABEL.0.to_string(),
            INSTANCE_TYPE_LABEL.1.to_string(),
        );

        ElasticInstance {
            metadata,
            spec: InstanceSpec {
                for_provider: InstanceParameters {
                    ami: self.image.clone(),
                    instance_type: self.instance_type.clone(),
                    region: self.region.clone(),
                    subnet_id: self.subnet_id.clone(),
                    vpc_security_group_ids: self.security_group_ids.clone(),
                    key_name: self.key_name.clone(),
                    associate_public_ip_address: self.associate_public_ip,
                    tags,
                },
                provider_config_ref: Some(ProviderConfigRef {
                    name: self.provider_config.clone(),
                }),
            },
            status: None,
        }
    }
}

/// Garbage collection thresholds for instance records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceTtl {
    /// Age after which a dead instance is deleted.
    pub failed: Duration,
    /// Age after which an instance that never started is deleted.
    pub pending: Duration,
}

impl Default for InstanceTtl {
    fn default() -> Self {
        Self {
            failed: Duration::from_secs(5 * 60),
            pending: Duration::from_secs(10 * 60),
        }
    }
}

/// Provider creating one cloud instance per request.
pub struct ElasticProvider {
    instances: Api<ElasticInstance>,
    template: ElasticTemplate,
    probe: Arc<dyn LivenessProbe>,
}

impl ElasticProvider {
    pub fn new(
        instances: Api<ElasticInstance>,
        template: ElasticTemplate,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            instances,
            template,
            probe,
        }
    }

    fn is_dead(instance: &ElasticInstance) -> bool {
        DEAD_STATES.contains(&instance.instance_state())
    }

    /// Delete instance records that failed or never started.
    ///
    /// Ages are measured from record creation. Returns the number deleted.
    pub async fn collect_garbage(
        &self,
        now: DateTime<Utc>,
        ttl: InstanceTtl,
    ) -> Result<usize, BackendError> {
        let mut deleted = 0;

        for instance in self.instances.list().await? {
            let owned = instance
                .metadata
                .labels
                .get(INSTANCE_TYPE_LABEL.0)
                .is_some_and(|v| v == INSTANCE_TYPE_LABEL.1);
            if !owned {
                continue;
            }
            let Some(created) = instance.metadata.creation_timestamp else {
                continue;
            };
            let age = (now - created).to_std().unwrap_or_default();
            let state = instance.instance_state();

            let expired = if Self::is_dead(&instance) {
                age > ttl.failed
            } else if state.is_empty() || state == "pending" {
                age > ttl.pending
            } else {
                false
            };
            if !expired {
                continue;
            }

            let name = &instance.metadata.name;
            match self.instances.delete(name).await {
                Ok(()) => {
                    info!(instance = %name, state = %state, age_secs = age.as_secs(), "Deleted stale elastic instance");
                    deleted += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(instance = %name, error = %e, "Failed to delete stale elastic instance"),
            }
        }

        Ok(deleted)
    }
}

#[async_trait]
impl BackendProvider for ElasticProvider {
    fn backend_type(&self) -> BackendType {
        BackendType::Elastic
    }

    async fn acquire(
        &self,
        request: &ProvisioningRequest,
        _used: &BTreeSet<String>,
    ) -> Result<Option<Acquisition>, BackendError> {
        let name = instance_name(request.id());

        if let Some(existing) = self.instances.get(&name).await? {
            if Self::is_dead(&existing) {
                info!(
                    request = %request.id(),
                    instance = %name,
                    state = %existing.instance_state(),
                    "Existing instance is dead, deleting so it can be recreated"
                );
                self.release(&name).await?;
                return Ok(None);
            }
            debug!(request = %request.id(), instance = %name, "Reusing existing instance");
            return Ok(Some(Acquisition {
                handle: name,
                address: existing.public_ip().map(str::to_string),
            }));
        }

        let instance = self.template.instance_for(request.id());
        match self.instances.create(&instance).await {
            Ok(_) => info!(request = %request.id(), instance = %name, "Created elastic instance"),
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(request = %request.id(), instance = %name, "Instance created concurrently");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Some(Acquisition {
            handle: name,
            address: None,
        }))
    }

    async fn probe_liveness(&self, handle: &str) -> Result<ResourceReport, BackendError> {
        let Some(instance) = self.instances.get(handle).await? else {
            return Ok(ResourceReport::new(ResourceStatus::Absent, None));
        };

        let address = instance.public_ip().map(str::to_string);
        if Self::is_dead(&instance) {
            return Ok(ResourceReport::new(ResourceStatus::PermanentlyFailed, address));
        }

        let status = match (&address, instance.instance_state()) {
            (Some(ip), "running") => {
                if self.probe.probe(ip, &BackendPolicy::ELASTIC.probe).await {
                    ResourceStatus::Live
                } else {
                    ResourceStatus::Pending
                }
            }
            _ => ResourceStatus::Pending,
        };

        Ok(ResourceReport::new(status, address))
    }

    async fn release(&self, handle: &str) -> Result<(), BackendError> {
        match self.instances.delete(handle).await {
            Ok(()) => {
                info!(instance = %handle, "Deleted elastic instance");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
