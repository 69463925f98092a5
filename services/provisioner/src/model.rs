//! Record types stored in the declarative store.
//!
//! All records share the `metadata` / `spec` / `status` layout. Field names
//! follow the store's camelCase convention, except for platform machine
//! records whose schema is owned by the training platform.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Set by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Provisioning requests
// =============================================================================

/// Lifecycle state of a provisioning request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Waiting for a machine. Intake writes `pending`.
    #[default]
    #[serde(alias = "pending")]
    Requested,
    Allocated,
    Provisioning,
    Ready,
    Failed,
    Released,
}

impl RequestState {
    /// Holds a machine that no other request may take.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Allocated | Self::Provisioning | Self::Ready)
    }

    /// Never changed again once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Waiting for intake allocation.
    pub fn awaits_allocation(self) -> bool {
        matches!(self, Self::Requested | Self::Released)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Allocated => "allocated",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Released => "released",
        };
        f.write_str(s)
    }
}

/// Which backend a request's machine came from. Fixed at allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    None,
    Static,
    Elastic,
}

impl BackendType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Static => "static",
            Self::Elastic => "elastic",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which intake path created a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestSource {
    /// Created from the training platform's own sessions.
    #[default]
    Platform,
    /// Created through the promise broker.
    Broker,
}

impl fmt::Display for RequestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Platform => f.write_str("platform"),
            Self::Broker => f.write_str("broker"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendPreference {
    #[serde(default = "default_true")]
    pub prefer_static: bool,

    #[serde(default = "default_true")]
    pub elastic_fallback_enabled: bool,
}

impl Default for BackendPreference {
    fn default() -> Self {
        Self {
            prefer_static: true,
            elastic_fallback_enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    /// Student identity; matched against platform machine owners.
    pub requester: String,

    /// Scenario identifier, passed through to configuration.
    #[serde(default)]
    pub workload: String,

    #[serde(default)]
    pub source: RequestSource,

    #[serde(default)]
    pub backend_preference: BackendPreference,
}

/// Observed lifecycle of a request.
///
/// Serialized without skipping empty fields: a status write is a merge patch
/// and `null` is what clears a previously set field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    #[serde(default)]
    pub state: RequestState,

    #[serde(default)]
    pub backend_type: BackendType,

    #[serde(default)]
    pub resource_handle: Option<String>,

    /// Connection address of the machine.
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub allocated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ready_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub provisioned: bool,

    #[serde(default)]
    pub message: Option<String>,
}

impl RequestStatus {
    /// Status of a request that just acquired a machine.
    pub fn allocated(
        backend_type: BackendType,
        handle: String,
        address: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state: RequestState::Allocated,
            backend_type,
            resource_handle: Some(handle),
            address,
            allocated_at: Some(now),
            ready_at: None,
            provisioned: false,
            message: None,
        }
    }

    /// Status of a request whose machine was given back.
    pub fn released(reason: impl Into<String>) -> Self {
        Self {
            state: RequestState::Released,
            message: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Same status with a different state and message.
    pub fn with_state(&self, state: RequestState, message: Option<String>) -> Self {
        Self {
            state,
            message,
            ..self.clone()
        }
    }

    /// Connection address, falling back to the handle.
    pub fn connect_address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .filter(|a| !a.is_empty())
            .or(self.resource_handle.as_deref())
    }
}

/// A request for one training machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub metadata: ObjectMeta,
    pub spec: RequestSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
}

impl ProvisioningRequest {
    pub fn new(name: impl Into<String>, spec: RequestSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec,
            status: None,
        }
    }

    /// Request id, stable for the request's lifetime.
    pub fn id(&self) -> &str {
        &self.metadata.name
    }

    /// Current state; a record without status is still waiting.
    pub fn state(&self) -> RequestState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn backend_type(&self) -> BackendType {
        self.status
            .as_ref()
            .map(|s| s.backend_type)
            .unwrap_or_default()
    }

    pub fn handle(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.resource_handle.as_deref())
            .filter(|h| !h.is_empty())
    }
}

// =============================================================================
// Elastic instances
// =============================================================================

/// Desired cloud instance parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceParameters {
    pub ami: String,
    pub instance_type: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpc_security_group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default)]
    pub associate_public_ip_address: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub for_provider: InstanceParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<ProviderConfigRef>,
}

/// Cloud credentials the instance is created with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfigRef {
    pub name: String,
}

/// Observed instance state, written by the cloud side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceObservation {
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub instance_state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub at_provider: InstanceObservation,
}

/// An on-demand cloud instance, one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticInstance {
    pub metadata: ObjectMeta,
    pub spec: InstanceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
}

impl ElasticInstance {
    pub fn public_ip(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.at_provider.public_ip.as_deref())
            .filter(|ip| !ip.is_empty())
    }

    /// Reported instance state, empty while the cloud side has not reported.
    pub fn instance_state(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.at_provider.instance_state.as_deref())
            .unwrap_or("")
    }
}

// =============================================================================
// Platform machines
// =============================================================================

/// Readiness flag the platform sets on machines waiting for an address.
pub const MACHINE_READY_FOR_PROVISIONING: &str = "readyforprovisioning";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub hostname: String,
}

/// The training platform's own record of a student machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformMachine {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MachineSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MachineStatus>,
}

impl PlatformMachine {
    /// Owned by `user`, flagged ready for provisioning, and without an address yet.
    pub fn awaits_address_for(&self, user: &str) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        self.spec.user == user
            && status.status == MACHINE_READY_FOR_PROVISIONING
            && status.public_ip.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("pending", RequestState::Requested)]
    #[case("requested", RequestState::Requested)]
    #[case("allocated", RequestState::Allocated)]
    #[case("ready", RequestState::Ready)]
    #[case("released", RequestState::Released)]
    fn test_state_wire_names(#[case] wire: &str, #[case] expected: RequestState) {
        let state: RequestState = serde_json::from_value(json!(wire)).unwrap();
        assert_eq!(state, expected);
    }

    #[test]
    fn test_request_without_status_is_requested() {
        let req: ProvisioningRequest = serde_json::from_value(json!({
            "metadata": {"name": "session-1"},
            "spec": {"requester": "alice"}
        }))
        .unwrap();

        assert_eq!(req.state(), RequestState::Requested);
        assert_eq!(req.backend_type(), BackendType::None);
        assert_eq!(req.spec.source, RequestSource::Platform);
        assert!(req.spec.backend_preference.prefer_static);
        assert!(req.spec.backend_preference.elastic_fallback_enabled);
        assert!(req.handle().is_none());
    }

    #[test]
    fn test_status_serializes_nulls_for_merge_patch() {
        let value = serde_json::to_value(RequestStatus::released("probe failed")).unwrap();

        assert_eq!(value["state"], "released");
        assert_eq!(value["backendType"], "none");
        assert!(value["resourceHandle"].is_null());
        assert!(value.as_object().unwrap().contains_key("resourceHandle"));
        assert_eq!(value["provisioned"], false);
    }

    #[test]
    fn test_connect_address_falls_back_to_handle() {
        let now = Utc::now();
        let status = RequestStatus::allocated(BackendType::Static, "10.0.0.5".into(), None, now);
        assert_eq!(status.connect_address(), Some("10.0.0.5"));

        let status = RequestStatus::allocated(
            BackendType::Elastic,
            "training-s1".into(),
            Some("54.1.2.3".into()),
            now,
        );
        assert_eq!(status.connect_address(), Some("54.1.2.3"));
    }

    #[test]
    fn test_machine_match() {
        let machine: PlatformMachine = serde_json::from_value(json!({
            "metadata": {"name": "vm-1"},
            "spec": {"user": "alice"},
            "status": {"status": "readyforprovisioning", "public_ip": ""}
        }))
        .unwrap();

        assert!(machine.awaits_address_for("alice"));
        assert!(!machine.awaits_address_for("bob"));
    }

    #[test]
    fn test_instance_observation() {
        let instance: ElasticInstance = serde_json::from_value(json!({
            "metadata": {"name": "training-s1"},
            "spec": {"forProvider": {"ami": "ami-1", "instanceType": "t3.micro", "region": "us-east-1"}},
            "status": {"atProvider": {"publicIp": "54.1.2.3", "instanceState": "running"}}
        }))
        .unwrap();

        assert_eq!(instance.public_ip(), Some("54.1.2.3"));
        assert_eq!(instance.instance_state(), "running");
    }
}
