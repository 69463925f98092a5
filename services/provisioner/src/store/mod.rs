//! Declarative state store access.
//!
//! The store holds every record the loops act on. Records are JSON documents
//! addressed by [`ResourceKind`] and name. Writes are JSON merge patches
//! (RFC 7386) sent either to the main record or to its status, and the two
//! paths never touch each other's fields.
//!
//! - [`StateStore`] is the untyped seam implemented by [`MemoryStore`] and
//!   [`HttpStore`].
//! - [`Api`] layers serde typing over it for one record kind.

mod http;
mod memory;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub use http::HttpStore;
pub use memory::MemoryStore;

use crate::model::{ElasticInstance, PlatformMachine, ProvisioningRequest};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Record with this name already exists.
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Write rejected due to a conflicting concurrent change.
    #[error("conflict writing {kind} {name}")]
    Conflict { kind: String, name: String },

    /// Store temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store answered with an unexpected status.
    #[error("store returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Which part of a record a patch writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchTarget {
    /// Metadata and spec. Status fields in the patch are ignored.
    Main,
    /// Status only.
    Status,
}

/// Address of a record collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub plural: String,
    /// None for cluster-scoped kinds.
    pub namespace: Option<String>,
}

impl ResourceKind {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        plural: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            plural: plural.into(),
            namespace,
        }
    }

    pub fn provisioning_requests(namespace: impl Into<String>) -> Self {
        Self::new(
            "training.example.com",
            "v1",
            "provisioningrequests",
            Some(namespace.into()),
        )
    }

    pub fn elastic_instances() -> Self {
        Self::new("ec2.aws.upbound.io", "v1beta1", "instances", None)
    }

    pub fn platform_machines(namespace: impl Into<String>) -> Self {
        Self::new("hobbyfarm.io", "v1", "virtualmachines", Some(namespace.into()))
    }

    /// Collection path relative to the store root.
    pub fn path(&self) -> String {
        match &self.namespace {
            Some(ns) => format!(
                "apis/{}/{}/namespaces/{}/{}",
                self.group, self.version, ns, self.plural
            ),
            None => format!("apis/{}/{}/{}", self.group, self.version, self.plural),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.plural, self.group)
    }
}

/// Untyped declarative store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// List all records of a kind.
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<Value>, StoreError>;

    /// Get one record; `None` if it does not exist.
    async fn get(&self, kind: &ResourceKind, name: &str) -> Result<Option<Value>, StoreError>;

    /// Create a record. Fails with `AlreadyExists` on a name clash.
    async fn create(&self, kind: &ResourceKind, object: Value) -> Result<Value, StoreError>;

    /// Apply a merge patch and return the updated record.
    async fn patch(
        &self,
        kind: &ResourceKind,
        name: &str,
        patch: Value,
        target: PatchTarget,
    ) -> Result<Value, StoreError>;

    /// Delete a record. Fails with `NotFound` if it does not exist.
    async fn delete(&self, kind: &ResourceKind, name: &str) -> Result<(), StoreError>;
}

/// Apply an RFC 7386 merge patch to `target` in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Default::default());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

/// Typed access to one record kind.
pub struct Api<T> {
    store: Arc<dyn StateStore>,
    kind: ResourceKind,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Api<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            kind: self.kind.clone(),
            _marker: PhantomData,
        }
    }
}

impl Api<ProvisioningRequest> {
    pub fn requests(store: Arc<dyn StateStore>, namespace: &str) -> Self {
        Self::new(store, ResourceKind::provisioning_requests(namespace))
    }
}

impl Api<ElasticInstance> {
    pub fn instances(store: Arc<dyn StateStore>) -> Self {
        Self::new(store, ResourceKind::elastic_instances())
    }
}

impl Api<PlatformMachine> {
    pub fn machines(store: Arc<dyn StateStore>, namespace: &str) -> Self {
        Self::new(store, ResourceKind::platform_machines(namespace))
    }
}

impl<T> Api<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn StateStore>, kind: ResourceKind) -> Self {
        Self {
            store,
            kind,
            _marker: PhantomData,
        }
    }

    /// List all records. Records that fail to decode are logged and skipped.
    pub async fn list(&self) -> Result<Vec<T>, StoreError> {
        let items = self.store.list(&self.kind).await?;
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value(item) {
                Ok(record) => records.push(record),
                Err(e) => warn!(kind = %self.kind, error = %e, "Skipping malformed record"),
            }
        }
        Ok(records)
    }

    pub async fn get(&self, name: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(&self.kind, name).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn create(&self, record: &T) -> Result<T, StoreError> {
        let value = serde_json::to_value(record)?;
        let created = self.store.create(&self.kind, value).await?;
        Ok(serde_json::from_value(created)?)
    }

    /// Merge-patch metadata and spec.
    pub async fn patch(&self, name: &str, patch: Value) -> Result<T, StoreError> {
        let updated = self
            .store
            .patch(&self.kind, name, patch, PatchTarget::Main)
            .await?;
        Ok(serde_json::from_value(updated)?)
    }

    /// Merge-patch status. `patch` is the full patch document (`{"status": ...}`).
    pub async fn patch_status(&self, name: &str, patch: Value) -> Result<T, StoreError> {
        let updated = self
            .store
            .patch(&self.kind, name, patch, PatchTarget::Status)
            .await?;
        Ok(serde_json::from_value(updated)?)
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store.delete(&self.kind, name).await
    }
}
