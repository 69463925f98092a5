//! In-process store for tests and local dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::{merge_patch, PatchTarget, ResourceKind, StateStore, StoreError};

/// In-memory [`StateStore`].
///
/// Enforces the main/status write split and stamps `creationTimestamp` on
/// create unless the record already carries one. Created records keep the
/// status they were created with so tests can seed arbitrary states.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful create, patch and delete calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }

    fn collection_key(kind: &ResourceKind) -> String {
        kind.path()
    }

    fn not_found(kind: &ResourceKind, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

fn record_name(object: &Value) -> Option<&str> {
    object.get("metadata")?.get("name")?.as_str()
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<Value>, StoreError> {
        self.check_available()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(&Self::collection_key(kind))
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, kind: &ResourceKind, name: &str) -> Result<Option<Value>, StoreError> {
        self.check_available()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(&Self::collection_key(kind))
            .and_then(|c| c.get(name))
            .cloned())
    }

    async fn create(&self, kind: &ResourceKind, mut object: Value) -> Result<Value, StoreError> {
        self.check_available()?;
        let name = record_name(&object)
            .ok_or_else(|| StoreError::Api {
                status: 422,
                body: "metadata.name is required".to_string(),
            })?
            .to_string();

        let mut collections = self.collections.write().await;
        let collection = collections.entry(Self::collection_key(kind)).or_default();
        if collection.contains_key(&name) {
            return Err(StoreError::AlreadyExists {
                kind: kind.to_string(),
                name,
            });
        }

        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            if let Some(ns) = &kind.namespace {
                metadata.insert("namespace".to_string(), Value::String(ns.clone()));
            }
            if !metadata.contains_key("creationTimestamp") {
                metadata.insert(
                    "creationTimestamp".to_string(),
                    serde_json::to_value(Utc::now())?,
                );
            }
        }

        collection.insert(name.clone(), object.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(kind = %kind, name = %name, "Created record");
        Ok(object)
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        name: &str,
        patch: Value,
        target: PatchTarget,
    ) -> Result<Value, StoreError> {
        self.check_available()?;
        let mut collections = self.collections.write().await;
        let object = collections
            .get_mut(&Self::collection_key(kind))
            .and_then(|c| c.get_mut(name))
            .ok_or_else(|| Self::not_found(kind, name))?;

        match target {
            PatchTarget::Main => {
                let mut patch = patch;
                if let Some(map) = patch.as_object_mut() {
                    map.remove("status");
                }
                merge_patch(object, &patch);
            }
            PatchTarget::Status => {
                if let Some(status_patch) = patch.get("status") {
                    let mut status = object.get("status").cloned().unwrap_or(Value::Null);
                    merge_patch(&mut status, status_patch);
                    if let Some(map) = object.as_object_mut() {
                        map.insert("status".to_string(), status);
                    }
                }
            }
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(object.clone())
    }

    async fn delete(&self, kind: &ResourceKind, name: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut collections = self.collections.write().await;
        collections
            .get_mut(&Self::collection_key(kind))
            .and_then(|c| c.remove(name))
            .ok_or_else(|| Self::not_found(kind, name))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
