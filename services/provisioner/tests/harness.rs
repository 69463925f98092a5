//! Test harness for provisioner integration tests.
//!
//! Wires every loop against one in-memory store, a scripted probe and a
//! scripted provisioner. Time is passed explicitly to each pass.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use trainvm_provisioner::backend::{
    Backends, ElasticProvider, ElasticTemplate, MockProbe, StaticPoolProvider,
};
use trainvm_provisioner::bridge::PropagationBridge;
use trainvm_provisioner::cleanup::{ExpiryPolicy, GarbageCollector};
use trainvm_provisioner::model::{
    BackendPreference, ElasticInstance, ObjectMeta, PlatformMachine, ProvisioningRequest,
    RequestSource, RequestSpec, RequestState,
};
use trainvm_provisioner::provision::{DefaultConfigResolver, MockProvisioner};
use trainvm_provisioner::reconciler::LifecycleReconciler;
use trainvm_provisioner::store::{Api, MemoryStore, PatchTarget, ResourceKind, StateStore};

pub const NAMESPACE: &str = "training";
pub const PLATFORM_NAMESPACE: &str = "platform";
pub const SECRET_NAME: &str = "training-ssh-key";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub requests: Api<ProvisioningRequest>,
    pub instances: Api<ElasticInstance>,
    pub machines: Api<PlatformMachine>,
    pub probe: Arc<MockProbe>,
    pub provisioner: Arc<MockProvisioner>,
    pub elastic: Arc<ElasticProvider>,
    pub pool: Vec<String>,
    pub t0: DateTime<Utc>,
}

impl Harness {
    /// Harness with the given static pool; every address answers probes.
    pub fn new(pool: &[&str]) -> Self {
        let store = Arc::new(MemoryStore::new());
        let probe = Arc::new(MockProbe::all_live());
        let elastic = Arc::new(ElasticProvider::new(
            Api::instances(store.clone()),
            ElasticTemplate::default(),
            probe.clone(),
        ));

        Self {
            requests: Api::requests(store.clone(), NAMESPACE),
            instances: Api::instances(store.clone()),
            machines: Api::machines(store.clone(), PLATFORM_NAMESPACE),
            store,
            probe,
            provisioner: Arc::new(MockProvisioner::new()),
            elastic,
            pool: pool.iter().map(|s| s.to_string()).collect(),
            t0: Utc::now(),
        }
    }

    pub fn at(&self, secs: i64) -> DateTime<Utc> {
        self.t0 + Duration::seconds(secs)
    }

    pub fn at_minutes(&self, minutes: i64) -> DateTime<Utc> {
        self.t0 + Duration::minutes(minutes)
    }

    fn backends(&self, with_elastic: bool) -> Backends {
        let static_pool = Arc::new(StaticPoolProvider::new(self.pool.clone(), self.probe.clone()));
        let elastic = with_elastic.then(|| {
            self.elastic.clone() as Arc<dyn trainvm_provisioner::backend::BackendProvider>
        });
        Backends::new(static_pool, elastic)
    }

    pub fn reconciler(&self, source: RequestSource) -> LifecycleReconciler {
        LifecycleReconciler::new(
            source,
            self.requests.clone(),
            self.backends(true),
            self.provisioner.clone(),
            Arc::new(DefaultConfigResolver),
            ExpiryPolicy::default(),
        )
    }

    pub fn reconciler_without_elastic(&self, source: RequestSource) -> LifecycleReconciler {
        LifecycleReconciler::new(
            source,
            self.requests.clone(),
            self.backends(false),
            self.provisioner.clone(),
            Arc::new(DefaultConfigResolver),
            ExpiryPolicy::default(),
        )
    }

    pub fn bridge(&self) -> PropagationBridge {
        PropagationBridge::new(self.requests.clone(), self.machines.clone(), SECRET_NAME)
    }

    pub fn collector(&self) -> GarbageCollector {
        GarbageCollector::new(
            self.requests.clone(),
            Some(self.elastic.clone()),
            ExpiryPolicy::default(),
        )
    }

    /// Create a request the way intake does: no status yet.
    pub async fn submit(
        &self,
        name: &str,
        requester: &str,
        source: RequestSource,
        preference: BackendPreference,
    ) -> ProvisioningRequest {
        let mut request = ProvisioningRequest::new(
            name,
            RequestSpec {
                requester: requester.to_string(),
                workload: "intro-to-linux".to_string(),
                source,
                backend_preference: preference,
            },
        );
        request.metadata.creation_timestamp = Some(self.t0);
        self.requests.create(&request).await.unwrap()
    }

    pub async fn submit_platform(&self, name: &str, requester: &str) -> ProvisioningRequest {
        self.submit(name, requester, RequestSource::Platform, BackendPreference::default())
            .await
    }

    /// Create a request record as-is, status included.
    pub async fn seed_request(&self, value: serde_json::Value) {
        self.store
            .create(&ResourceKind::provisioning_requests(NAMESPACE), value)
            .await
            .unwrap();
    }

    pub async fn request(&self, name: &str) -> ProvisioningRequest {
        self.requests.get(name).await.unwrap().unwrap()
    }

    pub async fn state(&self, name: &str) -> RequestState {
        self.request(name).await.state()
    }

    pub async fn delete_request(&self, name: &str) {
        self.requests.delete(name).await.unwrap();
    }

    /// A platform machine waiting for an address.
    pub async fn seed_machine(&self, name: &str, user: &str) {
        let machine = PlatformMachine {
            metadata: ObjectMeta::named(name),
            spec: serde_json::from_value(json!({"user": user})).unwrap(),
            status: Some(
                serde_json::from_value(json!({
                    "status": "readyforprovisioning",
                    "public_ip": "",
                    "private_ip": "",
                    "hostname": ""
                }))
                .unwrap(),
            ),
        };
        self.machines.create(&machine).await.unwrap();
    }

    pub async fn machine(&self, name: &str) -> PlatformMachine {
        self.machines.get(name).await.unwrap().unwrap()
    }

    /// Write what the cloud side reports for an instance.
    pub async fn report_instance(&self, name: &str, public_ip: &str, state: &str) {
        self.store
            .patch(
                &ResourceKind::elastic_instances(),
                name,
                json!({"status": {"atProvider": {"publicIp": public_ip, "instanceState": state}}}),
                PatchTarget::Status,
            )
            .await
            .unwrap();
    }

    /// Handles of static requests currently holding a machine.
    pub async fn live_static_handles(&self) -> Vec<String> {
        self.requests
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.state().is_live())
            .filter(|r| r.backend_type() == trainvm_provisioner::model::BackendType::Static)
            .filter_map(|r| r.handle().map(str::to_string))
            .collect()
    }
}

pub fn no_fallback() -> BackendPreference {
    BackendPreference {
        prefer_static: true,
        elastic_fallback_enabled: false,
    }
}

pub fn elastic_only() -> BackendPreference {
    BackendPreference {
        prefer_static: false,
        elastic_fallback_enabled: true,
    }
}
