mod harness;

use harness::{Harness, SECRET_NAME};
use serde_json::json;
use trainvm_provisioner::model::RequestSource;
use trainvm_provisioner::store::PatchTarget;
use trainvm_provisioner::store::{ResourceKind, StateStore};

async fn seed_ready(h: &Harness, name: &str, requester: &str, source: &str, backend: &str, handle: &str, address: &str) {
    h.seed_request(json!({
        "metadata": {"name": name, "creationTimestamp": h.t0},
        "spec": {"requester": requester, "source": source},
        "status": {
            "state": "ready",
            "backendType": backend,
            "resourceHandle": handle,
            "address": address,
            "allocatedAt": h.t0,
            "readyAt": h.t0,
            "provisioned": true
        }
    }))
    .await;
}

#[tokio::test]
async fn projects_ready_request_exactly_once() {
    let h = Harness::new(&[]);
    let mut bridge = h.bridge();
    seed_ready(&h, "r1", "alice", "platform", "static", "10.0.0.5", "10.0.0.5").await;
    h.seed_machine("vm-alice", "alice").await;

    let stats = bridge.propagate(h.at(0)).await.unwrap();
    assert_eq!(stats.projected, 1);
    assert!(bridge
        .ledger()
        .contains(&("r1".to_string(), "10.0.0.5".to_string())));

    let machine = h.machine("vm-alice").await;
    assert_eq!(machine.metadata.labels["ready"], "true");
    assert_eq!(machine.metadata.labels["vm-type"], "static");
    assert_eq!(machine.spec.secret_name.as_deref(), Some(SECRET_NAME));
    assert_eq!(machine.spec.ssh_username.as_deref(), Some("kube"));
    let status = machine.status.unwrap();
    assert_eq!(status.status, "ready");
    assert_eq!(status.public_ip, "10.0.0.5");
    assert_eq!(status.private_ip, "10.0.0.5");
    assert_eq!(status.hostname, "10.0.0.5");

    let writes = h.store.write_count();
    let stats = bridge.propagate(h.at(10)).await.unwrap();
    assert_eq!(stats.projected, 0);
    assert_eq!(stats.already_projected, 1);
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn external_revert_is_not_overwritten() {
    let h = Harness::new(&[]);
    let mut bridge = h.bridge();
    seed_ready(&h, "r1", "alice", "platform", "static", "10.0.0.5", "10.0.0.5").await;
    h.seed_machine("vm-alice", "alice").await;
    bridge.propagate(h.at(0)).await.unwrap();

    // The platform resets the machine on its own.
    h.store
        .patch(
            &ResourceKind::platform_machines(harness::PLATFORM_NAMESPACE),
            "vm-alice",
            json!({"status": {"status": "readyforprovisioning", "public_ip": ""}}),
            PatchTarget::Status,
        )
        .await
        .unwrap();

    let stats = bridge.propagate(h.at(10)).await.unwrap();

    assert_eq!(stats.projected, 0);
    assert_eq!(h.machine("vm-alice").await.status.unwrap().public_ip, "");
}

#[tokio::test]
async fn waits_for_a_matching_machine() {
    let h = Harness::new(&[]);
    let mut bridge = h.bridge();
    seed_ready(&h, "r1", "alice", "platform", "static", "10.0.0.5", "10.0.0.5").await;
    h.seed_machine("vm-bob", "bob").await;

    let stats = bridge.propagate(h.at(0)).await.unwrap();
    assert_eq!(stats.unmatched, 1);
    assert!(bridge.ledger().is_empty());

    let stats = bridge.propagate(h.at(10)).await.unwrap();
    assert_eq!(stats.unmatched, 1);

    h.seed_machine("vm-alice", "alice").await;
    let stats = bridge.propagate(h.at(20)).await.unwrap();

    assert_eq!(stats.projected, 1);
    assert_eq!(h.machine("vm-alice").await.status.unwrap().public_ip, "10.0.0.5");
    assert_eq!(h.machine("vm-bob").await.status.unwrap().public_ip, "");
}

#[tokio::test]
async fn broker_requests_are_not_projected() {
    let h = Harness::new(&[]);
    let mut bridge = h.bridge();
    seed_ready(&h, "b1", "alice", "broker", "static", "10.0.0.5", "10.0.0.5").await;
    h.seed_machine("vm-alice", "alice").await;

    let stats = bridge.propagate(h.at(0)).await.unwrap();

    assert_eq!(stats.candidates, 0);
    assert_eq!(h.machine("vm-alice").await.status.unwrap().public_ip, "");
}

#[tokio::test]
async fn two_requests_for_one_user_get_distinct_machines() {
    let h = Harness::new(&[]);
    let mut bridge = h.bridge();
    seed_ready(&h, "r1", "alice", "platform", "static", "10.0.0.5", "10.0.0.5").await;
    seed_ready(&h, "r2", "alice", "platform", "static", "10.0.0.6", "10.0.0.6").await;
    h.seed_machine("vm-a", "alice").await;
    h.seed_machine("vm-b", "alice").await;

    let stats = bridge.propagate(h.at(0)).await.unwrap();

    assert_eq!(stats.projected, 2);
    assert_eq!(h.machine("vm-a").await.status.unwrap().public_ip, "10.0.0.5");
    assert_eq!(h.machine("vm-b").await.status.unwrap().public_ip, "10.0.0.6");
}

#[tokio::test]
async fn ledger_forgets_deleted_requests() {
    let h = Harness::new(&[]);
    let mut bridge = h.bridge();
    seed_ready(&h, "r1", "alice", "platform", "static", "10.0.0.5", "10.0.0.5").await;
    h.seed_machine("vm-alice", "alice").await;
    bridge.propagate(h.at(0)).await.unwrap();
    assert_eq!(bridge.ledger().len(), 1);

    h.delete_request("r1").await;
    let stats = bridge.propagate(h.at(10)).await.unwrap();

    assert_eq!(stats.pruned, 1);
    assert!(bridge.ledger().is_empty());
}

#[tokio::test]
async fn elastic_request_projects_its_address() {
    let h = Harness::new(&[]);
    let mut bridge = h.bridge();
    seed_ready(&h, "r1", "alice", "platform", "elastic", "training-r1", "54.0.0.9").await;
    h.seed_machine("vm-alice", "alice").await;

    bridge.propagate(h.at(0)).await.unwrap();

    let machine = h.machine("vm-alice").await;
    assert_eq!(machine.metadata.labels["vm-type"], "elastic");
    assert_eq!(machine.spec.ssh_username.as_deref(), Some("ubuntu"));
    assert_eq!(machine.status.unwrap().public_ip, "54.0.0.9");
}

#[tokio::test]
async fn reconciled_request_flows_through_to_the_platform() {
    let h = Harness::new(&["10.0.0.5"]);
    let mut reconciler = h.reconciler(RequestSource::Platform);
    let mut bridge = h.bridge();
    h.submit_platform("r1", "alice").await;
    h.seed_machine("vm-alice", "alice").await;

    reconciler.reconcile(h.at(0)).await.unwrap();
    assert_eq!(bridge.propagate(h.at(0)).await.unwrap().candidates, 0);

    reconciler.reconcile(h.at(31)).await.unwrap();
    let stats = bridge.propagate(h.at(31)).await.unwrap();

    assert_eq!(stats.projected, 1);
    assert_eq!(h.machine("vm-alice").await.status.unwrap().status, "ready");
}
