//! Node agent against a live control plane: drift detection, CA rotation
//! and rule-change polling.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::TestControlPlane;
use serde_json::json;

use vpn_control_plane::Result;
use vpn_control_plane::access::{AccessRule, RuleSpec, RuleType};
use vpn_control_plane::model::Assignee;
use vpn_control_plane::sync::{HeartbeatReconciler, HttpControlPlaneClient, ManagedService, ServiceStatus};

#[derive(Default)]
struct RecordingService {
    reloads: AtomicUsize,
    refreshes: AtomicUsize,
}

/// Local newtype: `ManagedService` and `Arc` are both foreign here (orphan rule).
#[derive(Clone)]
struct Svc(Arc<RecordingService>);

#[async_trait::async_trait]
impl ManagedService for Svc {
    async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: true,
            active_clients: 1,
        }
    }

    async fn reload(&self, _dir: &Path) -> Result<()> {
        self.0.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh_rules(&self) -> Result<()> {
        self.0.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn agent(
    cp: &TestControlPlane,
    dir: &Path,
    svc: &Arc<RecordingService>,
) -> HeartbeatReconciler<HttpControlPlaneClient, Svc> {
    let client = HttpControlPlaneClient::new(&cp.base_url, Duration::from_secs(5)).unwrap();
    HeartbeatReconciler::new(client, Svc(svc.clone()), "gw-1-token", dir, Duration::from_secs(30)).await
}

#[tokio::test]
async fn fresh_node_provisions_once_and_writes_bundle() {
    // GIVEN: a node agent with an empty state directory
    let cp = TestControlPlane::start().await;
    let dir = tempfile::tempdir().unwrap();
    let svc = Arc::new(RecordingService::default());
    let mut agent = agent(&cp, dir.path(), &svc).await;

    // WHEN: it ticks twice
    let first = agent.tick().await.unwrap();
    let second = agent.tick().await.unwrap();

    // THEN: it provisioned once and the bundle is on disk
    assert!(first.reprovisioned);
    assert!(!second.reprovisioned);
    assert_eq!(svc.reloads.load(Ordering::SeqCst), 1);
    let ca = std::fs::read_to_string(dir.path().join("ca.crt")).unwrap();
    assert!(ca.contains("BEGIN CERTIFICATE"));
    let key = std::fs::read_to_string(dir.path().join("server.key")).unwrap();
    assert!(key.contains("PRIVATE KEY"));
    let network: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("network.json")).unwrap()).unwrap();
    assert_eq!(network["netmask"], "255.255.255.0");

    // AND: the control plane recorded the applied version
    use vpn_control_plane::store::NodeStore;
    let node = NodeStore::find_by_id(cp.store.as_ref(), "gw-1").await.unwrap().unwrap();
    assert_eq!(node.reported_config_version, agent.state().config_version);
    assert_eq!(node.active_clients, 1);
}

#[tokio::test]
async fn settings_change_triggers_reprovision() {
    let cp = TestControlPlane::start().await;
    let dir = tempfile::tempdir().unwrap();
    let svc = Arc::new(RecordingService::default());
    let mut agent = agent(&cp, dir.path(), &svc).await;
    agent.tick().await.unwrap();
    let before = agent.state().config_version.clone();

    let (status, body) = {
        let resp = cp
            .http
            .put(cp.url("/api/v1/nodes/gw-1/settings"))
            .bearer_auth(common::ADMIN_TOKEN)
            .json(&json!({ "port": 443, "protocol": "tcp" }))
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json::<serde_json::Value>().await.unwrap())
    };
    assert_eq!(status, 200, "{body}");

    let outcome = agent.tick().await.unwrap();

    assert!(outcome.reprovisioned);
    assert_ne!(agent.state().config_version, before);
    assert_eq!(agent.state().config_version, body["config_version"].as_str().unwrap());
    let network: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("network.json")).unwrap()).unwrap();
    assert_eq!(network["port"], 443);
    assert_eq!(network["protocol"], "tcp");
}

#[tokio::test]
async fn malformed_settings_are_rejected_by_the_api() {
    let cp = TestControlPlane::start().await;
    let resp = cp
        .http
        .put(cp.url("/api/v1/nodes/gw-1/settings"))
        .bearer_auth(common::ADMIN_TOKEN)
        .json(&json!({ "subnet": "not-a-subnet" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn ca_activation_reaches_the_node() {
    let cp = TestControlPlane::start().await;
    let dir = tempfile::tempdir().unwrap();
    let svc = Arc::new(RecordingService::default());
    let mut agent = agent(&cp, dir.path(), &svc).await;
    agent.tick().await.unwrap();
    let fp_a = agent.state().ca_fingerprint.clone().unwrap();

    let (_, pending) = cp.admin_post("/api/v1/ca/rotation", &json!({})).await;
    assert!(!agent.tick().await.unwrap().reprovisioned);

    let id = pending["id"].as_str().unwrap();
    cp.admin_post(&format!("/api/v1/ca/{id}/activate"), &json!({})).await;
    let outcome = agent.tick().await.unwrap();

    assert!(outcome.reprovisioned);
    assert_ne!(agent.state().ca_fingerprint.as_deref(), Some(fp_a.as_str()));
    assert_eq!(agent.state().ca_fingerprint.as_deref(), pending["fingerprint"].as_str());
    assert_eq!(svc.reloads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn new_grant_refreshes_rules_without_reprovision() {
    let cp = TestControlPlane::start().await;
    let dir = tempfile::tempdir().unwrap();
    let svc = Arc::new(RecordingService::default());
    let mut agent = agent(&cp, dir.path(), &svc).await;
    agent.tick().await.unwrap();
    assert_eq!(svc.refreshes.load(Ordering::SeqCst), 1);

    cp.store.grant(
        Assignee::Group("engineering".into()),
        AccessRule::try_from(RuleSpec {
            id: "r-db".into(),
            rule_type: RuleType::Cidr,
            value: "10.20.0.0/24".into(),
            port_range: Some("5432".into()),
            protocol: Some("tcp".into()),
            network: None,
            active: true,
            description: None,
        })
        .unwrap(),
    );
    let outcome = agent.tick().await.unwrap();

    assert!(!outcome.reprovisioned);
    assert!(outcome.rules_refreshed);
    assert_eq!(svc.refreshes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unknown_node_token_fails_without_touching_state() {
    let cp = TestControlPlane::start().await;
    let dir = tempfile::tempdir().unwrap();
    let svc = Arc::new(RecordingService::default());
    let client = HttpControlPlaneClient::new(&cp.base_url, Duration::from_secs(5)).unwrap();
    let mut agent =
        HeartbeatReconciler::new(client, Svc(svc.clone()), "stolen-token", dir.path(), Duration::from_secs(30)).await;

    let err = agent.tick().await.unwrap_err();

    assert!(matches!(err, vpn_control_plane::Error::AuthenticationFailure(_)));
    assert!(!err.is_retryable());
    assert_eq!(agent.state().config_version, "");
    assert!(!dir.path().join("state.json").exists());
}
