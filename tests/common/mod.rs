//! Shared fixture: a live control plane on an ephemeral port, seeded from an
//! inventory.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;

use vpn_control_plane::config::Config;
use vpn_control_plane::server::ControlPlane;
use vpn_control_plane::store::inventory::Inventory;
use vpn_control_plane::store::{InMemoryStore, Stores};

pub const ADMIN_TOKEN: &str = "test-admin-token";

pub const INVENTORY: &str = r#"
users:
  - id: u-alice
    email: alice@example.com
    groups: [engineering]
  - id: u-bob
    email: bob@example.com
    groups: [sales]
nodes:
  - id: gw-1
    name: gw-1.example.com
    token: gw-1-token
    endpoint: gw-1.example.com
    networks: [prod]
    assignments:
      - { kind: group, id: engineering }
  - id: gw-2
    name: gw-2.example.com
    token: gw-2-token
    endpoint: gw-2.example.com
    assignments:
      - { kind: group, id: engineering }
      - { kind: group, id: sales }
grants:
  - assignee: { kind: group, id: engineering }
    rules:
      - { id: r-prod, type: cidr, value: 10.0.0.0/16, network: prod }
      - { id: r-git, type: hostname, value: git.internal, port_range: "443", protocol: tcp }
  - assignee: { kind: user, id: u-alice }
    rules:
      - { id: r-jump, type: ip, value: 192.168.1.10 }
"#;

pub struct TestControlPlane {
    pub base_url: String,
    pub store: Arc<InMemoryStore>,
    pub http: reqwest::Client,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for TestControlPlane {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl TestControlPlane {
    pub async fn start() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Inventory::parse(INVENTORY).unwrap().seed(&store);

        let mut config = Config::default();
        config.server.admin_token = Some(ADMIN_TOKEN.to_string());
        let stores = Stores::in_memory(&store, Duration::from_secs(5));
        let cp = ControlPlane::with_stores(config, stores).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = cp.router();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            store,
            http: reqwest::Client::new(),
            server,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// POST without credentials; returns status and JSON body.
    pub async fn post(&self, path: &str, body: &Value) -> (u16, Value) {
        let resp = self.http.post(self.url(path)).json(body).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    /// POST with the admin bearer token.
    pub async fn admin_post(&self, path: &str, body: &Value) -> (u16, Value) {
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(ADMIN_TOKEN)
            .json(body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    /// GET with the admin bearer token.
    pub async fn admin_get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    /// Heartbeat for `node_token` reporting `version`.
    pub async fn heartbeat(&self, node_token: &str, version: &str) -> Value {
        let (status, body) = self
            .post(
                "/api/v1/node/heartbeat",
                &json!({
                    "token": node_token,
                    "public_ip": "198.51.100.4",
                    "active_clients": 0,
                    "openvpn_running": true,
                    "config_version": version,
                }),
            )
            .await;
        assert_eq!(status, 200, "heartbeat failed: {body}");
        body
    }

    /// Generate a credential for `email` on `node_id` (node must be active).
    pub async fn generate(&self, email: &str, node_id: &str) -> Value {
        let (status, body) = self
            .admin_post(
                "/api/v1/vpn/generate",
                &json!({ "user_email": email, "node_id": node_id, "valid_for_secs": 3600 }),
            )
            .await;
        assert_eq!(status, 200, "generate failed: {body}");
        body
    }

    /// Auth token of a generated config, looked up in the store.
    pub async fn auth_token(&self, config_id: &str) -> String {
        use vpn_control_plane::store::CredentialStore;
        let id = config_id.parse().unwrap();
        self.store.config_by_id(id).await.unwrap().unwrap().auth_token
    }

    /// Verify body as a node would send it.
    pub fn verify_body(node_token: &str, email: &str, password: &str) -> Value {
        json!({
            "token": node_token,
            "common_name": email,
            "username": email,
            "password": password,
            "client_ip": "203.0.113.7",
        })
    }
}
