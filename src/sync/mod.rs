//! Node ↔ control plane synchronisation.
//!
//! Nodes never receive pushed updates. Each node agent polls on a timer:
//! the heartbeat reports what the node has applied and the control plane
//! answers with the authoritative config version and CA fingerprint. Drift
//! in either triggers a pull of the provisioning bundle.
//!
//! - [`server`]: control-plane half (heartbeat recording, provisioning,
//!   rule-set versions)
//! - [`agent`]: node half ([`agent::HeartbeatReconciler`])
//! - [`client`]: HTTP [`agent::ControlPlaneClient`]
//! - [`service`]: command-driven [`agent::ManagedService`]

pub mod agent;
pub mod client;
pub mod server;
pub mod service;

use serde::{Deserialize, Serialize};

pub use agent::{
    ControlPlaneClient, HeartbeatReconciler, LocalState, ManagedService, ServiceStatus, TickOutcome,
};
pub use client::HttpControlPlaneClient;
pub use server::NodeSync;
pub use service::CommandService;

/// Body of node calls that carry nothing but the node token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTokenRequest {
    /// Node token.
    pub token: String,
}

/// Heartbeat sent by a node agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Node token.
    pub token: String,
    /// Public address, when the node knows it.
    #[serde(default)]
    pub public_ip: Option<String>,
    /// Connected clients.
    #[serde(default)]
    pub active_clients: u32,
    /// Whether the tunnel service is running.
    #[serde(default)]
    pub openvpn_running: bool,
    /// Config version applied locally; empty when never provisioned.
    #[serde(default)]
    pub config_version: String,
    /// CA fingerprint currently trusted locally.
    #[serde(default)]
    pub ca_fingerprint: Option<String>,
}

/// Heartbeat answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Always `"ok"` for an authenticated node.
    pub status: String,
    /// Authoritative config version.
    pub config_version: String,
    /// Whether the node must pull a new bundle.
    pub needs_reprovision: bool,
    /// Fingerprint of the active CA.
    pub ca_fingerprint: Option<String>,
}

/// Everything a node needs to (re)configure its tunnel service.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProvisionBundle {
    /// Trust bundle (active CA first).
    pub ca_cert: String,
    /// Fresh server certificate.
    pub server_cert: String,
    /// Its private key.
    pub server_key: String,
    /// Client address pool in CIDR form.
    pub vpn_subnet: String,
    /// Network address of the pool.
    pub vpn_network: String,
    /// Netmask of the pool.
    pub vpn_netmask: String,
    /// Listen port.
    pub vpn_port: u16,
    /// `udp` or `tcp`.
    pub vpn_protocol: String,
    /// Cipher profile.
    pub crypto_profile: String,
    /// Whether the tunnel uses a pre-shared TLS key.
    pub tls_auth_enabled: bool,
    /// The pre-shared key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_auth_key: Option<String>,
}

impl std::fmt::Debug for ProvisionBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionBundle")
            .field("vpn_subnet", &self.vpn_subnet)
            .field("vpn_port", &self.vpn_port)
            .field("vpn_protocol", &self.vpn_protocol)
            .field("crypto_profile", &self.crypto_profile)
            .field("tls_auth_enabled", &self.tls_auth_enabled)
            .finish_non_exhaustive()
    }
}

/// Rule-set version answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesVersionResponse {
    /// Content hash of the node's effective rules.
    pub rules_version: String,
}
