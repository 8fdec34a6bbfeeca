//! Domain records shared by the stores, the enforcement protocol and the
//! node synchronisation protocol.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────────────────────────

/// A user as known to the identity provider, reduced to what access control
/// needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stable user identifier.
    pub id: String,
    /// Verified email address; becomes the certificate subject.
    pub email: String,
    /// Group identifiers the user belongs to.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Inactive users are denied at every phase.
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────────────────────

/// Role a node plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Stand-alone VPN gateway.
    #[default]
    Gateway,
    /// Mesh hub.
    Hub,
    /// Mesh spoke.
    Spoke,
}

/// Transport protocol of the tunnel listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    /// UDP transport.
    #[default]
    Udp,
    /// TCP transport.
    Tcp,
}

impl TunnelProtocol {
    /// Wire name (`"udp"` / `"tcp"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security-relevant tunnel settings of a node.
///
/// Every field here participates in the config version; see
/// [`crate::config_version::version`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Cipher / TLS profile name (e.g. `"modern"`, `"fips"`).
    pub crypto_profile: String,
    /// Listener port.
    pub port: u16,
    /// Listener protocol.
    pub protocol: TunnelProtocol,
    /// Client address pool in CIDR notation.
    pub subnet: String,
    /// Whether a pre-shared TLS key wraps the control channel.
    pub tls_auth_enabled: bool,
    /// Pre-shared TLS key material.
    pub tls_auth_key: Option<String>,
    /// Route all client traffic through the node.
    pub full_tunnel: bool,
    /// Push DNS servers to clients.
    pub push_dns: bool,
    /// DNS servers to push; empty means the documented default pair.
    pub dns_servers: Vec<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            crypto_profile: "modern".to_string(),
            port: 1194,
            protocol: TunnelProtocol::Udp,
            subnet: "10.8.0.0/24".to_string(),
            tls_auth_enabled: false,
            tls_auth_key: None,
            full_tunnel: false,
            push_dns: false,
            dns_servers: Vec::new(),
        }
    }
}

/// Who a node is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Assignee {
    /// A single user.
    User(String),
    /// Every member of a group.
    Group(String),
}

/// A gateway, hub or spoke registered with the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable node identifier.
    pub id: String,
    /// Display name, also the server certificate CN.
    pub name: String,
    /// Fleet role.
    #[serde(default)]
    pub role: NodeRole,
    /// Opaque node token presented on every node-to-control-plane call.
    pub token: String,
    /// Public endpoint clients dial (hostname or address).
    pub endpoint: String,
    /// Tunnel settings.
    #[serde(default)]
    pub settings: NodeSettings,
    /// Networks reachable through this node.
    #[serde(default)]
    pub networks: Vec<String>,
    /// Users and groups allowed to use this node.
    #[serde(default)]
    pub assignments: Vec<Assignee>,
    /// Config version the node last reported as applied.
    #[serde(default)]
    pub reported_config_version: String,
    /// CA fingerprint the node last reported.
    #[serde(default)]
    pub last_ca_fingerprint: Option<String>,
    /// Time of the last heartbeat.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Public address reported in the last heartbeat.
    #[serde(default)]
    pub public_ip: Option<String>,
    /// Connected clients reported in the last heartbeat.
    #[serde(default)]
    pub active_clients: u32,
    /// Whether the tunnel service was running at the last heartbeat.
    #[serde(default)]
    pub service_running: bool,
}

impl Node {
    /// Derived liveness: a node is active while its last heartbeat is younger
    /// than `threshold`. Never stored.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let Some(last) = self.last_heartbeat else {
            return false;
        };
        let Ok(threshold) = chrono::Duration::from_std(threshold) else {
            return true;
        };
        now.signed_duration_since(last) < threshold
    }

    /// Whether `user` is assigned to this node directly or through a group.
    #[must_use]
    pub fn is_assigned(&self, user: &User) -> bool {
        self.assignments.iter().any(|a| match a {
            Assignee::User(id) => *id == user.id,
            Assignee::Group(id) => user.groups.iter().any(|g| g == id),
        })
    }
}

/// What a node reported in one heartbeat, as recorded by the node store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    /// Public address the node sees itself behind.
    pub public_ip: Option<String>,
    /// Connected clients.
    pub active_clients: u32,
    /// Whether the tunnel service is running.
    pub service_running: bool,
    /// Config version the node has applied (empty when never provisioned).
    pub config_version: String,
    /// CA fingerprint the node currently trusts.
    pub ca_fingerprint: Option<String>,
    /// Arrival time at the control plane.
    pub received_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Issued credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Administrative revocation marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    /// Operator-supplied reason.
    pub reason: String,
    /// When the revocation took effect.
    pub revoked_at: DateTime<Utc>,
}

/// Certificate issued to a user (client) or node (server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Lowercase hex serial, unique across all CAs.
    pub serial: String,
    /// Certificate subject CN (user email or node name).
    pub subject: String,
    /// SHA-256 fingerprint of the certificate DER.
    pub fingerprint: String,
    /// CA that signed it.
    pub ca_id: Uuid,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// Node the certificate is bound to (client certificates only).
    pub node_id: Option<String>,
    /// Set when an administrator revokes the certificate.
    pub revocation: Option<Revocation>,
}

/// A client configuration minted at the Generate phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedConfig {
    /// Config identifier.
    pub id: Uuid,
    /// Owning user id.
    pub user_id: String,
    /// Node the config is bound to.
    pub node_id: String,
    /// Opaque password-style auth token.
    pub auth_token: String,
    /// Serial of the client certificate minted alongside.
    pub certificate_serial: String,
    /// Issuance time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Set when an administrator revokes the config.
    pub revocation: Option<Revocation>,
}

impl GeneratedConfig {
    /// Whether `now` is at or past the expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
