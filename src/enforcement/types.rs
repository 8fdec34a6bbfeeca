//! Request / response types of the enforcement protocol and its denial
//! reasons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::{DefaultPolicy, FirewallRule};
use crate::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Denials
// ─────────────────────────────────────────────────────────────────────────────

/// Why a phase was denied. Remote callers only ever see [`Self::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    /// The requesting node's token is unknown.
    NodeAuthenticationFailed,
    /// No credential matches the presented token or serial.
    CredentialNotFound,
    /// The config or its certificate was revoked.
    AccessRevoked,
    /// The certificate's CA left the trust set.
    IssuingAuthorityRevoked,
    /// The credential is past its expiry.
    CredentialExpired,
    /// The credential was issued for a different node.
    BindingMismatch,
    /// The presented identity is not the credential's owner.
    IdentityMismatch,
    /// The user does not exist.
    UserNotFound,
    /// The user exists but is deactivated.
    UserInactive,
    /// The node does not exist.
    NodeNotFound,
    /// The node has not sent a heartbeat recently.
    NodeInactive,
    /// The user is not assigned to the node (any more).
    NotAuthorized,
}

impl DenialReason {
    /// Coarse reason string returned to remote callers.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NodeAuthenticationFailed => "node authentication failed",
            Self::CredentialNotFound => "credential not found",
            Self::AccessRevoked => "access revoked",
            Self::IssuingAuthorityRevoked => "issuing authority revoked",
            Self::CredentialExpired => "credential expired",
            Self::BindingMismatch => "binding mismatch",
            Self::IdentityMismatch => "identity mismatch",
            Self::UserNotFound => "user not found",
            Self::UserInactive => "user inactive",
            Self::NodeNotFound => "node not found",
            Self::NodeInactive => "node inactive",
            Self::NotAuthorized => "not authorized for node",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DenialReason> for Error {
    fn from(reason: DenialReason) -> Self {
        let msg = reason.as_str().to_string();
        match reason {
            DenialReason::NodeAuthenticationFailed
            | DenialReason::CredentialNotFound
            | DenialReason::IdentityMismatch => Self::AuthenticationFailure(msg),
            DenialReason::AccessRevoked | DenialReason::IssuingAuthorityRevoked => {
                Self::CredentialRevoked(msg)
            }
            DenialReason::CredentialExpired => Self::CredentialExpired(msg),
            DenialReason::BindingMismatch => Self::BindingMismatch(msg),
            DenialReason::UserNotFound | DenialReason::NodeNotFound => Self::NotFound(msg),
            DenialReason::UserInactive | DenialReason::NodeInactive | DenialReason::NotAuthorized => {
                Self::AuthorizationDenied(msg)
            }
        }
    }
}

/// Result of a phase that can be denied without being an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The phase succeeded.
    Granted(T),
    /// The phase was denied.
    Denied(DenialReason),
}

impl<T> Outcome<T> {
    /// Convert a denial into the matching [`Error`].
    ///
    /// # Errors
    ///
    /// Returns the error for the denial reason.
    pub fn into_result(self) -> crate::Result<T> {
        match self {
            Self::Granted(v) => Ok(v),
            Self::Denied(reason) => Err(reason.into()),
        }
    }

    /// The denial reason, if denied.
    #[must_use]
    pub fn denial(&self) -> Option<DenialReason> {
        match self {
            Self::Granted(_) => None,
            Self::Denied(reason) => Some(*reason),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generate
// ─────────────────────────────────────────────────────────────────────────────

/// Request to mint a client config (from the trusted front end, after the
/// user's identity has been verified).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Verified email of the requesting user.
    pub user_email: String,
    /// Target node.
    pub node_id: String,
    /// Requested validity in seconds; defaulted and clamped.
    #[serde(default)]
    pub valid_for_secs: Option<u64>,
}

/// Metadata of a minted config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// Config id (used for revocation).
    pub config_id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Bound node.
    pub node_id: String,
    /// Client certificate serial.
    pub certificate_serial: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// One-shot token for `GET /api/v1/vpn/download/{token}`.
    pub download_token: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Verify / Connect
// ─────────────────────────────────────────────────────────────────────────────

/// A node asking whether an inbound client may proceed. Also the Connect
/// request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Node token of the requesting node.
    pub token: String,
    /// Certificate CN the client presented.
    pub common_name: String,
    /// Username the client presented.
    #[serde(default)]
    pub username: Option<String>,
    /// Password the client presented (the config auth token).
    #[serde(default)]
    pub password: Option<String>,
    /// Certificate serial the client presented (hex, any case).
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Client source address as seen by the node.
    #[serde(default)]
    pub client_ip: Option<String>,
}

/// Connect reuses the Verify request shape.
pub type ConnectRequest = VerifyRequest;

/// Verify answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// Whether the client may proceed.
    pub allowed: bool,
    /// Coarse denial reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Owning user (when allowed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Owning user's email (when allowed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl VerifyResponse {
    /// Denied answer.
    #[must_use]
    pub fn denied(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.as_str().to_string()),
            user_id: None,
            user_email: None,
        }
    }
}

/// Session status reported in the Connect answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectStatus {
    /// Client connected; apply the rules.
    Connected,
    /// Client refused.
    Denied,
}

/// Connect answer. `default_policy` is always `deny`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Whether the client may connect.
    pub allow: bool,
    /// Session status.
    pub status: ConnectStatus,
    /// Coarse denial reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Policy for traffic no rule grants.
    pub default_policy: DefaultPolicy,
    /// Allow-list to apply for this client.
    pub firewall_rules: Vec<FirewallRule>,
    /// Per-client directives (routes, redirect-gateway, DNS).
    pub client_config: Vec<String>,
}

impl ConnectResponse {
    /// Denied answer: nothing allowed, default deny stated.
    #[must_use]
    pub fn denied(reason: DenialReason) -> Self {
        Self {
            allow: false,
            status: ConnectStatus::Denied,
            reason: Some(reason.as_str().to_string()),
            default_policy: DefaultPolicy::Deny,
            firewall_rules: Vec::new(),
            client_config: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Disconnect
// ─────────────────────────────────────────────────────────────────────────────

/// A node reporting the end of a client session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectRequest {
    /// Node token of the reporting node.
    pub token: String,
    /// Certificate CN of the client.
    pub common_name: String,
    /// Username of the client.
    #[serde(default)]
    pub username: Option<String>,
    /// Certificate serial of the client.
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Bytes received from the client.
    #[serde(default)]
    pub bytes_received: u64,
    /// Bytes sent to the client.
    #[serde(default)]
    pub bytes_sent: u64,
    /// Session duration.
    #[serde(default)]
    pub duration_secs: u64,
}

/// Disconnect answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectResponse {
    /// Whether a matching session was found and closed.
    pub acknowledged: bool,
}
