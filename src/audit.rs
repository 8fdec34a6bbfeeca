//! Audit logging for certificate and credential lifecycle events.
//!
//! Every event is emitted via `tracing::info!` at target `audit` with the
//! whole event serialized into one structured `audit` field, so the trail can
//! be split out of the regular log stream by any aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `ca.bootstrapped` | The first CA is created at startup |
//! | `ca.prepared` | A rotation creates a pending CA |
//! | `ca.activated` | A pending CA becomes active, the old one retires |
//! | `ca.revoked` | A pending or retired CA leaves the trust set |
//! | `credential.issued` | Generate minted a certificate and config |
//! | `credential.verified` | A node's Verify or Connect call was granted |
//! | `credential.denied` | A Generate, Verify or Connect call was denied |
//! | `credential.revoked` | An administrator revoked a config and certificate |
//! | `node.reprovisioned` | A node pulled a fresh provisioning bundle |

use serde::Serialize;
use uuid::Uuid;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"ca.activated"`).
    pub event: &'static str,
    /// Certificate authority concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_id: Option<Uuid>,
    /// CA fingerprint (for CA events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Previously active CA (for `ca.activated`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_ca_id: Option<Uuid>,
    /// User concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Node concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Generated config concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<Uuid>,
    /// Certificate serial concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Reason for denials and revocations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn bare(event: &'static str) -> Self {
        Self {
            event,
            ca_id: None,
            fingerprint: None,
            retired_ca_id: None,
            user_id: None,
            node_id: None,
            config_id: None,
            serial: None,
            reason: None,
        }
    }

    /// Construct a `ca.bootstrapped` event.
    #[must_use]
    pub fn ca_bootstrapped(ca_id: Uuid, fingerprint: &str) -> Self {
        Self {
            ca_id: Some(ca_id),
            fingerprint: Some(fingerprint.to_string()),
            ..Self::bare("ca.bootstrapped")
        }
    }

    /// Construct a `ca.prepared` event.
    #[must_use]
    pub fn ca_prepared(ca_id: Uuid, fingerprint: &str) -> Self {
        Self {
            ca_id: Some(ca_id),
            fingerprint: Some(fingerprint.to_string()),
            ..Self::bare("ca.prepared")
        }
    }

    /// Construct a `ca.activated` event.
    #[must_use]
    pub fn ca_activated(ca_id: Uuid, fingerprint: &str, retired: Option<Uuid>) -> Self {
        Self {
            ca_id: Some(ca_id),
            fingerprint: Some(fingerprint.to_string()),
            retired_ca_id: retired,
            ..Self::bare("ca.activated")
        }
    }

    /// Construct a `ca.revoked` event.
    #[must_use]
    pub fn ca_revoked(ca_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            ca_id: Some(ca_id),
            reason: Some(reason.into()),
            ..Self::bare("ca.revoked")
        }
    }

    /// Construct a `credential.issued` event.
    #[must_use]
    pub fn credential_issued(user_id: &str, node_id: &str, config_id: Uuid, serial: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            node_id: Some(node_id.to_string()),
            config_id: Some(config_id),
            serial: Some(serial.to_string()),
            ..Self::bare("credential.issued")
        }
    }

    /// Construct a `credential.verified` event.
    #[must_use]
    pub fn credential_verified(user_id: &str, node_id: &str, config_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            node_id: Some(node_id.to_string()),
            config_id: Some(config_id),
            ..Self::bare("credential.verified")
        }
    }

    /// Construct a `credential.denied` event.
    #[must_use]
    pub fn credential_denied(node_id: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            node_id: node_id.map(str::to_string),
            reason: Some(reason.into()),
            ..Self::bare("credential.denied")
        }
    }

    /// Construct a `credential.revoked` event.
    #[must_use]
    pub fn credential_revoked(
        user_id: &str,
        config_id: Uuid,
        serial: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            config_id: Some(config_id),
            serial: Some(serial.to_string()),
            reason: Some(reason.into()),
            ..Self::bare("credential.revoked")
        }
    }

    /// Construct a `node.reprovisioned` event.
    #[must_use]
    pub fn node_reprovisioned(node_id: &str, serial: &str, ca_fingerprint: &str) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            serial: Some(serial.to_string()),
            fingerprint: Some(ca_fingerprint.to_string()),
            ..Self::bare("node.reprovisioned")
        }
    }
}

/// Emit an audit event via `tracing::info!` at target `audit`.
///
/// ```text
/// INFO audit: control plane audit audit={"event":"ca.activated","ca_id":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(target: "audit", audit = %json, "control plane audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
