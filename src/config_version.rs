//! Config version: a deterministic fingerprint of a node's security-relevant
//! tunnel settings.
//!
//! The control plane recomputes it from stored settings on every heartbeat
//! and compares it with the version the node reports. Any difference, or an
//! empty reported version, means the node must pull a fresh bundle.
//!
//! Field order is fixed and part of the format:
//!
//! ```text
//! crypto_profile|port|protocol|subnet|tls_auth_enabled|tls_auth_key|full_tunnel|push_dns|dns1,dns2
//! ```

use sha2::{Digest, Sha256};

use crate::model::NodeSettings;

/// Fingerprint `settings`: SHA-256 over the `|`-joined fields, lowercase hex.
#[must_use]
pub fn version(settings: &NodeSettings) -> String {
    let canonical = [
        settings.crypto_profile.clone(),
        settings.port.to_string(),
        settings.protocol.as_str().to_string(),
        settings.subnet.clone(),
        settings.tls_auth_enabled.to_string(),
        settings.tls_auth_key.clone().unwrap_or_default(),
        settings.full_tunnel.to_string(),
        settings.push_dns.to_string(),
        settings.dns_servers.join(","),
    ]
    .join("|");

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Whether a node reporting `reported` must reprovision to reach
/// `authoritative`.
#[must_use]
pub fn needs_reprovision(reported: &str, authoritative: &str) -> bool {
    reported.is_empty() || reported != authoritative
}
