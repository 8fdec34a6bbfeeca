//! Credential issuance bound to a (user, node) pair.
//!
//! A client credential is a leaf certificate whose subject is the user's
//! verified email plus a [`GeneratedConfig`] carrying an opaque auth token.
//! Both are bound to one node and written in a single store call.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::config::{EnforcementConfig, PkiConfig};
use crate::model::{GeneratedConfig, Node, TunnelProtocol, User};
use crate::pki::{CertRole, CertificateAuthority, IssuedCertificate};
use crate::store::Stores;
use crate::Result;

/// Prefix of client auth tokens; makes them greppable by secret scanners.
pub const AUTH_TOKEN_PREFIX: &str = "vpncp_";

/// Generate a cryptographically random opaque token.
///
/// Format: `<prefix><43-char URL-safe base64>` (256 bits of entropy).
#[must_use]
pub fn generate_token(prefix: &str) -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    format!(
        "{prefix}{}",
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes,
        )
    )
}

/// A minted client credential.
#[derive(Debug, Clone)]
pub struct IssuedClient {
    /// Persisted config.
    pub config: GeneratedConfig,
    /// Certificate and private key (the key is never persisted).
    pub certificate: IssuedCertificate,
}

/// Issues client and node certificates through the active CA.
#[derive(Debug, Clone)]
pub struct CertificateIssuer {
    ca: Arc<CertificateAuthority>,
    stores: Stores,
    default_validity: Duration,
    max_validity: Duration,
    server_validity: Duration,
}

impl CertificateIssuer {
    /// Create an issuer.
    #[must_use]
    pub fn new(
        ca: Arc<CertificateAuthority>,
        stores: Stores,
        enforcement: &EnforcementConfig,
        pki: &PkiConfig,
    ) -> Self {
        Self {
            ca,
            stores,
            default_validity: enforcement.default_validity,
            max_validity: enforcement.max_validity,
            server_validity: pki.server_cert_validity,
        }
    }

    /// Requested validity, defaulted and clamped to the configured maximum.
    #[must_use]
    pub fn effective_validity(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|d| !d.is_zero())
            .unwrap_or(self.default_validity)
            .min(self.max_validity)
    }

    /// Mint a client certificate and config for `user` bound to `node`.
    ///
    /// The config expires with the certificate: `now + valid_for`, clamped to
    /// the configured maximum and to the CA's own validity.
    ///
    /// # Errors
    ///
    /// [`crate::Error::NoActiveCa`] when no CA is active; store errors,
    /// including [`crate::Error::Conflict`] on a duplicate serial or token.
    pub async fn issue_client_certificate(
        &self,
        user: &User,
        node: &Node,
        valid_for: Option<Duration>,
    ) -> Result<IssuedClient> {
        let validity = self.effective_validity(valid_for);
        let certificate = self
            .ca
            .issue_certificate(&user.email, validity, CertRole::Client)?;

        let config = GeneratedConfig {
            id: Uuid::new_v4(),
            user_id: user.id.clone(),
            node_id: node.id.clone(),
            auth_token: generate_token(AUTH_TOKEN_PREFIX),
            certificate_serial: certificate.serial.clone(),
            issued_at: certificate.not_before,
            expires_at: certificate.not_after,
            revocation: None,
        };

        self.stores
            .call(
                "credentials.insert_issued",
                self.stores
                    .credentials
                    .insert_issued(certificate.record(Some(&node.id)), config.clone()),
            )
            .await?;

        tracing::info!(
            user_id = %user.id,
            node_id = %node.id,
            config_id = %config.id,
            serial = %certificate.serial,
            expires_at = %config.expires_at,
            "Issued client credential"
        );
        audit::emit(&AuditEvent::credential_issued(
            &user.id,
            &node.id,
            config.id,
            &certificate.serial,
        ));

        Ok(IssuedClient {
            config,
            certificate,
        })
    }

    /// Mint a server certificate for `node` (provisioning).
    ///
    /// # Errors
    ///
    /// [`crate::Error::NoActiveCa`] when no CA is active; store errors.
    pub async fn issue_node_certificate(&self, node: &Node) -> Result<IssuedCertificate> {
        let certificate =
            self.ca
                .issue_certificate(&node.name, self.server_validity, CertRole::Server)?;
        self.stores
            .call(
                "credentials.insert_certificate",
                self.stores
                    .credentials
                    .insert_certificate(certificate.record(Some(&node.id))),
            )
            .await?;
        tracing::info!(node_id = %node.id, serial = %certificate.serial, "Issued node certificate");
        Ok(certificate)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client profile
// ─────────────────────────────────────────────────────────────────────────────

/// Data-channel ciphers for a crypto profile.
#[must_use]
pub fn data_ciphers(crypto_profile: &str) -> &'static str {
    match crypto_profile {
        "fips" => "AES-256-GCM",
        "modern" => "AES-256-GCM:CHACHA20-POLY1305",
        _ => "AES-256-GCM:AES-128-GCM:CHACHA20-POLY1305",
    }
}

/// Render the client profile for `client` on `node`.
///
/// Key material, the trust bundle and the auth credentials are inlined so the
/// profile is a single self-contained file.
#[must_use]
pub fn render_client_profile(
    node: &Node,
    trust_bundle_pem: &str,
    client: &IssuedClient,
    username: &str,
) -> String {
    let settings = &node.settings;
    let proto = match settings.protocol {
        TunnelProtocol::Udp => "udp",
        TunnelProtocol::Tcp => "tcp-client",
    };
    let tls_min = if settings.crypto_profile == "modern" { "1.3" } else { "1.2" };

    let mut out = String::new();
    let _ = writeln!(out, "# {} via {} (config {})", username, node.name, client.config.id);
    let _ = writeln!(out, "# expires {}", client.config.expires_at.to_rfc3339());
    out.push_str("client\ndev tun\n");
    let _ = writeln!(out, "proto {proto}");
    let _ = writeln!(out, "remote {} {}", node.endpoint, settings.port);
    out.push_str("resolv-retry infinite\nnobind\npersist-key\npersist-tun\n");
    out.push_str("remote-cert-tls server\n");
    let _ = writeln!(out, "verify-x509-name {} name", node.name);
    let _ = writeln!(out, "data-ciphers {}", data_ciphers(&settings.crypto_profile));
    let _ = writeln!(out, "tls-version-min {tls_min}");
    out.push_str("auth-nocache\nverb 3\n");

    inline_block(&mut out, "auth-user-pass", &format!("{username}\n{}", client.config.auth_token));
    inline_block(&mut out, "ca", trust_bundle_pem);
    inline_block(&mut out, "cert", &client.certificate.cert_pem);
    inline_block(&mut out, "key", &client.certificate.key_pem);
    if settings.tls_auth_enabled {
        if let Some(key) = settings.tls_auth_key.as_deref() {
            inline_block(&mut out, "tls-crypt", key);
        }
    }
    out
}

fn inline_block(out: &mut String, tag: &str, body: &str) {
    let _ = writeln!(out, "<{tag}>\n{}\n</{tag}>", body.trim_end());
}
