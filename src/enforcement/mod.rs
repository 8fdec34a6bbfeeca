//! Per-connection enforcement: Generate → Verify → Connect → Disconnect.
//!
//! # Verify
//!
//! The requesting node is authenticated by its node token first. The
//! credential is then checked in a fixed order and the first failing check
//! decides the denial:
//!
//! 1. credential exists (auth token, else certificate serial)
//! 2. neither config nor certificate is revoked, and the issuing CA is
//!    still trusted
//! 3. not expired
//! 4. bound node is the requesting node
//! 5. presented identity is the credential's owner
//! 6. owner exists and is active
//! 7. owner is still assigned to the node (read fresh, never cached)
//!
//! Store failures are returned as errors and never turn into an allow.

pub mod session;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::AccessResolver;
use crate::audit::{self, AuditEvent};
use crate::issuer::{CertificateIssuer, render_client_profile};
use crate::model::{CertificateRecord, GeneratedConfig, Node, Revocation, User};
use crate::pending::PendingStore;
use crate::pki::CertificateAuthority;
use crate::store::Stores;
use crate::{Error, Result};

pub use session::{ConnectionState, Session, SessionRegistry, Usage};
pub use types::{
    ConnectRequest, ConnectResponse, ConnectStatus, DenialReason, DisconnectRequest,
    DisconnectResponse, GenerateRequest, GenerateResponse, Outcome, VerifyRequest, VerifyResponse,
};

/// Prefix of one-shot profile download tokens.
pub const DOWNLOAD_TOKEN_PREFIX: &str = "vpncp_dl_";

/// A credential that passed every Verify check.
#[derive(Debug, Clone)]
pub struct VerifiedCredential {
    /// The config.
    pub config: GeneratedConfig,
    /// Its certificate.
    pub certificate: CertificateRecord,
    /// The owning user, freshly loaded.
    pub user: User,
    /// The requesting node.
    pub node: Node,
}

/// Tunables of the enforcement protocol.
#[derive(Debug, Clone)]
pub struct EnforcementSettings {
    /// Node liveness window.
    pub activity_threshold: Duration,
    /// DNS servers pushed when a node lists none.
    pub default_dns_servers: Vec<String>,
}

/// The enforcement protocol.
pub struct EnforcementProtocol {
    stores: Stores,
    ca: Arc<CertificateAuthority>,
    issuer: CertificateIssuer,
    resolver: AccessResolver,
    sessions: SessionRegistry,
    downloads: Arc<PendingStore<String>>,
    settings: EnforcementSettings,
}

impl std::fmt::Debug for EnforcementProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnforcementProtocol")
            .field("sessions", &self.sessions.len())
            .field("pending_downloads", &self.downloads.len())
            .finish_non_exhaustive()
    }
}

impl EnforcementProtocol {
    /// Wire the protocol.
    #[must_use]
    pub fn new(
        stores: Stores,
        ca: Arc<CertificateAuthority>,
        issuer: CertificateIssuer,
        downloads: Arc<PendingStore<String>>,
        settings: EnforcementSettings,
    ) -> Self {
        Self {
            resolver: AccessResolver::new(stores.clone()),
            stores,
            ca,
            issuer,
            sessions: SessionRegistry::new(),
            downloads,
            settings,
        }
    }

    /// Session records.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    // ── Generate ─────────────────────────────────────────────────────────────

    /// Mint a client credential for an authenticated user on a node.
    ///
    /// Denied when the user is unknown or inactive, the node is unknown or
    /// inactive, or the user is not assigned to the node. A denial creates
    /// no state.
    ///
    /// # Errors
    ///
    /// Store, CA and issuance errors.
    pub async fn generate(&self, req: &GenerateRequest) -> Result<Outcome<GenerateResponse>> {
        let now = Utc::now();
        let outcome = self.check_generate(req, now).await?;
        let (user, node) = match outcome {
            Outcome::Granted(pair) => pair,
            Outcome::Denied(reason) => {
                info!(
                    user_email = %req.user_email,
                    node_id = %req.node_id,
                    reason = %reason,
                    "Generate denied"
                );
                audit::emit(&AuditEvent::credential_denied(Some(&req.node_id), reason.as_str()));
                return Ok(Outcome::Denied(reason));
            }
        };

        let issued = self
            .issuer
            .issue_client_certificate(&user, &node, req.valid_for_secs.map(Duration::from_secs))
            .await?;
        let profile = render_client_profile(&node, &self.ca.trust_bundle_pem(), &issued, &user.email);
        let download_token = self.downloads.insert(profile);
        self.sessions
            .open(issued.config.id, &user.id, &user.email, &node.id);

        Ok(Outcome::Granted(GenerateResponse {
            config_id: issued.config.id,
            user_id: user.id,
            node_id: node.id,
            certificate_serial: issued.config.certificate_serial,
            expires_at: issued.config.expires_at,
            download_token,
        }))
    }

    async fn check_generate(
        &self,
        req: &GenerateRequest,
        now: DateTime<Utc>,
    ) -> Result<Outcome<(User, Node)>> {
        let user = self
            .stores
            .call("users.find_by_email", self.stores.users.find_by_email(&req.user_email))
            .await?;
        let Some(user) = user else {
            return Ok(Outcome::Denied(DenialReason::UserNotFound));
        };
        if !user.active {
            return Ok(Outcome::Denied(DenialReason::UserInactive));
        }

        let node = self
            .stores
            .call("nodes.find_by_id", self.stores.nodes.find_by_id(&req.node_id))
            .await?;
        let Some(node) = node else {
            return Ok(Outcome::Denied(DenialReason::NodeNotFound));
        };
        if !node.is_active(now, self.settings.activity_threshold) {
            return Ok(Outcome::Denied(DenialReason::NodeInactive));
        }
        if !node.is_assigned(&user) {
            return Ok(Outcome::Denied(DenialReason::NotAuthorized));
        }
        Ok(Outcome::Granted((user, node)))
    }

    /// Redeem a one-shot profile download token.
    #[must_use]
    pub fn take_download(&self, token: &str) -> Option<String> {
        self.downloads.take(token)
    }

    // ── Verify ───────────────────────────────────────────────────────────────

    /// Run the ordered Verify checks.
    ///
    /// # Errors
    ///
    /// Store failures only; every authorization failure is a denial.
    pub async fn verify_credential(&self, req: &VerifyRequest) -> Result<Outcome<VerifiedCredential>> {
        let now = Utc::now();

        let node = self
            .stores
            .call("nodes.find_by_token", self.stores.nodes.find_by_token(&req.token))
            .await?;
        let Some(node) = node else {
            warn!(common_name = %req.common_name, "Verify from unknown node token");
            audit::emit(&AuditEvent::credential_denied(
                None,
                DenialReason::NodeAuthenticationFailed.as_str(),
            ));
            return Ok(Outcome::Denied(DenialReason::NodeAuthenticationFailed));
        };

        let (config, certificate) = match self.lookup_credential(req).await? {
            Some(found) => found,
            None => return Ok(self.deny(&node, None, DenialReason::CredentialNotFound)),
        };

        match self.check_credential(req, &node, &config, &certificate, now).await? {
            Outcome::Denied(reason) => Ok(self.deny(&node, Some(&config), reason)),
            Outcome::Granted(user) => {
                self.sessions.advance(config.id, ConnectionState::Verified);
                debug!(config_id = %config.id, node_id = %node.id, "Credential verified");
                audit::emit(&AuditEvent::credential_verified(&user.id, &node.id, config.id));
                Ok(Outcome::Granted(VerifiedCredential {
                    config,
                    certificate,
                    user,
                    node,
                }))
            }
        }
    }

    /// Verify phase: the node's yes/no answer.
    ///
    /// # Errors
    ///
    /// Store failures (never converted to an allow).
    pub async fn verify(&self, req: &VerifyRequest) -> Result<VerifyResponse> {
        Ok(match self.verify_credential(req).await? {
            Outcome::Granted(v) => VerifyResponse {
                allowed: true,
                reason: None,
                user_id: Some(v.user.id),
                user_email: Some(v.user.email),
            },
            Outcome::Denied(reason) => VerifyResponse::denied(reason),
        })
    }

    async fn lookup_credential(
        &self,
        req: &VerifyRequest,
    ) -> Result<Option<(GeneratedConfig, CertificateRecord)>> {
        let config = match (req.password.as_deref(), req.serial_number.as_deref()) {
            (Some(token), _) if !token.is_empty() => {
                self.stores
                    .call("credentials.config_by_token", self.stores.credentials.config_by_token(token))
                    .await?
            }
            (_, Some(serial)) if !serial.is_empty() => {
                let serial = normalize_serial(serial);
                self.stores
                    .call(
                        "credentials.config_by_serial",
                        self.stores.credentials.config_by_serial(&serial),
                    )
                    .await?
            }
            _ => None,
        };
        let Some(config) = config else {
            return Ok(None);
        };

        let certificate = self
            .stores
            .call(
                "credentials.certificate_by_serial",
                self.stores
                    .credentials
                    .certificate_by_serial(&config.certificate_serial),
            )
            .await?;
        Ok(certificate.map(|c| (config, c)))
    }

    /// Checks 2 through 7.
    async fn check_credential(
        &self,
        req: &VerifyRequest,
        node: &Node,
        config: &GeneratedConfig,
        certificate: &CertificateRecord,
        now: DateTime<Utc>,
    ) -> Result<Outcome<User>> {
        // 2. revocation, including the issuing CA
        if config.revocation.is_some() || certificate.revocation.is_some() {
            return Ok(Outcome::Denied(DenialReason::AccessRevoked));
        }
        if !self
            .ca
            .status(certificate.ca_id)
            .is_some_and(crate::pki::CaStatus::is_trusted)
        {
            return Ok(Outcome::Denied(DenialReason::IssuingAuthorityRevoked));
        }

        // 3. expiry
        if config.is_expired(now) || now >= certificate.not_after {
            return Ok(Outcome::Denied(DenialReason::CredentialExpired));
        }

        // 4. node binding
        if config.node_id != node.id {
            return Ok(Outcome::Denied(DenialReason::BindingMismatch));
        }

        // 5. presented identity
        let serial_matches = req
            .serial_number
            .as_deref()
            .filter(|s| !s.is_empty())
            .is_none_or(|s| normalize_serial(s) == certificate.serial);
        let username_matches = req
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .is_none_or(|u| u.eq_ignore_ascii_case(&certificate.subject));
        if !req.common_name.eq_ignore_ascii_case(&certificate.subject)
            || !serial_matches
            || !username_matches
        {
            return Ok(Outcome::Denied(DenialReason::IdentityMismatch));
        }

        // 6. owner exists and is active
        let user = self
            .stores
            .call("users.find_by_id", self.stores.users.find_by_id(&config.user_id))
            .await?;
        let Some(user) = user.filter(|u| u.active) else {
            return Ok(Outcome::Denied(DenialReason::UserInactive));
        };

        // 7. fresh authorization
        if !node.is_assigned(&user) {
            return Ok(Outcome::Denied(DenialReason::NotAuthorized));
        }

        Ok(Outcome::Granted(user))
    }

    fn deny<T>(&self, node: &Node, config: Option<&GeneratedConfig>, reason: DenialReason) -> Outcome<T> {
        if let Some(config) = config {
            if self.sessions.state(config.id) != Some(ConnectionState::Revoked) {
                self.sessions.advance(config.id, ConnectionState::Denied);
            }
        }
        info!(
            node_id = %node.id,
            config_id = ?config.map(|c| c.id),
            reason = %reason,
            "Credential denied"
        );
        audit::emit(&AuditEvent::credential_denied(Some(&node.id), reason.as_str()));
        Outcome::Denied(reason)
    }

    // ── Connect ──────────────────────────────────────────────────────────────

    /// Connect phase: re-verify, then hand out the client's firewall rules
    /// and directives. The answer always states `default_policy = deny`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn connect(&self, req: &ConnectRequest) -> Result<ConnectResponse> {
        let verified = match self.verify_credential(req).await? {
            Outcome::Granted(v) => v,
            Outcome::Denied(reason) => return Ok(ConnectResponse::denied(reason)),
        };

        let access = self.resolver.resolve(&verified.user, &verified.node).await?;
        let client_config = access.client_directives(
            &verified.node.settings,
            &self.settings.default_dns_servers,
        );
        self.sessions
            .connect(verified.config.id, req.client_ip.as_deref());

        info!(
            config_id = %verified.config.id,
            user_id = %verified.user.id,
            node_id = %verified.node.id,
            rules = access.rules.len(),
            "Client connected"
        );

        Ok(ConnectResponse {
            allow: true,
            status: ConnectStatus::Connected,
            reason: None,
            default_policy: access.default_policy,
            firewall_rules: access.firewall_rules(),
            client_config,
        })
    }

    // ── Disconnect ───────────────────────────────────────────────────────────

    /// Disconnect phase: record usage and close the session.
    ///
    /// # Errors
    ///
    /// [`Error::AuthenticationFailure`] for an unknown node token; store
    /// failures.
    pub async fn disconnect(&self, req: &DisconnectRequest) -> Result<DisconnectResponse> {
        let node = self
            .stores
            .call("nodes.find_by_token", self.stores.nodes.find_by_token(&req.token))
            .await?
            .ok_or_else(|| Error::from(DenialReason::NodeAuthenticationFailed))?;

        let by_serial = match req.serial_number.as_deref().filter(|s| !s.is_empty()) {
            Some(serial) => self
                .stores
                .call(
                    "credentials.config_by_serial",
                    self.stores
                        .credentials
                        .config_by_serial(&normalize_serial(serial)),
                )
                .await?
                .filter(|c| c.node_id == node.id)
                .map(|c| c.id),
            None => None,
        };
        let subject = req.username.as_deref().unwrap_or(&req.common_name);
        let config_id = by_serial.or_else(|| self.sessions.find_connected(&node.id, subject));

        let acknowledged = config_id.is_some_and(|id| {
            self.sessions.disconnect(
                id,
                Usage {
                    bytes_received: req.bytes_received,
                    bytes_sent: req.bytes_sent,
                    duration_secs: req.duration_secs,
                },
            )
        });

        info!(
            node_id = %node.id,
            common_name = %req.common_name,
            bytes_received = req.bytes_received,
            bytes_sent = req.bytes_sent,
            duration_secs = req.duration_secs,
            acknowledged,
            "Client disconnected"
        );
        Ok(DisconnectResponse { acknowledged })
    }

    // ── Revocation ───────────────────────────────────────────────────────────

    /// Revoke a config and its certificate. Effective at the next Verify.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown config; store failures.
    pub async fn revoke_credential(&self, config_id: Uuid, reason: &str) -> Result<GeneratedConfig> {
        let revocation = Revocation {
            reason: reason.to_string(),
            revoked_at: Utc::now(),
        };
        let config = self
            .stores
            .call(
                "credentials.revoke_config",
                self.stores.credentials.revoke_config(config_id, revocation.clone()),
            )
            .await?;
        match self
            .stores
            .call(
                "credentials.revoke_certificate",
                self.stores
                    .credentials
                    .revoke_certificate(&config.certificate_serial, revocation),
            )
            .await
        {
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.sessions.advance(config_id, ConnectionState::Revoked);
        warn!(config_id = %config_id, user_id = %config.user_id, reason, "Revoked credential");
        audit::emit(&AuditEvent::credential_revoked(
            &config.user_id,
            config_id,
            &config.certificate_serial,
            reason,
        ));
        Ok(config)
    }

    /// Revoke every unrevoked credential of a user (offboarding). Returns
    /// how many were revoked.
    ///
    /// # Errors
    ///
    /// Store failures; credentials revoked before the failure stay revoked.
    pub async fn revoke_user_credentials(&self, user_id: &str, reason: &str) -> Result<usize> {
        let configs = self
            .stores
            .call(
                "credentials.configs_for_user",
                self.stores.credentials.configs_for_user(user_id),
            )
            .await?;
        let mut revoked = 0;
        for config in configs.into_iter().filter(|c| c.revocation.is_none()) {
            self.revoke_credential(config.id, reason).await?;
            revoked += 1;
        }
        info!(user_id, revoked, "Revoked user credentials");
        Ok(revoked)
    }
}

/// Serials are compared as lowercase hex without separators.
fn normalize_serial(serial: &str) -> String {
    serial
        .chars()
        .filter(char::is_ascii_hexdigit)
        .collect::<String>()
        .to_ascii_lowercase()
}
