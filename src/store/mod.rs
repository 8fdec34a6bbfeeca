//! Collaborator stores.
//!
//! The control plane never owns persistence: users, access rules, nodes, CA
//! material and issued credentials live behind the async traits below and
//! are injected at startup. [`memory::InMemoryStore`] implements all of them
//! for tests and for the bundled server, optionally seeded from an
//! [`inventory`] file.
//!
//! Every call made through [`Stores::call`] (or [`with_deadline`]) carries
//! the configured storage timeout; an elapsed deadline surfaces as the
//! retryable [`Error::StoreUnavailable`].

pub mod inventory;
pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::access::AccessRule;
use crate::model::{
    CertificateRecord, GeneratedConfig, HeartbeatReport, Node, NodeSettings, Revocation, User,
};
use crate::pki::{CaRecord, RotationEvent};
use crate::{Error, Result};

pub use memory::InMemoryStore;

/// Identity provider view of users.
#[async_trait::async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Look up a user by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<User>>;

    /// Look up a user by verified email (case-insensitive).
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Every user whose memberships include `group_id`.
    async fn users_in_group(&self, group_id: &str) -> Result<Vec<User>>;
}

/// Access rules granted to users and groups.
#[async_trait::async_trait]
pub trait AccessRuleStore: Send + Sync + 'static {
    /// Rules granted directly to a user.
    async fn rules_for_user(&self, user_id: &str) -> Result<Vec<AccessRule>>;

    /// Rules granted to a group.
    async fn rules_for_group(&self, group_id: &str) -> Result<Vec<AccessRule>>;
}

/// Registered gateways, hubs and spokes.
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync + 'static {
    /// Look up a node by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<Node>>;

    /// Look up a node by its node token.
    async fn find_by_token(&self, token: &str) -> Result<Option<Node>>;

    /// Record a heartbeat and return the updated node.
    async fn record_heartbeat(&self, node_id: &str, report: HeartbeatReport) -> Result<Node>;

    /// Replace a node's tunnel settings (admin edit) and return the updated node.
    async fn update_settings(&self, node_id: &str, settings: NodeSettings) -> Result<Node>;
}

/// Certificate authority persistence.
#[async_trait::async_trait]
pub trait PkiStore: Send + Sync + 'static {
    /// Every persisted CA, in creation order.
    async fn load_authorities(&self) -> Result<Vec<CaRecord>>;

    /// Upsert `records` and append `events` as one transaction: either all
    /// of them become visible or none do.
    async fn commit_rotation(&self, records: Vec<CaRecord>, events: Vec<RotationEvent>)
    -> Result<()>;

    /// The rotation audit log, oldest first.
    async fn rotation_events(&self) -> Result<Vec<RotationEvent>>;
}

/// Issued certificates and generated configs.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Persist a client certificate together with its config. Fails with
    /// [`Error::Conflict`] on a duplicate serial, config id or auth token,
    /// in which case nothing is written.
    async fn insert_issued(&self, cert: CertificateRecord, config: GeneratedConfig) -> Result<()>;

    /// Persist a certificate without a config (node server certificates).
    async fn insert_certificate(&self, cert: CertificateRecord) -> Result<()>;

    /// Look up a certificate by serial.
    async fn certificate_by_serial(&self, serial: &str) -> Result<Option<CertificateRecord>>;

    /// Look up a config by auth token.
    async fn config_by_token(&self, token: &str) -> Result<Option<GeneratedConfig>>;

    /// Look up a config by id.
    async fn config_by_id(&self, id: Uuid) -> Result<Option<GeneratedConfig>>;

    /// Look up the config minted alongside a certificate.
    async fn config_by_serial(&self, serial: &str) -> Result<Option<GeneratedConfig>>;

    /// Mark a config revoked. Revoking twice keeps the first marker.
    async fn revoke_config(&self, id: Uuid, revocation: Revocation) -> Result<GeneratedConfig>;

    /// Mark a certificate revoked. Revoking twice keeps the first marker.
    async fn revoke_certificate(
        &self,
        serial: &str,
        revocation: Revocation,
    ) -> Result<CertificateRecord>;

    /// Every config owned by a user.
    async fn configs_for_user(&self, user_id: &str) -> Result<Vec<GeneratedConfig>>;

    /// Drop configs and certificates whose expiry is before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Run a store call under a deadline.
///
/// # Errors
///
/// Returns whatever the call returns, or [`Error::StoreUnavailable`] naming
/// `what` when `timeout` elapses first.
pub async fn with_deadline<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(store_call = what, timeout_ms = timeout.as_millis(), "Store call timed out");
            Err(Error::StoreUnavailable(format!(
                "{what} timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

/// The injected collaborators plus the per-call deadline.
#[derive(Clone)]
pub struct Stores {
    /// Users.
    pub users: Arc<dyn UserStore>,
    /// Access rules.
    pub rules: Arc<dyn AccessRuleStore>,
    /// Nodes.
    pub nodes: Arc<dyn NodeStore>,
    /// CA material.
    pub pki: Arc<dyn PkiStore>,
    /// Issued credentials.
    pub credentials: Arc<dyn CredentialStore>,
    /// Deadline applied to every call.
    pub timeout: Duration,
}

impl Stores {
    /// Wire every collaborator to one in-memory store.
    #[must_use]
    pub fn in_memory(store: &Arc<InMemoryStore>, timeout: Duration) -> Self {
        Self {
            users: store.clone(),
            rules: store.clone(),
            nodes: store.clone(),
            pki: store.clone(),
            credentials: store.clone(),
            timeout,
        }
    }

    /// Run `fut` under the configured deadline.
    ///
    /// # Errors
    ///
    /// See [`with_deadline`].
    pub async fn call<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        with_deadline(self.timeout, what, fut).await
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
