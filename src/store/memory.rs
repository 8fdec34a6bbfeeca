//! In-memory implementation of every collaborator store.
//!
//! Backed by `DashMap` indices so enforcement calls on different credentials
//! never contend. CA writes go through one `RwLock` so a rotation commit is
//! all-or-nothing, and credential inserts take a short mutex so the
//! duplicate check and the write are one step.
//!
//! [`InMemoryStore::set_unavailable`] simulates a backend outage: every
//! trait call then fails with [`Error::StoreUnavailable`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use subtle::ConstantTimeEq;
use tracing::debug;
use uuid::Uuid;

use super::{AccessRuleStore, CredentialStore, NodeStore, PkiStore, UserStore};
use crate::access::AccessRule;
use crate::model::{
    Assignee, CertificateRecord, GeneratedConfig, HeartbeatReport, Node, NodeSettings, Revocation,
    User,
};
use crate::pki::{CaRecord, RotationEvent};
use crate::{Error, Result};

#[derive(Default)]
struct PkiState {
    order: Vec<Uuid>,
    cas: HashMap<Uuid, CaRecord>,
    events: Vec<RotationEvent>,
}

/// In-memory store implementing [`UserStore`], [`AccessRuleStore`],
/// [`NodeStore`], [`PkiStore`] and [`CredentialStore`].
#[derive(Default)]
pub struct InMemoryStore {
    users: DashMap<String, User>,
    rules: DashMap<Assignee, Vec<AccessRule>>,
    nodes: DashMap<String, Node>,
    pki: RwLock<PkiState>,
    certificates: DashMap<String, CertificateRecord>,
    configs: DashMap<Uuid, GeneratedConfig>,
    config_by_token: DashMap<String, Uuid>,
    config_by_serial: DashMap<String, Uuid>,
    issue_lock: Mutex<()>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Administration ───────────────────────────────────────────────────────

    /// Insert or replace a user.
    pub fn upsert_user(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Insert or replace a node.
    pub fn upsert_node(&self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Grant `rule` to a user or group, replacing a rule with the same id.
    pub fn grant(&self, assignee: Assignee, rule: AccessRule) {
        let mut rules = self.rules.entry(assignee).or_default();
        rules.retain(|r| r.id != rule.id);
        rules.push(rule);
    }

    /// Withdraw a rule from a user or group. Returns whether it was present.
    pub fn withdraw(&self, assignee: &Assignee, rule_id: &str) -> bool {
        self.rules.get_mut(assignee).is_some_and(|mut rules| {
            let before = rules.len();
            rules.retain(|r| r.id != rule_id);
            rules.len() != before
        })
    }

    /// Simulate a backend outage (or recovery).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("in-memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn remove_config(&self, id: Uuid) {
        if let Some((_, config)) = self.configs.remove(&id) {
            self.config_by_token.remove(&config.auth_token);
            self.config_by_serial.remove(&config.certificate_serial);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Users and rules
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl UserStore for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        self.check()?;
        Ok(self.users.get(id).map(|u| u.clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        self.check()?;
        Ok(self
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .map(|u| u.clone()))
    }

    async fn users_in_group(&self, group_id: &str) -> Result<Vec<User>> {
        self.check()?;
        let mut members: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.groups.iter().any(|g| g == group_id))
            .map(|u| u.clone())
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(members)
    }
}

#[async_trait::async_trait]
impl AccessRuleStore for InMemoryStore {
    async fn rules_for_user(&self, user_id: &str) -> Result<Vec<AccessRule>> {
        self.check()?;
        Ok(self
            .rules
            .get(&Assignee::User(user_id.to_string()))
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn rules_for_group(&self, group_id: &str) -> Result<Vec<AccessRule>> {
        self.check()?;
        Ok(self
            .rules
            .get(&Assignee::Group(group_id.to_string()))
            .map(|r| r.clone())
            .unwrap_or_default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl NodeStore for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Node>> {
        self.check()?;
        Ok(self.nodes.get(id).map(|n| n.clone()))
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Node>> {
        self.check()?;
        if token.is_empty() {
            return Ok(None);
        }
        Ok(self
            .nodes
            .iter()
            .find(|n| bool::from(n.token.as_bytes().ct_eq(token.as_bytes())))
            .map(|n| n.clone()))
    }

    async fn record_heartbeat(&self, node_id: &str, report: HeartbeatReport) -> Result<Node> {
        self.check()?;
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        node.last_heartbeat = Some(report.received_at);
        node.public_ip = report.public_ip;
        node.active_clients = report.active_clients;
        node.service_running = report.service_running;
        node.reported_config_version = report.config_version;
        if report.ca_fingerprint.is_some() {
            node.last_ca_fingerprint = report.ca_fingerprint;
        }
        Ok(node.clone())
    }

    async fn update_settings(&self, node_id: &str, settings: NodeSettings) -> Result<Node> {
        self.check()?;
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        node.settings = settings;
        Ok(node.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PKI
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl PkiStore for InMemoryStore {
    async fn load_authorities(&self) -> Result<Vec<CaRecord>> {
        self.check()?;
        let state = self.pki.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.cas.get(id).cloned())
            .collect())
    }

    async fn commit_rotation(
        &self,
        records: Vec<CaRecord>,
        events: Vec<RotationEvent>,
    ) -> Result<()> {
        self.check()?;
        let mut state = self.pki.write().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            if !state.cas.contains_key(&record.id) {
                state.order.push(record.id);
            }
            state.cas.insert(record.id, record);
        }
        state.events.extend(events);
        Ok(())
    }

    async fn rotation_events(&self) -> Result<Vec<RotationEvent>> {
        self.check()?;
        let state = self.pki.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.events.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl CredentialStore for InMemoryStore {
    async fn insert_issued(&self, cert: CertificateRecord, config: GeneratedConfig) -> Result<()> {
        self.check()?;
        let _guard = self.issue_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.certificates.contains_key(&cert.serial) {
            return Err(Error::Conflict(format!("certificate serial {}", cert.serial)));
        }
        if self.configs.contains_key(&config.id) {
            return Err(Error::Conflict(format!("config id {}", config.id)));
        }
        if self.config_by_token.contains_key(&config.auth_token) {
            return Err(Error::Conflict("auth token".to_string()));
        }

        self.config_by_token.insert(config.auth_token.clone(), config.id);
        self.config_by_serial.insert(cert.serial.clone(), config.id);
        self.certificates.insert(cert.serial.clone(), cert);
        self.configs.insert(config.id, config);
        Ok(())
    }

    async fn insert_certificate(&self, cert: CertificateRecord) -> Result<()> {
        self.check()?;
        let _guard = self.issue_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.certificates.contains_key(&cert.serial) {
            return Err(Error::Conflict(format!("certificate serial {}", cert.serial)));
        }
        self.certificates.insert(cert.serial.clone(), cert);
        Ok(())
    }

    async fn certificate_by_serial(&self, serial: &str) -> Result<Option<CertificateRecord>> {
        self.check()?;
        Ok(self
            .certificates
            .get(&serial.to_ascii_lowercase())
            .map(|c| c.clone()))
    }

    async fn config_by_token(&self, token: &str) -> Result<Option<GeneratedConfig>> {
        self.check()?;
        let Some(id) = self.config_by_token.get(token).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.configs.get(&id).map(|c| c.clone()))
    }

    async fn config_by_id(&self, id: Uuid) -> Result<Option<GeneratedConfig>> {
        self.check()?;
        Ok(self.configs.get(&id).map(|c| c.clone()))
    }

    async fn config_by_serial(&self, serial: &str) -> Result<Option<GeneratedConfig>> {
        self.check()?;
        let Some(id) = self
            .config_by_serial
            .get(&serial.to_ascii_lowercase())
            .map(|id| *id)
        else {
            return Ok(None);
        };
        Ok(self.configs.get(&id).map(|c| c.clone()))
    }

    async fn revoke_config(&self, id: Uuid, revocation: Revocation) -> Result<GeneratedConfig> {
        self.check()?;
        let mut config = self
            .configs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("config {id}")))?;
        if config.revocation.is_none() {
            config.revocation = Some(revocation);
        }
        Ok(config.clone())
    }

    async fn revoke_certificate(
        &self,
        serial: &str,
        revocation: Revocation,
    ) -> Result<CertificateRecord> {
        self.check()?;
        let mut cert = self
            .certificates
            .get_mut(&serial.to_ascii_lowercase())
            .ok_or_else(|| Error::NotFound(format!("certificate {serial}")))?;
        if cert.revocation.is_none() {
            cert.revocation = Some(revocation);
        }
        Ok(cert.clone())
    }

    async fn configs_for_user(&self, user_id: &str) -> Result<Vec<GeneratedConfig>> {
        self.check()?;
        let mut configs: Vec<GeneratedConfig> = self
            .configs
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.clone())
            .collect();
        configs.sort_by_key(|c| c.issued_at);
        Ok(configs)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.check()?;
        let expired_configs: Vec<Uuid> = self
            .configs
            .iter()
            .filter(|c| c.expires_at < now)
            .map(|c| c.id)
            .collect();
        for id in &expired_configs {
            self.remove_config(*id);
        }

        let before = self.certificates.len();
        self.certificates.retain(|_, c| c.not_after >= now);
        let purged = expired_configs.len() + (before - self.certificates.len());

        if purged > 0 {
            debug!(purged, "Purged expired credentials");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{RuleSpec, RuleType};

    fn cert(serial: &str) -> CertificateRecord {
        let now = Utc::now();
        CertificateRecord {
            serial: serial.to_string(),
            subject: "alice@example.com".to_string(),
            fingerprint: "00".repeat(32),
            ca_id: Uuid::nil(),
            not_before: now,
            not_after: now + chrono::Duration::hours(1),
            node_id: Some("gw-1".to_string()),
            revocation: None,
        }
    }

    fn config(serial: &str, token: &str) -> GeneratedConfig {
        let now = Utc::now();
        GeneratedConfig {
            id: Uuid::new_v4(),
            user_id: "u-1".to_string(),
            node_id: "gw-1".to_string(),
            auth_token: token.to_string(),
            certificate_serial: serial.to_string(),
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
            revocation: None,
        }
    }

    fn revocation() -> Revocation {
        Revocation {
            reason: "test".to_string(),
            revoked_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_issued_indexes_by_token_and_serial() {
        let store = InMemoryStore::new();
        let cfg = config("0a", "tok-1");
        store.insert_issued(cert("0a"), cfg.clone()).await.unwrap();

        assert_eq!(store.config_by_token("tok-1").await.unwrap().unwrap().id, cfg.id);
        assert_eq!(store.config_by_serial("0A").await.unwrap().unwrap().id, cfg.id);
        assert!(store.certificate_by_serial("0a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_serial_writes_nothing() {
        // GIVEN: a stored credential
        let store = InMemoryStore::new();
        store.insert_issued(cert("0a"), config("0a", "tok-1")).await.unwrap();

        // WHEN: inserting another config reusing the serial
        let second = config("0a", "tok-2");
        let err = store.insert_issued(cert("0a"), second.clone()).await.unwrap_err();

        // THEN: conflict and no partial write of the second config
        assert!(matches!(err, Error::Conflict(_)));
        assert!(store.config_by_id(second.id).await.unwrap().is_none());
        assert!(store.config_by_token("tok-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_token_is_a_conflict() {
        let store = InMemoryStore::new();
        store.insert_issued(cert("0a"), config("0a", "tok-1")).await.unwrap();
        let err = store
            .insert_issued(cert("0b"), config("0b", "tok-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(store.certificate_by_serial("0b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revocation_keeps_first_marker() {
        let store = InMemoryStore::new();
        let cfg = config("0a", "tok-1");
        store.insert_issued(cert("0a"), cfg.clone()).await.unwrap();

        let first = store.revoke_config(cfg.id, revocation()).await.unwrap();
        let second = store
            .revoke_config(
                cfg.id,
                Revocation {
                    reason: "again".into(),
                    revoked_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(first.revocation, second.revocation);
        assert_eq!(second.revocation.unwrap().reason, "test");
    }

    #[tokio::test]
    async fn purge_removes_expired_configs_and_indexes() {
        let store = InMemoryStore::new();
        let cfg = config("0a", "tok-1");
        store.insert_issued(cert("0a"), cfg.clone()).await.unwrap();

        let purged = store
            .purge_expired(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();

        assert_eq!(purged, 2);
        assert!(store.config_by_token("tok-1").await.unwrap().is_none());
        assert!(store.config_by_id(cfg.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            UserStore::find_by_id(&store, "u-1").await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(matches!(
            store.load_authorities().await,
            Err(Error::StoreUnavailable(_))
        ));
        store.set_unavailable(false);
        assert!(UserStore::find_by_id(&store, "u-1").await.unwrap().is_none());
    }

    fn user(id: &str, groups: &[&str]) -> User {
        User {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
            active: true,
        }
    }

    #[tokio::test]
    async fn users_in_group_lists_members_only() {
        let store = InMemoryStore::new();
        store.upsert_user(user("u-b", &["eng", "ops"]));
        store.upsert_user(user("u-a", &["eng"]));
        store.upsert_user(user("u-c", &["sales"]));

        let members = store.users_in_group("eng").await.unwrap();

        let ids: Vec<&str> = members.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u-a", "u-b"]);
        assert!(store.users_in_group("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn node_token_lookup_needs_the_exact_token() {
        let store = InMemoryStore::new();
        store.upsert_node(Node {
            id: "gw-1".into(),
            name: "gw-1".into(),
            role: crate::model::NodeRole::Gateway,
            token: "node-secret".into(),
            endpoint: "vpn.example.com".into(),
            settings: NodeSettings::default(),
            networks: Vec::new(),
            assignments: Vec::new(),
            reported_config_version: String::new(),
            last_ca_fingerprint: None,
            last_heartbeat: None,
            public_ip: None,
            active_clients: 0,
            service_running: false,
        });

        assert!(store.find_by_token("node-secret").await.unwrap().is_some());
        assert!(store.find_by_token("node-secre").await.unwrap().is_none());
        assert!(store.find_by_token("node-secret2").await.unwrap().is_none());
        assert!(store.find_by_token("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn grant_replaces_by_id_and_withdraw_removes() {
        let store = InMemoryStore::new();
        let group = Assignee::Group("eng".into());
        let rule = |value: &str| {
            AccessRule::try_from(RuleSpec {
                id: "r1".into(),
                rule_type: RuleType::Cidr,
                value: value.into(),
                port_range: None,
                protocol: None,
                network: None,
                active: true,
                description: None,
            })
            .unwrap()
        };

        store.grant(group.clone(), rule("10.0.0.0/16"));
        store.grant(group.clone(), rule("10.1.0.0/16"));
        let rules = store.rules_for_group("eng").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].target.value(), "10.1.0.0/16");

        assert!(store.withdraw(&group, "r1"));
        assert!(!store.withdraw(&group, "r1"));
        assert!(store.rules_for_group("eng").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_rotation_preserves_creation_order() {
        let store = InMemoryStore::new();
        let gen_record = |cn: &str| {
            let ca = crate::pki::CertGenerator::init_ca(&crate::pki::CaParams {
                cn,
                validity_days: 1,
            })
            .unwrap();
            let now = Utc::now();
            CaRecord {
                id: Uuid::new_v4(),
                common_name: cn.to_string(),
                status: crate::pki::CaStatus::Pending,
                fingerprint: ca.fingerprint(),
                cert_pem: ca.cert_pem,
                key_pem: ca.key_pem,
                not_before: now,
                not_after: now,
                created_at: now,
                activated_at: None,
                retired_at: None,
                revoked_at: None,
                revocation_reason: None,
            }
        };
        let a = gen_record("A");
        let b = gen_record("B");
        store.commit_rotation(vec![a.clone()], Vec::new()).await.unwrap();
        store.commit_rotation(vec![b.clone()], Vec::new()).await.unwrap();
        let mut a2 = a.clone();
        a2.status = crate::pki::CaStatus::Revoked;
        store.commit_rotation(vec![a2], Vec::new()).await.unwrap();

        let loaded = store.load_authorities().await.unwrap();
        assert_eq!(loaded.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert_eq!(loaded[0].status, crate::pki::CaStatus::Revoked);
    }
}
