//! Certificate authority lifecycle with zero-downtime rotation.
//!
//! # States
//!
//! ```text
//!  prepare_rotation      activate           activate(next)
//! ────────────────▶ pending ──────▶ active ───────────────▶ retired
//!                      │                                     │
//!                      └──────────── revoke ─────────────────┴──▶ revoked
//! ```
//!
//! At most one CA is `active`. The trust set is every `active` or `retired`
//! CA, so certificates issued before a rotation keep verifying until the
//! operator revokes the retired CA.
//!
//! # Concurrency
//!
//! Readers (issuance, verification, fingerprints) load an immutable
//! snapshot of every CA through `arc-swap` and never block. Mutations are
//! serialized by one async mutex, persisted through [`PkiStore`] as a single
//! transaction, and only then published as a new snapshot. A failed commit
//! leaves both the store and the snapshot untouched.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::config::PkiConfig;
use crate::model::CertificateRecord;
use crate::pki::cert_manager::{
    CaParams, CertGenerator, CertRole, LeafCertParams, Signer, fingerprint_der, generate_serial,
};
use crate::pki::identity::{CertIdentity, pem_to_der};
use crate::store::{PkiStore, with_deadline};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a certificate authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaStatus {
    /// Signs new certificates; trusted.
    Active,
    /// Created by a rotation, waiting for activation; not trusted.
    Pending,
    /// Previously active; trusted for verification only.
    Retired,
    /// Removed from the trust set.
    Revoked,
}

impl CaStatus {
    /// Whether certificates signed by a CA in this state verify.
    #[must_use]
    pub fn is_trusted(self) -> bool {
        matches!(self, Self::Active | Self::Retired)
    }
}

/// Persisted certificate authority.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaRecord {
    /// CA identifier.
    pub id: Uuid,
    /// Subject Common Name.
    pub common_name: String,
    /// Lifecycle state.
    pub status: CaStatus,
    /// PEM certificate.
    pub cert_pem: String,
    /// PEM private key.
    pub key_pem: String,
    /// SHA-256 of the certificate DER, lowercase hex.
    pub fingerprint: String,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the CA became active.
    pub activated_at: Option<DateTime<Utc>>,
    /// When the CA was retired.
    pub retired_at: Option<DateTime<Utc>>,
    /// When the CA was revoked.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Operator-supplied revocation reason.
    pub revocation_reason: Option<String>,
}

impl std::fmt::Debug for CaRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaRecord")
            .field("id", &self.id)
            .field("common_name", &self.common_name)
            .field("status", &self.status)
            .field("fingerprint", &self.fingerprint)
            .field("not_after", &self.not_after)
            .field("key_pem", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Kind of CA lifecycle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationAction {
    /// Initial CA created at bootstrap.
    Bootstrapped,
    /// Pending CA created.
    Prepared,
    /// Pending CA became active.
    Activated,
    /// Active CA retired by an activation.
    Retired,
    /// CA removed from the trust set.
    Revoked,
}

/// Entry of the rotation audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEvent {
    /// CA concerned.
    pub ca_id: Uuid,
    /// What happened.
    pub action: RotationAction,
    /// When.
    pub at: DateTime<Utc>,
    /// Reason or related CA.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RotationEvent {
    fn new(ca_id: Uuid, action: RotationAction, at: DateTime<Utc>, detail: Option<String>) -> Self {
        Self {
            ca_id,
            action,
            at,
            detail,
        }
    }
}

/// Public view of a CA (no key material).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaSummary {
    /// CA identifier.
    pub id: Uuid,
    /// Subject Common Name.
    pub common_name: String,
    /// Lifecycle state.
    pub status: CaStatus,
    /// SHA-256 fingerprint.
    pub fingerprint: String,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Activation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    /// Retirement time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
    /// Revocation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Revocation reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
    /// Leaf certificates issued by this process since startup.
    pub issued: u64,
}

/// A freshly issued leaf certificate with its private key.
#[derive(Clone)]
pub struct IssuedCertificate {
    /// Lowercase hex serial.
    pub serial: String,
    /// Subject CN.
    pub subject: String,
    /// Signing CA.
    pub ca_id: Uuid,
    /// PEM certificate.
    pub cert_pem: String,
    /// PEM private key.
    pub key_pem: String,
    /// SHA-256 fingerprint.
    pub fingerprint: String,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity (clamped to the CA's).
    pub not_after: DateTime<Utc>,
}

impl IssuedCertificate {
    /// Persistable record, optionally bound to a node.
    #[must_use]
    pub fn record(&self, node_id: Option<&str>) -> CertificateRecord {
        CertificateRecord {
            serial: self.serial.clone(),
            subject: self.subject.clone(),
            fingerprint: self.fingerprint.clone(),
            ca_id: self.ca_id,
            not_before: self.not_before,
            not_after: self.not_after,
            node_id: node_id.map(str::to_string),
            revocation: None,
        }
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("serial", &self.serial)
            .field("subject", &self.subject)
            .field("ca_id", &self.ca_id)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful certificate verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCertificate {
    /// CA that signed the certificate.
    pub ca_id: Uuid,
    /// Lowercase hex serial.
    pub serial: String,
    /// Subject CN.
    pub subject: Option<String>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

struct LoadedCa {
    record: CaRecord,
    der: Vec<u8>,
    /// Present only while the CA is active.
    signer: Option<Arc<Signer>>,
    issued: Arc<AtomicU64>,
}

impl LoadedCa {
    fn summary(&self) -> CaSummary {
        let r = &self.record;
        CaSummary {
            id: r.id,
            common_name: r.common_name.clone(),
            status: r.status,
            fingerprint: r.fingerprint.clone(),
            not_before: r.not_before,
            not_after: r.not_after,
            created_at: r.created_at,
            activated_at: r.activated_at,
            retired_at: r.retired_at,
            revoked_at: r.revoked_at,
            revocation_reason: r.revocation_reason.clone(),
            issued: self.issued.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of every known CA, in creation order.
#[derive(Default)]
struct CaSet {
    cas: Vec<Arc<LoadedCa>>,
}

impl CaSet {
    fn active(&self) -> Option<&Arc<LoadedCa>> {
        self.cas.iter().find(|c| c.record.status == CaStatus::Active)
    }

    fn get(&self, id: Uuid) -> Option<&Arc<LoadedCa>> {
        self.cas.iter().find(|c| c.record.id == id)
    }

    fn records(&self) -> Vec<CaRecord> {
        self.cas.iter().map(|c| c.record.clone()).collect()
    }

    /// Build a snapshot from `records`, carrying issuance counters over from
    /// `previous`.
    fn build(records: Vec<CaRecord>, previous: &Self) -> Result<Self> {
        if records.iter().filter(|r| r.status == CaStatus::Active).count() > 1 {
            return Err(Error::InvalidCaState(
                "more than one active certificate authority".to_string(),
            ));
        }

        let mut cas = Vec::with_capacity(records.len());
        for record in records {
            let der = pem_to_der(&record.cert_pem)?;
            let signer = if record.status == CaStatus::Active {
                Some(Arc::new(Signer::from_pem(&record.cert_pem, &record.key_pem)?))
            } else {
                None
            };
            let issued = previous
                .get(record.id)
                .map_or_else(|| Arc::new(AtomicU64::new(0)), |c| c.issued.clone());
            cas.push(Arc::new(LoadedCa {
                record,
                der,
                signer,
                issued,
            }));
        }
        Ok(Self { cas })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authority
// ─────────────────────────────────────────────────────────────────────────────

/// Certificate authority with rotation support.
pub struct CertificateAuthority {
    snapshot: ArcSwap<CaSet>,
    mutate: Mutex<()>,
    store: Arc<dyn PkiStore>,
    config: PkiConfig,
    timeout: Duration,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cas", &self.snapshot.load().cas.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load persisted CAs; when there are none, create and persist an
    /// initial active CA.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCaState`] if the store holds more than one active CA
    /// - [`Error::StoreUnavailable`] if the store does not answer in time
    /// - [`Error::Crypto`] if persisted material cannot be parsed
    pub async fn bootstrap(
        store: Arc<dyn PkiStore>,
        config: PkiConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let records = with_deadline(timeout, "pki.load_authorities", store.load_authorities()).await?;

        let authority = Self {
            snapshot: ArcSwap::from_pointee(CaSet::default()),
            mutate: Mutex::new(()),
            store,
            config,
            timeout,
        };

        if records.is_empty() {
            let (record, detail) = match &authority.config.import_dir {
                Some(dir) => (
                    import_record(dir).await?,
                    Some(format!("imported from {}", dir.display())),
                ),
                None => (authority.generate_record(CaStatus::Active)?, None),
            };
            let event = RotationEvent::new(record.id, RotationAction::Bootstrapped, record.created_at, detail);
            let set = CaSet::build(vec![record.clone()], &CaSet::default())?;
            authority.commit(vec![record.clone()], vec![event]).await?;
            authority.snapshot.store(Arc::new(set));
            info!(ca_id = %record.id, fingerprint = %record.fingerprint, "Bootstrapped certificate authority");
            audit::emit(&AuditEvent::ca_bootstrapped(record.id, &record.fingerprint));
        } else {
            let set = CaSet::build(records, &CaSet::default())?;
            match set.active() {
                Some(active) => info!(
                    ca_id = %active.record.id,
                    fingerprint = %active.record.fingerprint,
                    total = set.cas.len(),
                    "Loaded certificate authorities"
                ),
                None => warn!(
                    total = set.cas.len(),
                    "No active certificate authority; issuance is disabled until one is activated"
                ),
            }
            authority.snapshot.store(Arc::new(set));
        }

        Ok(authority)
    }

    // ── Rotation ─────────────────────────────────────────────────────────────

    /// Create a new `pending` CA. The active CA is untouched.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCaState`] if a pending CA already exists; store and
    /// crypto errors otherwise.
    pub async fn prepare_rotation(&self) -> Result<CaSummary> {
        let _guard = self.mutate.lock().await;
        let current = self.snapshot.load_full();

        if let Some(pending) = current.cas.iter().find(|c| c.record.status == CaStatus::Pending) {
            return Err(Error::InvalidCaState(format!(
                "CA {} is already pending activation",
                pending.record.id
            )));
        }

        let record = self.generate_record(CaStatus::Pending)?;
        let event = RotationEvent::new(record.id, RotationAction::Prepared, record.created_at, None);

        let mut records = current.records();
        records.push(record.clone());
        let next = CaSet::build(records, &current)?;

        self.commit(vec![record.clone()], vec![event]).await?;
        self.snapshot.store(Arc::new(next));

        info!(ca_id = %record.id, fingerprint = %record.fingerprint, "Prepared CA rotation");
        audit::emit(&AuditEvent::ca_prepared(record.id, &record.fingerprint));
        self.summary(record.id)
    }

    /// Atomically retire the active CA and activate the pending CA `id`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id, [`Error::InvalidCaState`] if
    /// the target is not pending. Nothing changes on any error.
    pub async fn activate(&self, id: Uuid) -> Result<CaSummary> {
        let _guard = self.mutate.lock().await;
        let current = self.snapshot.load_full();

        let target = current
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("certificate authority {id}")))?;
        if target.record.status != CaStatus::Pending {
            return Err(Error::InvalidCaState(format!(
                "CA {id} is {:?}, only a pending CA can be activated",
                target.record.status
            )));
        }

        let now = Utc::now();
        let retired_id = current.active().map(|a| a.record.id);
        let mut changed = Vec::with_capacity(2);
        let mut events = Vec::with_capacity(2);

        let records: Vec<CaRecord> = current
            .records()
            .into_iter()
            .map(|mut r| {
                if r.id == id {
                    r.status = CaStatus::Active;
                    r.activated_at = Some(now);
                    events.push(RotationEvent::new(
                        r.id,
                        RotationAction::Activated,
                        now,
                        retired_id.map(|old| format!("replaces {old}")),
                    ));
                    changed.push(r.clone());
                } else if r.status == CaStatus::Active {
                    r.status = CaStatus::Retired;
                    r.retired_at = Some(now);
                    events.push(RotationEvent::new(
                        r.id,
                        RotationAction::Retired,
                        now,
                        Some(format!("replaced by {id}")),
                    ));
                    changed.push(r.clone());
                }
                r
            })
            .collect();

        // Built before the commit so unusable key material aborts cleanly.
        let next = CaSet::build(records, &current)?;
        self.commit(changed, events).await?;
        self.snapshot.store(Arc::new(next));

        let summary = self.summary(id)?;
        info!(
            ca_id = %id,
            retired_ca_id = ?retired_id,
            fingerprint = %summary.fingerprint,
            "Activated certificate authority"
        );
        audit::emit(&AuditEvent::ca_activated(id, &summary.fingerprint, retired_id));
        Ok(summary)
    }

    /// Remove a `pending` or `retired` CA from the trust set.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id, [`Error::InvalidCaState`] for
    /// the active CA or an already revoked one.
    pub async fn revoke(&self, id: Uuid, reason: &str) -> Result<CaSummary> {
        let _guard = self.mutate.lock().await;
        let current = self.snapshot.load_full();

        let target = current
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("certificate authority {id}")))?;
        match target.record.status {
            CaStatus::Pending | CaStatus::Retired => {}
            CaStatus::Active => {
                return Err(Error::InvalidCaState(format!(
                    "CA {id} is active; activate a replacement before revoking it"
                )));
            }
            CaStatus::Revoked => {
                return Err(Error::InvalidCaState(format!("CA {id} is already revoked")));
            }
        }

        let now = Utc::now();
        let mut changed = Vec::with_capacity(1);
        let records: Vec<CaRecord> = current
            .records()
            .into_iter()
            .map(|mut r| {
                if r.id == id {
                    r.status = CaStatus::Revoked;
                    r.revoked_at = Some(now);
                    r.revocation_reason = Some(reason.to_string());
                    changed.push(r.clone());
                }
                r
            })
            .collect();
        let event = RotationEvent::new(id, RotationAction::Revoked, now, Some(reason.to_string()));

        let next = CaSet::build(records, &current)?;
        self.commit(changed, vec![event]).await?;
        self.snapshot.store(Arc::new(next));

        warn!(ca_id = %id, reason, "Revoked certificate authority");
        audit::emit(&AuditEvent::ca_revoked(id, reason));
        self.summary(id)
    }

    /// The persisted rotation log, oldest first.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn rotation_events(&self) -> Result<Vec<RotationEvent>> {
        with_deadline(self.timeout, "pki.rotation_events", self.store.rotation_events()).await
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Every CA, in creation order.
    #[must_use]
    pub fn list(&self) -> Vec<CaSummary> {
        self.snapshot.load().cas.iter().map(|c| c.summary()).collect()
    }

    /// Summary of one CA.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id.
    pub fn summary(&self, id: Uuid) -> Result<CaSummary> {
        self.snapshot
            .load()
            .get(id)
            .map(|c| c.summary())
            .ok_or_else(|| Error::NotFound(format!("certificate authority {id}")))
    }

    /// Lifecycle state of a CA, if known.
    #[must_use]
    pub fn status(&self, id: Uuid) -> Option<CaStatus> {
        self.snapshot.load().get(id).map(|c| c.record.status)
    }

    /// Fingerprint of the active CA, if any.
    #[must_use]
    pub fn active_fingerprint(&self) -> Option<String> {
        self.snapshot
            .load()
            .active()
            .map(|c| c.record.fingerprint.clone())
    }

    /// Fingerprint of a CA: SHA-256 over its certificate DER, lowercase hex.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id.
    pub fn fingerprint(&self, id: Uuid) -> Result<String> {
        self.snapshot
            .load()
            .get(id)
            .map(|c| fingerprint_der(&c.der))
            .ok_or_else(|| Error::NotFound(format!("certificate authority {id}")))
    }

    /// Concatenated PEM of every trusted CA, active first.
    #[must_use]
    pub fn trust_bundle_pem(&self) -> String {
        let set = self.snapshot.load();
        let mut trusted: Vec<&Arc<LoadedCa>> =
            set.cas.iter().filter(|c| c.record.status.is_trusted()).collect();
        trusted.sort_by_key(|c| c.record.status != CaStatus::Active);

        let mut bundle = String::new();
        for ca in trusted {
            bundle.push_str(ca.record.cert_pem.trim_end());
            bundle.push('\n');
        }
        bundle
    }

    // ── Issuance and verification ────────────────────────────────────────────

    /// Issue a leaf certificate signed by the active CA.
    ///
    /// Validity starts now and ends after `valid_for`, clamped to the CA's
    /// own `not_after`.
    ///
    /// # Errors
    ///
    /// [`Error::NoActiveCa`] when no CA is active, [`Error::InvalidCaState`]
    /// when the active CA has expired, [`Error::Crypto`] on signing failure.
    pub fn issue_certificate(
        &self,
        common_name: &str,
        valid_for: Duration,
        role: CertRole,
    ) -> Result<IssuedCertificate> {
        let set = self.snapshot.load();
        let ca = set.active().ok_or(Error::NoActiveCa)?;
        let signer = ca.signer.as_ref().ok_or(Error::NoActiveCa)?;

        let now = whole_seconds(Utc::now());
        let requested = chrono::Duration::from_std(valid_for)
            .map_err(|e| Error::MalformedSetting(format!("validity out of range: {e}")))?;
        let not_after = now
            .checked_add_signed(requested)
            .ok_or_else(|| Error::MalformedSetting(format!("validity {valid_for:?} out of range")))?
            .min(ca.record.not_after);
        if not_after <= now {
            return Err(Error::InvalidCaState(format!(
                "active CA {} expired at {}",
                ca.record.id, ca.record.not_after
            )));
        }

        let serial = generate_serial();
        let cert = CertGenerator::issue_leaf(
            &LeafCertParams {
                cn: common_name,
                role,
                serial: &serial,
                not_before: now,
                not_after,
            },
            signer,
        )?;
        ca.issued.fetch_add(1, Ordering::Relaxed);

        Ok(IssuedCertificate {
            fingerprint: cert.fingerprint(),
            serial,
            subject: common_name.to_string(),
            ca_id: ca.record.id,
            cert_pem: cert.cert_pem,
            key_pem: cert.key_pem,
            not_before: now,
            not_after,
        })
    }

    /// Verify a DER certificate against the trust set.
    ///
    /// # Errors
    ///
    /// - [`Error::CredentialRevoked`] (`issuing authority revoked`) when the
    ///   signing CA is revoked, regardless of the certificate's expiry
    /// - [`Error::CredentialExpired`] outside the validity window
    /// - [`Error::AuthenticationFailure`] when no trusted CA signed it
    pub fn verify_certificate(&self, der: &[u8], now: DateTime<Utc>) -> Result<VerifiedCertificate> {
        let identity = CertIdentity::from_der(der)?;
        let set = self.snapshot.load();

        for ca in &set.cas {
            if !CertIdentity::is_signed_by(der, &ca.der)? {
                continue;
            }
            match ca.record.status {
                CaStatus::Revoked => {
                    return Err(Error::CredentialRevoked("issuing authority revoked".to_string()));
                }
                CaStatus::Pending => continue,
                CaStatus::Active | CaStatus::Retired => {}
            }
            if !identity.is_valid_at(now) {
                return Err(Error::CredentialExpired(format!(
                    "certificate {} not valid at {now}",
                    identity.serial
                )));
            }
            return Ok(VerifiedCertificate {
                ca_id: ca.record.id,
                serial: identity.serial,
                subject: identity.common_name,
                not_after: identity.not_after,
            });
        }

        Err(Error::AuthenticationFailure(
            "certificate not issued by a trusted authority".to_string(),
        ))
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn generate_record(&self, status: CaStatus) -> Result<CaRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let common_name = format!(
            "{} {} {}",
            self.config.ca_common_name,
            now.format("%Y-%m-%d"),
            &id.simple().to_string()[..8]
        );
        let generated = CertGenerator::init_ca(&CaParams {
            cn: &common_name,
            validity_days: self.config.ca_validity_days,
        })?;
        let identity = CertIdentity::from_der(&generated.cert_der)?;

        Ok(CaRecord {
            id,
            common_name,
            status,
            fingerprint: generated.fingerprint(),
            cert_pem: generated.cert_pem,
            key_pem: generated.key_pem,
            not_before: identity.not_before,
            not_after: identity.not_after,
            created_at: now,
            activated_at: (status == CaStatus::Active).then_some(now),
            retired_at: None,
            revoked_at: None,
            revocation_reason: None,
        })
    }

    async fn commit(&self, records: Vec<CaRecord>, events: Vec<RotationEvent>) -> Result<()> {
        with_deadline(
            self.timeout,
            "pki.commit_rotation",
            self.store.commit_rotation(records, events),
        )
        .await
    }
}

/// Read a `ca.crt` / `ca.key` pair exported by `ca init` into an active
/// record. The pair must be a self-signed CA whose key matches and which is
/// still valid.
async fn import_record(dir: &Path) -> Result<CaRecord> {
    let read = |name: &'static str| {
        let path = dir.join(name);
        async move {
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
        }
    };
    let cert_pem = read("ca.crt").await?;
    let key_pem = read("ca.key").await?;

    let der = pem_to_der(&cert_pem)?;
    if !CertIdentity::is_signed_by(&der, &der)? {
        return Err(Error::Crypto(format!(
            "'{}' is not a self-signed CA certificate",
            dir.join("ca.crt").display()
        )));
    }

    // A leaf signed with the key must chain to the certificate.
    let signer = Signer::from_pem(&cert_pem, &key_pem)?;
    let now = whole_seconds(Utc::now());
    let check = CertGenerator::issue_leaf(
        &LeafCertParams {
            cn: "import-check",
            role: CertRole::Server,
            serial: &generate_serial(),
            not_before: now,
            not_after: now + chrono::Duration::minutes(1),
        },
        &signer,
    )?;
    if !CertIdentity::is_signed_by(&check.cert_der, &der)? {
        return Err(Error::Crypto(format!(
            "'{}' does not match '{}'",
            dir.join("ca.key").display(),
            dir.join("ca.crt").display()
        )));
    }

    let identity = CertIdentity::from_der(&der)?;
    if !identity.is_valid_at(now) {
        return Err(Error::InvalidCaState(format!(
            "imported CA is not valid now (valid {} to {})",
            identity.not_before, identity.not_after
        )));
    }

    Ok(CaRecord {
        id: Uuid::new_v4(),
        common_name: identity.common_name.unwrap_or_default(),
        status: CaStatus::Active,
        fingerprint: identity.fingerprint,
        cert_pem,
        key_pem,
        not_before: identity.not_before,
        not_after: identity.not_after,
        created_at: now,
        activated_at: Some(now),
        retired_at: None,
        revoked_at: None,
        revocation_reason: None,
    })
}

fn whole_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.timestamp(), 0).unwrap_or(dt)
}
