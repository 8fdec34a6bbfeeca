//! Certificate generation: CA creation, leaf signing, and on-disk export.
//!
//! Provides:
//! - [`CertGenerator::init_ca`] - `rcgen`-backed self-signed CA generation
//! - [`CertGenerator::issue_leaf`] - client/server leaf certificates signed
//!   by a loaded [`Signer`]
//! - [`CertGenerator::write_to_dir`] - writes `<stem>.crt` / `<stem>.key`
//!   for the `ca init` CLI command, importable through `pki.import_dir`
//!
//! # File format
//!
//! All certificate and key material is handled in **PEM format**; DER is
//! only used internally for fingerprints and signature checks.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Organisation name stamped into every subject DN.
const ORGANIZATION: &str = "VPN Control Plane";

// ─────────────────────────────────────────────────────────────────────────────
// Parameters and outputs
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for generating a CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name for the CA (e.g. `"VPN Control Plane CA"`).
    pub cn: &'a str,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Extended key usage of a leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertRole {
    /// VPN client (user) certificate, `clientAuth`.
    Client,
    /// VPN node (server) certificate, `serverAuth`.
    Server,
}

/// Parameters for issuing a leaf certificate.
#[derive(Debug)]
pub struct LeafCertParams<'a> {
    /// Common Name (user email or node name).
    pub cn: &'a str,
    /// Client or server usage.
    pub role: CertRole,
    /// Lowercase hex serial produced by [`generate_serial`].
    pub serial: &'a str,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

/// Generated certificate and key pair.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
    /// DER-encoded certificate.
    pub cert_der: Vec<u8>,
}

impl GeneratedCert {
    /// SHA-256 fingerprint of the certificate DER.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint_der(&self.cert_der)
    }
}

/// A CA certificate and key loaded into `rcgen` form, ready to sign leaves.
///
/// Built once per CA activation and shared through the authority snapshot.
pub struct Signer {
    cert: Certificate,
    key: KeyPair,
}

impl Signer {
    /// Rebuild the signing form of a CA from its PEM certificate and key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if either PEM block cannot be parsed.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Crypto(format!("Failed to parse CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| Error::Crypto(format!("Failed to parse CA cert: {e}")))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::Crypto(format!("Failed to rebuild CA cert for signing: {e}")))?;
        Ok(Self { cert, key })
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generator
// ─────────────────────────────────────────────────────────────────────────────

/// Certificate generator backed by `rcgen`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA certificate valid from now for
    /// `validity_days`.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or certificate serialisation fails.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Crypto(format!("Failed to generate CA key: {e}")))?;

        let now = Utc::now();
        let not_after = now + chrono::Duration::days(i64::from(params.validity_days));

        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.serial_number = Some(SerialNumber::from_slice(&random_serial_bytes()));
        ca_params.not_before = to_offset(now)?;
        ca_params.not_after = to_offset(not_after)?;

        let ca_cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| Error::Crypto(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: ca_cert.pem(),
            key_pem: key_pair.serialize_pem(),
            cert_der: ca_cert.der().to_vec(),
        })
    }

    /// Issue a leaf certificate signed by `signer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the serial is not valid hex, key generation fails,
    /// or signing fails.
    pub fn issue_leaf(params: &LeafCertParams<'_>, signer: &Signer) -> Result<GeneratedCert> {
        let serial = hex::decode(params.serial)
            .map_err(|e| Error::Crypto(format!("Invalid serial '{}': {e}", params.serial)))?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Crypto(format!("Failed to generate leaf key: {e}")))?;

        let mut leaf_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        leaf_params.distinguished_name = dn;
        leaf_params.is_ca = IsCa::ExplicitNoCa;
        leaf_params.serial_number = Some(SerialNumber::from_slice(&serial));
        leaf_params.not_before = to_offset(params.not_before)?;
        leaf_params.not_after = to_offset(params.not_after)?;
        leaf_params.use_authority_key_identifier_extension = true;
        match params.role {
            CertRole::Client => {
                leaf_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
                leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
            }
            CertRole::Server => {
                leaf_params.key_usages = vec![
                    KeyUsagePurpose::DigitalSignature,
                    KeyUsagePurpose::KeyEncipherment,
                ];
                leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
            }
        }

        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &signer.cert, &signer.key)
            .map_err(|e| Error::Crypto(format!("Leaf cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            cert_der: leaf_cert.der().to_vec(),
        })
    }

    /// Export a CA as `<stem>.crt` and `<stem>.key` under `dir`, in the
    /// layout `pki.import_dir` reads back at bootstrap.
    ///
    /// The key file is created with mode 0600 and never overwritten.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the directory cannot be created, the key file
    /// already exists, or either file cannot be written.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Cannot create dir '{}': {e}", dir.display())))?;

        let key_path = dir.join(format!("{stem}.key"));
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut key_file = options
            .open(&key_path)
            .map_err(|e| Error::Config(format!("Cannot create key '{}': {e}", key_path.display())))?;
        key_file
            .write_all(cert.key_pem.as_bytes())
            .and_then(|()| key_file.sync_all())
            .map_err(|e| Error::Config(format!("Cannot write key: {e}")))?;

        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)
            .map_err(|e| Error::Config(format!("Cannot write cert: {e}")))?;

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serials and fingerprints
// ─────────────────────────────────────────────────────────────────────────────

/// Generate a 128-bit certificate serial from the thread CSPRNG.
///
/// The first byte is forced into `0x01..=0x7f` so the DER INTEGER keeps all
/// 16 bytes and the hex form round-trips through parsers unchanged.
#[must_use]
pub fn generate_serial() -> String {
    hex::encode(random_serial_bytes())
}

fn random_serial_bytes() -> [u8; 16] {
    let mut bytes: [u8; 16] = rand::rng().random();
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    bytes
}

/// SHA-256 over certificate DER, lowercase hex.
#[must_use]
pub fn fingerprint_der(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn to_offset(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::Crypto(format!("Date calculation error: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
