//! Certificate field extraction and signature checks.
//!
//! Parses an X.509 DER-encoded certificate and extracts the fields the
//! control plane cares about: Common Name, serial, validity window and
//! fingerprint.

use chrono::{DateTime, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::pki::cert_manager::fingerprint_der;
use crate::{Error, Result};

/// Extracted identity fields from a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    /// Subject Common Name (CN).
    pub common_name: Option<String>,
    /// Lowercase hex serial.
    pub serial: String,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// SHA-256 of the DER encoding.
    pub fingerprint: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = parse(der)?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);

        Ok(Self {
            common_name,
            serial: hex::encode(cert.raw_serial()),
            not_before: to_utc(cert.validity().not_before.timestamp())?,
            not_after: to_utc(cert.validity().not_after.timestamp())?,
            fingerprint: fingerprint_der(der),
        })
    }

    /// Whether `leaf_der` names `issuer_der`'s subject as its issuer and
    /// carries a valid signature from the issuer's key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if either certificate cannot be parsed.
    pub fn is_signed_by(leaf_der: &[u8], issuer_der: &[u8]) -> Result<bool> {
        let leaf = parse(leaf_der)?;
        let issuer = parse(issuer_der)?;

        if leaf.issuer().as_raw() != issuer.subject().as_raw() {
            return Ok(false);
        }
        Ok(leaf.verify_signature(Some(issuer.public_key())).is_ok())
    }

    /// Whether `now` falls inside the certificate's validity window.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }
}

/// Decode the first PEM certificate block in `pem` to DER.
///
/// # Errors
///
/// Returns `Error::Crypto` if no certificate block can be decoded.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| Error::Crypto(format!("Failed to decode PEM certificate: {e}")))?;
    Ok(block.contents)
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Crypto(format!("Failed to parse certificate: {e}")))?;
    Ok(cert)
}

fn to_utc(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| Error::Crypto(format!("Certificate timestamp out of range: {ts}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::cert_manager::{CaParams, CertGenerator};

    fn ca_der(cn: &str) -> Vec<u8> {
        CertGenerator::init_ca(&CaParams {
            cn,
            validity_days: 30,
        })
        .unwrap()
        .cert_der
    }

    #[test]
    fn from_der_extracts_common_name_and_window() {
        // GIVEN: a freshly generated CA valid for 30 days
        let der = ca_der("Fleet CA");
        // WHEN: parsing
        let id = CertIdentity::from_der(&der).unwrap();
        // THEN: CN and a 30-day window are extracted
        assert_eq!(id.common_name.as_deref(), Some("Fleet CA"));
        let span = id.not_after - id.not_before;
        assert_eq!(span.num_days(), 30);
        assert!(id.is_valid_at(Utc::now() + chrono::Duration::days(1)));
        assert!(!id.is_valid_at(Utc::now() + chrono::Duration::days(31)));
    }

    #[test]
    fn fingerprint_matches_generator_fingerprint() {
        let der = ca_der("Fleet CA");
        let id = CertIdentity::from_der(&der).unwrap();
        assert_eq!(id.fingerprint, fingerprint_der(&der));
    }

    #[test]
    fn self_signed_ca_is_signed_by_itself() {
        let der = ca_der("Fleet CA");
        assert!(CertIdentity::is_signed_by(&der, &der).unwrap());
    }

    #[test]
    fn pem_to_der_round_trips_generated_pem() {
        let ca = CertGenerator::init_ca(&CaParams {
            cn: "Fleet CA",
            validity_days: 30,
        })
        .unwrap();
        assert_eq!(pem_to_der(&ca.cert_pem).unwrap(), ca.cert_der);
        assert!(pem_to_der("garbage").is_err());
    }

    #[test]
    fn from_der_invalid_bytes_returns_error() {
        let result = CertIdentity::from_der(b"not a cert");
        assert!(matches!(result, Err(Error::Crypto(_))));
    }
}
