//! Certificate authority, leaf issuance and certificate inspection.

pub mod authority;
pub mod cert_manager;
pub mod identity;

pub use authority::{
    CaRecord, CaStatus, CaSummary, CertificateAuthority, IssuedCertificate,
    RotationAction, RotationEvent, VerifiedCertificate,
};
pub use cert_manager::{CaParams, CertGenerator, CertRole, GeneratedCert, fingerprint_der};
pub use identity::{CertIdentity, pem_to_der};
