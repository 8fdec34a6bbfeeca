//! Error types for the VPN control plane

use std::io;

use thiserror::Error;

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

/// Control plane errors
#[derive(Error, Debug)]
pub enum Error {
    /// Bad node token, auth token or certificate serial
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    /// Caller is not assigned to the requested node
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Credential passed its expiry
    #[error("Credential expired: {0}")]
    CredentialExpired(String),

    /// Credential was revoked by an administrator
    #[error("Credential revoked: {0}")]
    CredentialRevoked(String),

    /// Credential was issued for a different node
    #[error("Binding mismatch: {0}")]
    BindingMismatch(String),

    /// User, node, CA or credential not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Illegal CA lifecycle transition
    #[error("Invalid CA state: {0}")]
    InvalidCaState(String),

    /// Issuance attempted while no CA is active
    #[error("No active certificate authority")]
    NoActiveCa,

    /// A stored or submitted setting cannot be parsed
    #[error("Malformed setting: {0}")]
    MalformedSetting(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence backend unavailable or timed out (retryable)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Uniqueness violation reported by a store
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Key generation, signing or certificate parsing failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Control plane unreachable from a node agent (retryable)
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is transient and the caller should retry later.
    ///
    /// Retryable errors are never converted into an allow decision.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Transport(_) | Self::Http(_) | Self::Io(_)
        )
    }
}
