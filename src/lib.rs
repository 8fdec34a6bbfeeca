//! VPN Control Plane Library
//!
//! Zero-trust control plane for a fleet of VPN gateways, hubs and spokes.
//!
//! # Features
//!
//! - **Certificate authority**: bootstrap, staged rotation with dual trust,
//!   revocation of retired CAs
//! - **Bound credentials**: client certificates and configs tied to one
//!   (user, node) pair, rendered into a self-contained client profile
//! - **Per-connection enforcement**: Generate → Verify → Connect →
//!   Disconnect with fresh authorization on every Verify
//! - **Default-deny access**: per-user and per-group rules resolved into
//!   firewall allow-lists and pushed routes
//! - **Drift reconciliation**: nodes heartbeat their applied config version
//!   and CA fingerprint and reprovision on mismatch

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod api;
pub mod audit;
pub mod cli;
pub mod config;
pub mod config_version;
pub mod enforcement;
pub mod error;
pub mod issuer;
pub mod model;
pub mod pending;
pub mod pki;
pub mod server;
pub mod store;
pub mod sync;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set.
///
/// # Errors
///
/// [`Error::Config`] when a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("tracing: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("tracing: {e}"))),
    }
}
