//! Control plane server: wires stores, CA, issuer, enforcement and node sync
//! behind the HTTP router, and owns the background reapers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::{AppState, create_router};
use crate::config::Config;
use crate::enforcement::{DOWNLOAD_TOKEN_PREFIX, EnforcementProtocol, EnforcementSettings};
use crate::issuer::CertificateIssuer;
use crate::pending::{self, PendingStore};
use crate::pki::CertificateAuthority;
use crate::store::inventory::Inventory;
use crate::store::{InMemoryStore, Stores};
use crate::sync::NodeSync;
use crate::{Error, Result};

/// The assembled control plane.
pub struct ControlPlane {
    config: Config,
    stores: Stores,
    state: Arc<AppState>,
    downloads: Arc<PendingStore<String>>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("host", &self.config.server.host)
            .field("port", &self.config.server.port)
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    /// Build over the bundled in-memory store, seeded from the configured
    /// inventory file when there is one.
    ///
    /// # Errors
    ///
    /// Inventory and CA bootstrap errors.
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(InMemoryStore::new());
        if let Some(path) = &config.inventory {
            let inv = Inventory::load(path)?;
            info!(
                path = %path.display(),
                users = inv.users.len(),
                nodes = inv.nodes.len(),
                grants = inv.grants.len(),
                "Loaded inventory"
            );
            inv.seed(&store);
        } else {
            warn!("No inventory configured; the control plane starts empty");
        }
        let stores = Stores::in_memory(&store, config.storage.timeout);
        Self::with_stores(config, stores).await
    }

    /// Build over injected stores.
    ///
    /// # Errors
    ///
    /// CA bootstrap errors.
    pub async fn with_stores(config: Config, stores: Stores) -> Result<Self> {
        let ca = Arc::new(
            CertificateAuthority::bootstrap(stores.pki.clone(), config.pki.clone(), stores.timeout)
                .await?,
        );
        let issuer = CertificateIssuer::new(ca.clone(), stores.clone(), &config.enforcement, &config.pki);
        let downloads = Arc::new(PendingStore::new(
            DOWNLOAD_TOKEN_PREFIX,
            config.enforcement.download_ttl,
        ));
        let enforcement = Arc::new(EnforcementProtocol::new(
            stores.clone(),
            ca.clone(),
            issuer.clone(),
            downloads.clone(),
            EnforcementSettings {
                activity_threshold: config.nodes.activity_threshold,
                default_dns_servers: config.nodes.default_dns_servers.clone(),
            },
        ));
        let sync = Arc::new(NodeSync::new(stores.clone(), ca.clone(), issuer));

        let admin_token = config.server.resolve_admin_token();
        if admin_token.is_none() {
            warn!("No admin token configured; administrative endpoints are disabled");
        }

        let state = Arc::new(AppState {
            enforcement,
            sync,
            ca,
            admin_token,
        });
        Ok(Self {
            config,
            stores,
            state,
            downloads,
        })
    }

    /// Shared state behind the router.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// The HTTP router.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(self.state())
    }

    /// Start the download and credential reapers. Both stop on `shutdown`.
    pub fn spawn_reapers(&self, shutdown: &broadcast::Sender<()>) {
        let interval = self.config.enforcement.reap_interval;
        pending::spawn_reaper(self.downloads.clone(), interval, shutdown.subscribe());
        spawn_credential_reaper(
            self.stores.clone(),
            self.state.clone(),
            interval,
            self.config.enforcement.max_validity,
            shutdown.subscribe(),
        );
    }

    /// Bind and serve until SIGINT/SIGTERM, then drain in-flight requests.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid host; bind and serve errors.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.spawn_reapers(&shutdown_tx);

        info!("============================================================");
        info!("VPN CONTROL PLANE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        match self.state.ca.active_fingerprint() {
            Some(fp) => info!(fingerprint = %fp, "Active certificate authority"),
            None => warn!("No active certificate authority"),
        }
        info!("============================================================");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Control plane stopped");
        Ok(())
    }
}

/// Periodically drop credentials that expired more than `retention` ago and
/// idle session records of the same age. Recently expired credentials stay
/// so Verify can still answer "credential expired".
fn spawn_credential_reaper(
    stores: Stores,
    state: Arc<AppState>,
    interval: Duration,
    retention: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(7));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = Utc::now() - retention;
                    match stores
                        .call("credentials.purge_expired", stores.credentials.purge_expired(cutoff))
                        .await
                    {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "Purged expired credentials"),
                        Err(e) => warn!(error = %e, "Credential purge failed"),
                    }
                    let pruned = state.enforcement.sessions().prune_idle(cutoff);
                    if pruned > 0 {
                        debug!(pruned, "Pruned idle sessions");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Credential reaper shutting down");
                    break;
                }
            }
        }
    });
}

/// Resolve on SIGINT or SIGTERM and broadcast shutdown to background tasks.
pub async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
