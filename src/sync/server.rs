//! Control-plane half of node synchronisation.

use std::sync::Arc;

use chrono::Utc;
use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::access::AccessResolver;
use crate::audit::{self, AuditEvent};
use crate::config_version;
use crate::enforcement::DenialReason;
use crate::issuer::CertificateIssuer;
use crate::model::{HeartbeatReport, Node, NodeSettings};
use crate::pki::CertificateAuthority;
use crate::store::Stores;
use crate::{Error, Result};

use super::{HeartbeatRequest, HeartbeatResponse, ProvisionBundle, RulesVersionResponse};

/// Crypto profiles a node may be configured with.
pub const CRYPTO_PROFILES: &[&str] = &["modern", "compatible", "fips"];

/// Serves heartbeats, provisioning bundles and rule-set versions to nodes.
#[derive(Debug, Clone)]
pub struct NodeSync {
    stores: Stores,
    ca: Arc<CertificateAuthority>,
    issuer: CertificateIssuer,
    resolver: AccessResolver,
}

impl NodeSync {
    /// Wire the node sync service.
    #[must_use]
    pub fn new(stores: Stores, ca: Arc<CertificateAuthority>, issuer: CertificateIssuer) -> Self {
        Self {
            resolver: AccessResolver::new(stores.clone()),
            stores,
            ca,
            issuer,
        }
    }

    async fn authenticate(&self, token: &str) -> Result<Node> {
        self.stores
            .call("nodes.find_by_token", self.stores.nodes.find_by_token(token))
            .await?
            .ok_or_else(|| Error::from(DenialReason::NodeAuthenticationFailed))
    }

    /// Record a heartbeat and tell the node whether it drifted.
    ///
    /// # Errors
    ///
    /// [`Error::AuthenticationFailure`] for an unknown token; store failures.
    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let node = self.authenticate(&req.token).await?;
        let report = HeartbeatReport {
            public_ip: req.public_ip.clone(),
            active_clients: req.active_clients,
            service_running: req.openvpn_running,
            config_version: req.config_version.clone(),
            ca_fingerprint: req.ca_fingerprint.clone(),
            received_at: Utc::now(),
        };
        let node = self
            .stores
            .call("nodes.record_heartbeat", self.stores.nodes.record_heartbeat(&node.id, report))
            .await?;

        let authoritative = config_version::version(&node.settings);
        let needs_reprovision = config_version::needs_reprovision(&req.config_version, &authoritative);
        if needs_reprovision {
            info!(
                node_id = %node.id,
                reported = %req.config_version,
                authoritative = %authoritative,
                "Node config drifted"
            );
        } else {
            debug!(node_id = %node.id, clients = req.active_clients, "Heartbeat");
        }

        Ok(HeartbeatResponse {
            status: "ok".to_string(),
            config_version: authoritative,
            needs_reprovision,
            ca_fingerprint: self.ca.active_fingerprint(),
        })
    }

    /// Build a provisioning bundle, minting a fresh server certificate.
    ///
    /// # Errors
    ///
    /// [`Error::AuthenticationFailure`] for an unknown token,
    /// [`Error::MalformedSetting`] when the stored subnet does not parse,
    /// [`Error::NoActiveCa`]; store failures.
    pub async fn provision(&self, token: &str) -> Result<ProvisionBundle> {
        let node = self.authenticate(token).await?;
        let settings = &node.settings;
        let subnet = parse_subnet(&settings.subnet)?;

        let certificate = self.issuer.issue_node_certificate(&node).await?;
        let fingerprint = self.ca.active_fingerprint().unwrap_or_default();
        info!(node_id = %node.id, serial = %certificate.serial, "Provisioned node");
        audit::emit(&AuditEvent::node_reprovisioned(&node.id, &certificate.serial, &fingerprint));

        Ok(ProvisionBundle {
            ca_cert: self.ca.trust_bundle_pem(),
            server_cert: certificate.cert_pem,
            server_key: certificate.key_pem,
            vpn_subnet: subnet.to_string(),
            vpn_network: subnet.network().to_string(),
            vpn_netmask: subnet.netmask().to_string(),
            vpn_port: settings.port,
            vpn_protocol: settings.protocol.as_str().to_string(),
            crypto_profile: settings.crypto_profile.clone(),
            tls_auth_enabled: settings.tls_auth_enabled,
            tls_auth_key: settings.tls_auth_key.clone().filter(|_| settings.tls_auth_enabled),
        })
    }

    /// Content hash of the node's effective rule set.
    ///
    /// # Errors
    ///
    /// [`Error::AuthenticationFailure`] for an unknown token; store failures.
    pub async fn rules_version(&self, token: &str) -> Result<RulesVersionResponse> {
        let node = self.authenticate(token).await?;
        Ok(RulesVersionResponse {
            rules_version: self.resolver.node_rules_version(&node).await?,
        })
    }

    /// Replace a node's tunnel settings after validating them. The node
    /// picks the change up at its next heartbeat.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedSetting`] for invalid settings, [`Error::NotFound`]
    /// for an unknown node; store failures.
    pub async fn update_settings(&self, node_id: &str, settings: NodeSettings) -> Result<Node> {
        validate_settings(&settings)?;
        let node = self
            .stores
            .call(
                "nodes.update_settings",
                self.stores.nodes.update_settings(node_id, settings),
            )
            .await?;
        info!(
            node_id = %node.id,
            config_version = %config_version::version(&node.settings),
            "Updated node settings"
        );
        Ok(node)
    }
}

fn parse_subnet(subnet: &str) -> Result<Ipv4Net> {
    subnet
        .parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|e| Error::MalformedSetting(format!("subnet '{subnet}': {e}")))
}

/// Reject settings a node could not apply.
///
/// # Errors
///
/// [`Error::MalformedSetting`] naming the offending field.
pub fn validate_settings(settings: &NodeSettings) -> Result<()> {
    parse_subnet(&settings.subnet)?;
    if settings.port == 0 {
        return Err(Error::MalformedSetting("port must be non-zero".into()));
    }
    if !CRYPTO_PROFILES.contains(&settings.crypto_profile.as_str()) {
        return Err(Error::MalformedSetting(format!(
            "unknown crypto profile '{}'",
            settings.crypto_profile
        )));
    }
    if settings.tls_auth_enabled && settings.tls_auth_key.as_deref().is_none_or(str::is_empty) {
        return Err(Error::MalformedSetting("tls_auth_enabled without a key".into()));
    }
    for dns in &settings.dns_servers {
        dns.parse::<std::net::IpAddr>()
            .map_err(|_| Error::MalformedSetting(format!("dns server '{dns}'")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnforcementConfig, PkiConfig};
    use crate::model::{Assignee, NodeRole};
    use crate::pki::CertIdentity;
    use crate::pki::pem_to_der;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    fn node() -> Node {
        Node {
            id: "gw-1".into(),
            name: "gw-1.example.com".into(),
            role: NodeRole::Gateway,
            token: "gw-1-token".into(),
            endpoint: "gw-1.example.com".into(),
            settings: NodeSettings::default(),
            networks: Vec::new(),
            assignments: vec![Assignee::Group("eng".into())],
            reported_config_version: String::new(),
            last_ca_fingerprint: None,
            last_heartbeat: None,
            public_ip: None,
            active_clients: 0,
            service_running: false,
        }
    }

    async fn sync() -> (Arc<InMemoryStore>, Arc<CertificateAuthority>, NodeSync) {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_node(node());
        let stores = Stores::in_memory(&store, Duration::from_secs(5));
        let pki = PkiConfig::default();
        let ca = Arc::new(
            CertificateAuthority::bootstrap(stores.pki.clone(), pki.clone(), stores.timeout)
                .await
                .unwrap(),
        );
        let issuer =
            CertificateIssuer::new(ca.clone(), stores.clone(), &EnforcementConfig::default(), &pki);
        (store, ca.clone(), NodeSync::new(stores, ca, issuer))
    }

    fn heartbeat(version: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            token: "gw-1-token".into(),
            public_ip: Some("198.51.100.4".into()),
            active_clients: 3,
            openvpn_running: true,
            config_version: version.into(),
            ca_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn empty_reported_version_needs_reprovision() {
        let (_, ca, sync) = sync().await;

        let resp = sync.heartbeat(&heartbeat("")).await.unwrap();

        assert_eq!(resp.status, "ok");
        assert!(resp.needs_reprovision);
        assert_eq!(resp.config_version, config_version::version(&NodeSettings::default()));
        assert_eq!(resp.ca_fingerprint, ca.active_fingerprint());
    }

    #[tokio::test]
    async fn matching_version_is_in_sync_and_recorded() {
        // GIVEN: a node reporting the authoritative version
        let (store, _, sync) = sync().await;
        let current = config_version::version(&NodeSettings::default());

        // WHEN: it heartbeats
        let resp = sync.heartbeat(&heartbeat(&current)).await.unwrap();

        // THEN: no reprovision, and the report is stored
        assert!(!resp.needs_reprovision);
        use crate::store::NodeStore;
        let n = NodeStore::find_by_id(store.as_ref(), "gw-1").await.unwrap().unwrap();
        assert_eq!(n.reported_config_version, current);
        assert_eq!(n.active_clients, 3);
        assert!(n.service_running);
        assert!(n.is_active(Utc::now(), Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn settings_change_flips_needs_reprovision() {
        let (_, _, sync) = sync().await;
        let before = sync.heartbeat(&heartbeat("")).await.unwrap().config_version;

        let settings = NodeSettings {
            port: 443,
            ..NodeSettings::default()
        };
        sync.update_settings("gw-1", settings).await.unwrap();

        let resp = sync.heartbeat(&heartbeat(&before)).await.unwrap();
        assert!(resp.needs_reprovision);
        assert_ne!(resp.config_version, before);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (_, _, sync) = sync().await;
        let mut req = heartbeat("");
        req.token = "nope".into();
        assert!(matches!(
            sync.heartbeat(&req).await.unwrap_err(),
            Error::AuthenticationFailure(_)
        ));
    }

    #[tokio::test]
    async fn provision_bundle_splits_subnet_and_signs_server_cert() {
        let (_, ca, sync) = sync().await;

        let bundle = sync.provision("gw-1-token").await.unwrap();

        assert_eq!(bundle.vpn_subnet, "10.8.0.0/24");
        assert_eq!(bundle.vpn_network, "10.8.0.0");
        assert_eq!(bundle.vpn_netmask, "255.255.255.0");
        assert_eq!(bundle.vpn_port, 1194);
        assert_eq!(bundle.vpn_protocol, "udp");
        assert_eq!(bundle.ca_cert, ca.trust_bundle_pem());
        let der = pem_to_der(&bundle.server_cert).unwrap();
        let identity = CertIdentity::from_der(&der).unwrap();
        assert_eq!(identity.common_name.as_deref(), Some("gw-1.example.com"));
        assert!(ca.verify_certificate(&der, Utc::now()).is_ok());
    }

    #[test]
    fn malformed_settings_are_rejected() {
        let bad_subnet = NodeSettings {
            subnet: "10.8.0.0/33".into(),
            ..NodeSettings::default()
        };
        let bad_profile = NodeSettings {
            crypto_profile: "rot13".into(),
            ..NodeSettings::default()
        };
        let missing_key = NodeSettings {
            tls_auth_enabled: true,
            ..NodeSettings::default()
        };
        for s in [bad_subnet, bad_profile, missing_key] {
            assert!(matches!(validate_settings(&s), Err(Error::MalformedSetting(_))));
        }
        assert!(validate_settings(&NodeSettings::default()).is_ok());
    }
}
