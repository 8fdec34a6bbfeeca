//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Certificate authority configuration
    pub pki: PkiConfig,
    /// Per-connection enforcement configuration
    pub enforcement: EnforcementConfig,
    /// Node fleet configuration
    pub nodes: NodesConfig,
    /// Collaborator store configuration
    pub storage: StorageConfig,
    /// Remote node agent configuration (used by `agent` mode)
    pub agent: AgentConfig,
    /// Optional inventory file seeding the in-memory stores
    pub inventory: Option<PathBuf>,
}

impl Config {
    /// Load configuration: defaults, then the YAML file, then `VPNCP_`
    /// environment variables (`__` separates nested keys).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("VPNCP_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Reject combinations that would make the control plane unsafe to run.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.enforcement.default_validity.is_zero() {
            return Err(Error::Config(
                "enforcement.default_validity must be non-zero".to_string(),
            ));
        }
        if self.enforcement.default_validity > self.enforcement.max_validity {
            return Err(Error::Config(format!(
                "enforcement.default_validity ({}s) exceeds enforcement.max_validity ({}s)",
                self.enforcement.default_validity.as_secs(),
                self.enforcement.max_validity.as_secs()
            )));
        }
        if self.pki.ca_validity_days == 0 {
            return Err(Error::Config("pki.ca_validity_days must be non-zero".to_string()));
        }
        if self.storage.timeout.is_zero() {
            return Err(Error::Config("storage.timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secret-bearing fields
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("static regex is valid");

        if let Some(token) = self.server.admin_token.as_mut() {
            *token = Self::expand_string(&re, token);
        }
        self.agent.node_token = Self::expand_string(&re, &self.agent.node_token);
        self.agent.control_plane_url = Self::expand_string(&re, &self.agent.control_plane_url);
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures<'_>| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Bearer token guarding admin endpoints (CA rotation, revocation,
    /// config generation). Supports `env:VAR_NAME` and `${VAR}`.
    /// Admin endpoints answer 503 when unset.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8443,
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Resolve the admin token (`env:VAR_NAME` indirection)
    #[must_use]
    pub fn resolve_admin_token(&self) -> Option<String> {
        self.admin_token.as_ref().and_then(|token| {
            if let Some(var_name) = token.strip_prefix("env:") {
                env::var(var_name).ok()
            } else if token.is_empty() {
                None
            } else {
                Some(token.clone())
            }
        })
    }
}

/// Certificate authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    /// Common Name prefix for generated CAs; a creation date and short id
    /// are appended so rotated CAs are distinguishable.
    pub ca_common_name: String,
    /// Validity of each generated CA in days
    pub ca_validity_days: u32,
    /// Validity of node (server) certificates issued at provisioning
    #[serde(with = "humantime_serde")]
    pub server_cert_validity: Duration,
    /// Directory holding a `ca.crt` / `ca.key` pair written by `ca init`.
    /// Imported as the initial active CA when the store holds none.
    pub import_dir: Option<PathBuf>,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            ca_common_name: "VPN Control Plane CA".to_string(),
            ca_validity_days: 3650,
            server_cert_validity: Duration::from_secs(365 * 86_400),
            import_dir: None,
        }
    }
}

/// Per-connection enforcement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// Validity of generated client configs when the caller does not ask
    #[serde(with = "humantime_serde")]
    pub default_validity: Duration,
    /// Upper bound on requested validity
    #[serde(with = "humantime_serde")]
    pub max_validity: Duration,
    /// Lifetime of one-shot profile download links
    #[serde(with = "humantime_serde")]
    pub download_ttl: Duration,
    /// How often expired download links and credentials are purged
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            default_validity: Duration::from_secs(24 * 3600),
            max_validity: Duration::from_secs(7 * 24 * 3600),
            download_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Node fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    /// A node is active while its last heartbeat is younger than this
    #[serde(with = "humantime_serde")]
    pub activity_threshold: Duration,
    /// DNS servers pushed when a node enables DNS push without listing any
    pub default_dns_servers: Vec<String>,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            activity_threshold: Duration::from_secs(120),
            default_dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        }
    }
}

/// Collaborator store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Deadline applied to every store call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Remote node agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the control plane (e.g. `https://cp.example.com`)
    pub control_plane_url: String,
    /// Node token issued at registration
    pub node_token: String,
    /// Heartbeat period
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-request timeout for control plane calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Where the provisioning bundle and local state are written
    pub state_dir: PathBuf,
    /// Command run after a new bundle is written (e.g. `systemctl reload openvpn-server@server`)
    pub reload_command: Vec<String>,
    /// Command run when the node's rule set changes
    pub rules_command: Vec<String>,
    /// Command whose zero exit status means the tunnel service is running
    pub status_command: Vec<String>,
    /// OpenVPN status file (version 2) used to count connected clients
    pub status_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_plane_url: "http://127.0.0.1:8443".to_string(),
            node_token: String::new(),
            interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            state_dir: PathBuf::from("/var/lib/vpn-control-plane"),
            reload_command: Vec::new(),
            rules_command: Vec::new(),
            status_command: Vec::new(),
            status_file: None,
        }
    }
}

/// Human-readable duration serde helpers (`"100ms"`, `"30s"`, `"5m"`,
/// `"24h"`, `"7d"`, bare numbers are seconds)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a whole-second string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string.
    ///
    /// # Errors
    ///
    /// Returns the offending input when no unit/number combination matches.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |n: &str| n.trim().parse::<u64>().map_err(|e| format!("'{s}': {e}"));

        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            number(hours).map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            number(days).map(|d| Duration::from_secs(d * 86_400))
        } else {
            number(s).map(Duration::from_secs)
        }
    }
}
