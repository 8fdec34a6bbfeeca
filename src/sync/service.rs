//! Command-driven [`ManagedService`]: reload, rule refresh and status are
//! external commands (typically `systemctl …` and a firewall script).

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::{Error, Result};

use super::agent::{ManagedService, ServiceStatus};

/// Environment variable carrying the bundle directory to the reload command.
pub const BUNDLE_DIR_ENV: &str = "VPNCP_BUNDLE_DIR";

/// Runs configured commands. An empty command is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CommandService {
    reload_command: Vec<String>,
    rules_command: Vec<String>,
    status_command: Vec<String>,
    status_file: Option<PathBuf>,
}

impl CommandService {
    /// Build from the agent section of the config.
    #[must_use]
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            reload_command: config.reload_command.clone(),
            rules_command: config.rules_command.clone(),
            status_command: config.status_command.clone(),
            status_file: config.status_file.clone(),
        }
    }
}

/// Run `argv`, failing on a non-zero exit.
async fn run(argv: &[String], bundle_dir: Option<&Path>) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = bundle_dir {
        cmd.env(BUNDLE_DIR_ENV, dir);
    }
    let output = cmd.output().await?;
    if output.status.success() {
        debug!(program = %program, "Command succeeded");
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Internal(format!(
            "`{}` exited with {}: {}",
            argv.join(" "),
            output.status,
            stderr.trim()
        )))
    }
}

/// Count connected clients in an OpenVPN status file (version 2 or 3).
#[must_use]
pub fn count_clients(status: &str) -> u32 {
    let count = status
        .lines()
        .filter(|l| l.starts_with("CLIENT_LIST,") || l.starts_with("CLIENT_LIST\t"))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[async_trait::async_trait]
impl ManagedService for CommandService {
    async fn status(&self) -> ServiceStatus {
        let running = if self.status_command.is_empty() {
            true
        } else {
            match run(&self.status_command, None).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "Service status command reports not running");
                    false
                }
            }
        };

        let active_clients = match &self.status_file {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => count_clients(&text),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read status file");
                    0
                }
            },
            None => 0,
        };

        ServiceStatus {
            running,
            active_clients,
        }
    }

    async fn reload(&self, dir: &Path) -> Result<()> {
        run(&self.reload_command, Some(dir)).await?;
        info!(dir = %dir.display(), "Tunnel service reloaded");
        Ok(())
    }

    async fn refresh_rules(&self) -> Result<()> {
        run(&self.rules_command, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_V2: &str = "TITLE,OpenVPN 2.6.8\n\
        TIME,2024-01-01 00:00:00,1704067200\n\
        HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address\n\
        CLIENT_LIST,alice@example.com,203.0.113.7:51820,10.8.0.2\n\
        CLIENT_LIST,bob@example.com,203.0.113.8:51820,10.8.0.3\n\
        HEADER,ROUTING_TABLE,Virtual Address,Common Name\n\
        ROUTING_TABLE,10.8.0.2,alice@example.com\n\
        END\n";

    #[test]
    fn counts_clients_ignoring_headers() {
        assert_eq!(count_clients(STATUS_V2), 2);
        assert_eq!(count_clients(""), 0);
    }

    #[tokio::test]
    async fn empty_commands_are_noops() {
        let svc = CommandService::default();
        svc.reload(Path::new("/tmp")).await.unwrap();
        svc.refresh_rules().await.unwrap();
        assert_eq!(
            svc.status().await,
            ServiceStatus {
                running: true,
                active_clients: 0
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_reported() {
        let svc = CommandService {
            reload_command: vec!["false".into()],
            status_command: vec!["false".into()],
            ..CommandService::default()
        };
        assert!(svc.reload(Path::new("/tmp")).await.is_err());
        assert!(!svc.status().await.running);
    }

    #[tokio::test]
    async fn status_file_feeds_client_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.log");
        std::fs::write(&path, STATUS_V2).unwrap();
        let svc = CommandService {
            status_file: Some(path),
            ..CommandService::default()
        };
        assert_eq!(svc.status().await.active_clients, 2);
    }
}
