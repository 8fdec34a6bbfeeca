//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Zero-trust VPN control plane and node agent
#[derive(Parser, Debug)]
#[command(name = "vpn-control-plane")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "VPNCP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "VPNCP_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "VPNCP_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the control plane server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "VPNCP_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "VPNCP_HOST")]
        host: Option<String>,
    },

    /// Run the node agent (heartbeat reconciler)
    Agent {
        /// Control plane base URL
        #[arg(long, env = "VPNCP_AGENT_URL")]
        url: Option<String>,

        /// Node token
        #[arg(long, env = "VPNCP_NODE_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Directory for the provisioning bundle and local state
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Run a single reconcile pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Certificate authority utilities
    #[command(subcommand)]
    Ca(CaCommand),
}

/// CA subcommands
#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Generate an offline CA certificate and key for `pki.import_dir`
    Init {
        /// Output directory
        #[arg(short, long, default_value = "pki")]
        out_dir: PathBuf,

        /// Common Name of the CA
        #[arg(long, default_value = "VPN Control Plane CA")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        validity_days: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["vpn-control-plane"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_agent_once() {
        let cli = Cli::try_parse_from([
            "vpn-control-plane",
            "agent",
            "--url",
            "https://cp.example.com",
            "--token",
            "t",
            "--once",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Agent { url, once, .. }) => {
                assert_eq!(url.as_deref(), Some("https://cp.example.com"));
                assert!(once);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_ca_init() {
        let cli = Cli::try_parse_from([
            "vpn-control-plane",
            "ca",
            "init",
            "--out-dir",
            "/tmp/pki",
            "--validity-days",
            "30",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Ca(CaCommand::Init { validity_days: 30, .. }))
        ));
    }
}
