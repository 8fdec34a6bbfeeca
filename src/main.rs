//! VPN Control Plane - certificate lifecycle, per-connection authorization
//! and fleet drift reconciliation.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use vpn_control_plane::{
    cli::{CaCommand, Cli, Command},
    config::Config,
    pki::{CaParams, CertGenerator},
    server::{ControlPlane, shutdown_signal},
    setup_tracing,
    sync::{CommandService, HeartbeatReconciler, HttpControlPlaneClient},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Ca(CaCommand::Init {
            out_dir,
            cn,
            validity_days,
        })) => run_ca_init(&out_dir, &cn, validity_days),
        Some(Command::Agent {
            url,
            token,
            state_dir,
            once,
        }) => run_agent(config, url, token, state_dir, once).await,
        Some(Command::Serve { port, host }) => run_server(config, port, host).await,
        None => run_server(config, None, None).await,
    }
}

/// Run the control plane server
async fn run_server(mut config: Config, port: Option<u16>, host: Option<String>) -> ExitCode {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        inventory = ?config.inventory,
        "Starting VPN control plane"
    );

    let control_plane = match ControlPlane::new(config).await {
        Ok(cp) => cp,
        Err(e) => {
            error!("Failed to start control plane: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = control_plane.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Run the node agent
async fn run_agent(
    mut config: Config,
    url: Option<String>,
    token: Option<String>,
    state_dir: Option<PathBuf>,
    once: bool,
) -> ExitCode {
    let agent_config = &mut config.agent;
    if let Some(url) = url {
        agent_config.control_plane_url = url;
    }
    if let Some(token) = token {
        agent_config.node_token = token;
    }
    if let Some(dir) = state_dir {
        agent_config.state_dir = dir;
    }
    if agent_config.node_token.is_empty() {
        error!("No node token configured (agent.node_token or --token)");
        return ExitCode::FAILURE;
    }

    let client = match HttpControlPlaneClient::new(
        &agent_config.control_plane_url,
        agent_config.request_timeout,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to create control plane client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let service = CommandService::from_config(agent_config);

    info!(
        url = %agent_config.control_plane_url,
        state_dir = %agent_config.state_dir.display(),
        interval = ?agent_config.interval,
        "Starting node agent"
    );

    let mut reconciler = HeartbeatReconciler::new(
        client,
        service,
        agent_config.node_token.clone(),
        agent_config.state_dir.clone(),
        agent_config.interval,
    )
    .await;

    if once {
        return match reconciler.tick().await {
            Ok(outcome) => {
                info!(?outcome, "Reconcile pass complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Reconcile pass failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(shutdown_signal(shutdown_tx));
    reconciler.run(shutdown_rx).await;
    ExitCode::SUCCESS
}

/// Generate an offline CA into `out_dir` for import at first bootstrap
fn run_ca_init(out_dir: &std::path::Path, cn: &str, validity_days: u32) -> ExitCode {
    let params = CaParams { cn, validity_days };
    let ca = match CertGenerator::init_ca(&params) {
        Ok(ca) => ca,
        Err(e) => {
            eprintln!("Failed to generate CA: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = CertGenerator::write_to_dir(&ca, out_dir, "ca") {
        eprintln!("Failed to write CA: {e}");
        return ExitCode::FAILURE;
    }

    println!("CA written to {}", out_dir.display());
    println!("  certificate: {}", out_dir.join("ca.crt").display());
    println!("  key:         {}", out_dir.join("ca.key").display());
    println!("  fingerprint: {}", ca.fingerprint());
    println!(
        "Serve with pki.import_dir (or VPNCP_PKI__IMPORT_DIR) set to {} to bootstrap from it",
        out_dir.display()
    );
    ExitCode::SUCCESS
}
