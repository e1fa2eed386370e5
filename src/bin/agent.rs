//! Caravel agent entry point, invoked by the supervisor unit.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use caravel::application::agent::{AgentRuntime, AgentSettings, ExitReason};
use caravel::domain::models::ServerId;

#[derive(Parser)]
#[command(name = "caravel-agent", about = "Caravel host agent")]
struct Cli {
    /// Control plane address, host:port.
    #[arg(long)]
    server_addr: String,

    /// This server's id; must match the certificate CN.
    #[arg(long)]
    server_id: ServerId,

    /// CA root certificate path.
    #[arg(long)]
    ca_cert: PathBuf,

    /// Agent leaf certificate path.
    #[arg(long)]
    cert: PathBuf,

    /// Agent leaf private key path.
    #[arg(long)]
    key: PathBuf,

    /// Port to serve plane-initiated RPCs on.
    #[arg(long, default_value_t = 50052)]
    agent_port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = AgentSettings {
        server_addr: cli.server_addr,
        server_id: cli.server_id,
        ca_cert: cli.ca_cert,
        cert: cli.cert,
        key: cli.key,
        agent_port: cli.agent_port,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let runtime = match AgentRuntime::new(settings).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "agent initialisation failed");
            return ExitCode::from(1);
        }
    };

    match runtime.run().await {
        Ok(ExitReason::Restart) => {
            // Clean exit; the supervisor relaunches us (possibly as the
            // freshly staged binary).
            info!("exiting for relaunch");
            ExitCode::SUCCESS
        }
        Ok(ExitReason::Shutdown) => {
            // The unit is Restart=always, so ask the supervisor to stop the
            // service instead of merely exiting.
            let _ = std::process::Command::new("sh")
                .args(["-c", "sleep 1; systemctl --user stop caravel-agent"])
                .spawn();
            info!("shutting down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "agent runtime failed");
            ExitCode::from(1)
        }
    }
}
