//! Caravel control plane entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use caravel::api::{self, ApiState};
use caravel::application::agent_updater::AgentUpdater;
use caravel::application::deploy_engine::DeployEngine;
use caravel::application::gateway::PooledAgentGateway;
use caravel::application::provisioner::{Provisioner, ProvisionerSettings};
use caravel::domain::models::Config;
use caravel::infrastructure::config::ConfigLoader;
use caravel::infrastructure::control::{
    liveness_sweep, AgentClientPool, PlaneControlServer, TlsMaterial,
};
use caravel::infrastructure::database::{
    AppRepositoryImpl, DatabaseConnection, DeploymentRepositoryImpl, ServerRepositoryImpl,
};
use caravel::infrastructure::logging;
use caravel::infrastructure::pki::{CertificateAuthority, PLANE_ROLE};
use caravel::infrastructure::ssh::RusshConnector;
use caravel::services::{AgentHub, CommandQueue, EventFabric, Locker, TokenStore};

/// Lifetime of the plane's own control-channel leaf.
const PLANE_LEAF_LIFETIME: Duration = Duration::from_secs(365 * 86_400);

#[derive(Parser)]
#[command(name = "caravel", about = "Self-hosted PaaS control plane")]
struct Cli {
    /// Path to a config file; defaults to caravel.yaml + CARAVEL_* env.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane.
    Serve,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    logging::init(&config.logging);

    match cli.command {
        Commands::Migrate => {
            let db = connect_db(&config).await?;
            db.migrate().await.context("Failed to run database migrations")?;
            info!("migrations applied");
            Ok(())
        }
        Commands::Serve => serve(config).await,
    }
}

async fn connect_db(config: &Config) -> Result<DatabaseConnection> {
    let database_url = format!("sqlite:{}", config.database.path);
    DatabaseConnection::new(&database_url, config.database.max_connections)
        .await
        .context("Failed to connect to database")
}

async fn serve(config: Config) -> Result<()> {
    // Fatal-at-startup pieces first: database, CA material, lock table.
    let db = connect_db(&config).await?;
    db.migrate().await.context("Failed to run database migrations")?;

    let apps = Arc::new(AppRepositoryImpl::new(db.pool().clone()));
    let deployments = Arc::new(DeploymentRepositoryImpl::new(db.pool().clone()));
    let servers = Arc::new(ServerRepositoryImpl::new(db.pool().clone()));

    let ca = Arc::new(
        CertificateAuthority::open(config.pki_dir()).context("Failed to open certificate authority")?,
    );
    let plane_leaf = ca
        .issue_leaf("caravel-plane", PLANE_ROLE, PLANE_LEAF_LIFETIME)
        .context("Failed to issue plane leaf certificate")?;
    let tls_material = TlsMaterial {
        cert_pem: plane_leaf.cert_pem,
        key_pem: plane_leaf.key_pem,
        ca_pem: ca.root_pem().to_string(),
    };

    let locker = Arc::new(Locker::open(config.locks_dir()).context("Failed to open lock table")?);
    let fabric = Arc::new(EventFabric::new());
    let hub = Arc::new(AgentHub::new(Duration::from_secs(config.control.liveness_window_secs)));
    let queue = Arc::new(CommandQueue::new());
    let tokens = Arc::new(TokenStore::new(Duration::from_secs(config.update.token_ttl_secs)));
    let pool = Arc::new(
        AgentClientPool::new(&tls_material, Duration::from_secs(config.control.rpc_timeout_secs))
            .context("Failed to build agent client pool")?,
    );

    let shutdown = CancellationToken::new();

    // Deploy engine.
    let gateway = Arc::new(PooledAgentGateway::new(Arc::clone(&pool)));
    let engine = Arc::new(DeployEngine::new(
        config.deploy.clone(),
        config.health.clone(),
        config.control.agent_port,
        apps.clone(),
        deployments.clone(),
        servers.clone(),
        Arc::clone(&hub),
        Arc::clone(&locker),
        gateway,
        Arc::clone(&fabric),
    ));
    engine.start();

    // Control channel listener.
    let control_server = Arc::new(
        PlaneControlServer::new(
            config.control.clone(),
            &tls_material,
            Arc::clone(&hub),
            Arc::clone(&queue),
            servers.clone(),
            Arc::clone(&fabric),
        )
        .context("Failed to build control channel server")?,
    );
    let control_listener = TcpListener::bind((config.control.bind.as_str(), config.control.port))
        .await
        .with_context(|| format!("binding control port {}", config.control.port))?;
    tokio::spawn(Arc::clone(&control_server).run(control_listener, shutdown.clone()));

    // Liveness + token sweeps.
    tokio::spawn(liveness_sweep(
        Arc::clone(&hub),
        servers.clone(),
        Duration::from_secs(config.control.liveness_window_secs),
        shutdown.clone(),
    ));
    tokio::spawn(AgentUpdater::token_sweep_loop(Arc::clone(&tokens), shutdown.clone()));

    // Provisioner and updater are driven by the CRUD layer; constructing
    // them here wires their handles into the composition root.
    let _provisioner = Provisioner::new(
        Arc::new(RusshConnector::new()),
        Arc::clone(&ca),
        servers.clone(),
        Arc::clone(&fabric),
        ProvisionerSettings {
            agent_binary_path: config.update.agent_binary_path.clone(),
            plane_addr: format!("{}:{}", config.control.bind, config.control.port),
            agent_port: config.control.agent_port,
        },
    );
    let _updater = AgentUpdater::new(
        config.update.clone(),
        config.api.prefix.clone(),
        config.control.agent_port,
        Arc::clone(&queue),
        Arc::clone(&tokens),
        Arc::clone(&fabric),
        Arc::clone(&pool),
    );

    // HTTP surface: download endpoint + SSE event streams.
    let api_state = ApiState {
        tokens: Arc::clone(&tokens),
        fabric: Arc::clone(&fabric),
        agent_binary_path: config.update.agent_binary_path.clone(),
    };
    let api_router = api::router(&config.api.prefix, api_state);
    let api_listener = TcpListener::bind((config.api.bind.as_str(), config.api.port))
        .await
        .with_context(|| format!("binding api port {}", config.api.port))?;
    info!(
        control_port = config.control.port,
        api_port = config.api.port,
        workers = config.deploy.workers,
        "caravel control plane up"
    );

    tokio::select! {
        result = axum::serve(api_listener, api_router) => {
            result.context("HTTP surface failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    // Orderly teardown: stop intake, close streams, drop transports.
    shutdown.cancel();
    engine.stop();
    fabric.close();
    pool.close_all().await;
    Ok(())
}
