//! Agent main loop.
//!
//! Registers with the plane, heartbeats on the interval the Register
//! response dictates, acts on piggy-backed commands, and serves the
//! plane's RPCs on the local mTLS listener. Connection loss is retried
//! with doubling backoff; the supervisor handles process-level restarts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::agent::deploy::DeployRunner;
use crate::application::agent::log_hub::DeployLogHub;
use crate::application::agent::rpc::AgentRpcHandler;
use crate::application::agent::update::SelfUpdater;
use crate::domain::error::ControlError;
use crate::domain::models::{AgentCommand, AgentCommandKind, ServerId};
use crate::infrastructure::control::connection::{serve_connection, RpcClient};
use crate::infrastructure::control::protocol::{Request, Response};
use crate::infrastructure::control::tls::{self, TlsMaterial};
use crate::infrastructure::pki::PLANE_ROLE;
use crate::services::Executor;

const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_CAP: Duration = Duration::from_secs(60);
const RPC_TIMEOUT: Duration = Duration::from_secs(30);
/// SNI/SAN name the plane's listener leaf carries.
pub const PLANE_SERVER_NAME: &str = "caravel-plane";

/// Why the runtime stopped; the binary maps this to its exit behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit cleanly and let the supervisor relaunch (restart or update).
    Restart,
    /// Exit and stay down.
    Shutdown,
}

/// Agent invocation parameters, straight from the CLI flags the
/// supervisor unit passes.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub server_addr: String,
    pub server_id: ServerId,
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub agent_port: u16,
    pub version: String,
}

/// The long-lived agent process.
pub struct AgentRuntime {
    settings: AgentSettings,
    material: TlsMaterial,
}

impl AgentRuntime {
    /// Load certificate material; missing or unreadable files are fatal at
    /// startup.
    pub async fn new(settings: AgentSettings) -> Result<Self> {
        let cert_pem = tokio::fs::read_to_string(&settings.cert)
            .await
            .with_context(|| format!("reading {}", settings.cert.display()))?;
        let key_pem = tokio::fs::read_to_string(&settings.key)
            .await
            .with_context(|| format!("reading {}", settings.key.display()))?;
        let ca_pem = tokio::fs::read_to_string(&settings.ca_cert)
            .await
            .with_context(|| format!("reading {}", settings.ca_cert.display()))?;
        Ok(Self {
            settings,
            material: TlsMaterial { cert_pem, key_pem, ca_pem },
        })
    }

    /// Run until the plane tells us to restart or shut down.
    pub async fn run(self) -> Result<ExitReason> {
        let shutdown = CancellationToken::new();
        let (exit_tx, mut exit_rx) = mpsc::channel::<ExitReason>(4);

        let live_path = std::env::current_exe().context("resolving current executable")?;
        let install_dir = live_path
            .parent()
            .and_then(|bin| bin.parent())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let updater = Arc::new(SelfUpdater::new(live_path));
        let log_hub = Arc::new(DeployLogHub::new());
        let runner = Arc::new(DeployRunner::new(install_dir.join("work")));
        let handler = Arc::new(AgentRpcHandler {
            exec: Executor::new(),
            runner,
            log_hub,
            updater: Arc::clone(&updater),
            domains_path: install_dir.join("domains.json"),
            exit_tx: exit_tx.clone(),
        });

        // Local listener for plane-initiated RPCs.
        let listener = TcpListener::bind(("0.0.0.0", self.settings.agent_port))
            .await
            .with_context(|| format!("binding agent port {}", self.settings.agent_port))?;
        let server_tls = tls::server_config(&self.material)
            .context("building agent listener TLS config")?;
        tokio::spawn(agent_listener(listener, server_tls, Arc::clone(&handler), shutdown.clone()));

        // Plane-facing control loop.
        tokio::spawn(control_loop(
            self.settings.clone(),
            self.material.clone(),
            updater,
            exit_tx,
            shutdown.clone(),
        ));

        let reason = exit_rx.recv().await.unwrap_or(ExitReason::Shutdown);
        info!(?reason, "agent runtime stopping");
        shutdown.cancel();
        Ok(reason)
    }
}

/// Accept loop for the agent's mTLS listener. Only control-plane leaves
/// get past the connection gate; the handler re-checks per RPC.
async fn agent_listener(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    handler: Arc<AgentRpcHandler>,
    shutdown: CancellationToken,
) {
    let acceptor = TlsAcceptor::from(tls_config);
    info!(addr = ?listener.local_addr().ok(), "agent listener up");
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = shutdown.cancelled() => break,
        };
        let Ok((tcp, addr)) = accepted else { continue };
        tcp.set_nodelay(true).ok();
        let acceptor = acceptor.clone();
        let handler = Arc::clone(&handler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%addr, error = %e, "agent listener auth rejection (handshake)");
                    return;
                }
            };
            let peer = match tls::peer_identity_from_conn(tls_stream.get_ref().1) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(%addr, error = %e, "agent listener auth rejection (identity)");
                    return;
                }
            };
            if !peer.has_role(PLANE_ROLE) {
                warn!(%addr, peer = %peer.common_name, "agent listener auth rejection (role)");
                return;
            }
            let _ = serve_connection(tls_stream, peer, handler, shutdown).await;
        });
    }
}

/// Register + heartbeat loop with reconnect backoff.
async fn control_loop(
    settings: AgentSettings,
    material: TlsMaterial,
    updater: Arc<SelfUpdater>,
    exit_tx: mpsc::Sender<ExitReason>,
    shutdown: CancellationToken,
) {
    let client_config = match tls::client_config(&material) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "cannot build plane client TLS config");
            let _ = exit_tx.send(ExitReason::Shutdown).await;
            return;
        }
    };
    let server_name = match tls::server_name(PLANE_SERVER_NAME) {
        Ok(name) => name,
        Err(e) => {
            warn!(error = %e, "bad plane server name");
            let _ = exit_tx.send(ExitReason::Shutdown).await;
            return;
        }
    };

    let mut backoff = RECONNECT_INITIAL;
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let session = connect_and_register(
            &settings,
            Arc::clone(&client_config),
            server_name.clone(),
        )
        .await;
        let (client, interval) = match session {
            Ok(session) => {
                backoff = RECONNECT_INITIAL;
                session
            }
            Err(e) => {
                warn!(error = %e, "register failed, retrying in {}s", backoff.as_secs());
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    () = shutdown.cancelled() => return,
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
                continue;
            }
        };

        info!(interval_secs = interval.as_secs(), "registered with plane");
        // Heartbeat until the connection or the plane goes away.
        'heartbeat: loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = shutdown.cancelled() => return,
            }
            let response = client
                .call(
                    Request::Heartbeat { agent_version: settings.version.clone() },
                    RPC_TIMEOUT,
                )
                .await;
            let commands = match response {
                Ok(Response::HeartbeatAck { commands }) => commands,
                Ok(other) => {
                    warn!(?other, "unexpected heartbeat reply");
                    break 'heartbeat;
                }
                Err(e) => {
                    warn!(error = %e, "heartbeat failed, reconnecting");
                    break 'heartbeat;
                }
            };

            for wire in commands {
                let Some(command) = wire.decode() else {
                    // Newer planes may send commands we do not know yet.
                    warn!(command = %wire.command, "ignoring unknown agent command");
                    continue;
                };
                if dispatch_command(command, &updater, &exit_tx).await {
                    return;
                }
            }
        }
        client.close();
    }
}

async fn connect_and_register(
    settings: &AgentSettings,
    config: Arc<rustls::ClientConfig>,
    name: rustls::pki_types::ServerName<'static>,
) -> Result<(RpcClient, Duration), ControlError> {
    let (client, _peer) = RpcClient::connect_tls(&settings.server_addr, config, name).await?;
    match client
        .call(
            Request::Register { agent_version: settings.version.clone() },
            RPC_TIMEOUT,
        )
        .await?
    {
        Response::Registered { accepted: true, heartbeat_interval_secs } => {
            Ok((client, Duration::from_secs(heartbeat_interval_secs.max(1))))
        }
        Response::Registered { accepted: false, .. } => {
            Err(ControlError::Unauthenticated("plane rejected registration".to_string()))
        }
        other => Err(ControlError::Remote(format!("unexpected register reply: {other:?}"))),
    }
}

/// Act on one decoded command. Returns true when the control loop should
/// stop because the process is about to exit.
async fn dispatch_command(
    command: AgentCommand,
    updater: &SelfUpdater,
    exit_tx: &mpsc::Sender<ExitReason>,
) -> bool {
    match command.kind {
        AgentCommandKind::UpdateAgent => {
            info!("update command received");
            match updater.download_and_stage(&command.payload).await {
                Ok(bytes) => {
                    info!(bytes, "update downloaded and staged, restarting");
                    let _ = exit_tx.send(ExitReason::Restart).await;
                    true
                }
                Err(e) => {
                    // The old binary keeps serving; the plane observes the
                    // unchanged version on subsequent heartbeats.
                    warn!(error = %e, "agent update failed, keeping current binary");
                    false
                }
            }
        }
        AgentCommandKind::Restart => {
            info!("restart command received");
            let _ = exit_tx.send(ExitReason::Restart).await;
            true
        }
        AgentCommandKind::Shutdown => {
            info!("shutdown command received");
            let _ = exit_tx.send(ExitReason::Shutdown).await;
            true
        }
        AgentCommandKind::ReloadConfig => {
            // Agent configuration is its CLI flags; a relaunch would be a
            // Restart. Nothing to reload in place yet.
            debug!("reload-config command received");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_restart_signals_exit() {
        let (tx, mut rx) = mpsc::channel(1);
        let updater = SelfUpdater::new(PathBuf::from("/nonexistent"));
        let stop = dispatch_command(AgentCommand::new(AgentCommandKind::Restart), &updater, &tx).await;
        assert!(stop);
        assert_eq!(rx.recv().await, Some(ExitReason::Restart));
    }

    #[tokio::test]
    async fn test_dispatch_failed_update_keeps_running() {
        let (tx, mut rx) = mpsc::channel(1);
        let updater = SelfUpdater::new(PathBuf::from("/nonexistent/agent"));
        let stop = dispatch_command(
            AgentCommand::with_payload(AgentCommandKind::UpdateAgent, "http://127.0.0.1:1/nope"),
            &updater,
            &tx,
        )
        .await;
        assert!(!stop);
        assert!(rx.try_recv().is_err());
    }
}
