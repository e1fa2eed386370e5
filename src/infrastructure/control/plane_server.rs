//! Plane-side control listener: Register and Heartbeat.
//!
//! Every accepted connection must present a leaf that chains to the private
//! CA (enforced by rustls) and whose OU is the agent role; the leaf CN is
//! the authoritative server id. A peer failing either check is rejected
//! before any handler runs and never touches the agent hub.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::models::{config::ControlConfig, Event, ServerId, ServerStatus, StepStatus};
use crate::domain::ports::ServerRepository;
use crate::infrastructure::control::connection::{serve_connection, RpcContext, RpcHandler};
use crate::infrastructure::control::protocol::{
    Request, Response, WireCommand, WireError,
};
use crate::infrastructure::control::tls;
use crate::infrastructure::pki::{PeerIdentity, AGENT_ROLE};
use crate::services::{AgentHub, CommandQueue, EventFabric};

/// Plane-side control channel server.
pub struct PlaneControlServer {
    config: ControlConfig,
    tls_config: Arc<rustls::ServerConfig>,
    hub: Arc<AgentHub>,
    queue: Arc<CommandQueue>,
    servers: Arc<dyn ServerRepository>,
    fabric: Arc<EventFabric>,
}

impl PlaneControlServer {
    pub fn new(
        config: ControlConfig,
        tls_material: &tls::TlsMaterial,
        hub: Arc<AgentHub>,
        queue: Arc<CommandQueue>,
        servers: Arc<dyn ServerRepository>,
        fabric: Arc<EventFabric>,
    ) -> Result<Self, crate::domain::error::ControlError> {
        Ok(Self {
            tls_config: tls::server_config(tls_material)?,
            config,
            hub,
            queue,
            servers,
            fabric,
        })
    }

    /// Accept loop. Runs until `shutdown` fires.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        let acceptor = TlsAcceptor::from(Arc::clone(&self.tls_config));
        info!(addr = ?listener.local_addr().ok(), "control channel listening");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = shutdown.cancelled() => break,
            };
            let Ok((tcp, addr)) = accepted else { continue };
            tcp.set_nodelay(true).ok();

            let acceptor = acceptor.clone();
            let server = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(tcp).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        // Foreign CA, expired leaf, no client cert: the
                        // handshake itself fails and nothing else runs.
                        warn!(%addr, error = %e, "control channel auth rejection (handshake)");
                        return;
                    }
                };
                let peer = match tls::peer_identity_from_conn(tls_stream.get_ref().1) {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!(%addr, error = %e, "control channel auth rejection (identity)");
                        return;
                    }
                };
                if let Err(e) = authorize_agent(&peer) {
                    warn!(%addr, peer = %peer.common_name, error = %e, "control channel auth rejection (role)");
                    return;
                }
                debug!(%addr, server_id = %peer.common_name, "agent connected");
                let handler = Arc::new(PlaneRpcHandler { server: Arc::clone(&server) });
                if let Err(e) = serve_connection(tls_stream, peer, handler, shutdown).await {
                    debug!(%addr, error = %e, "agent connection ended with error");
                }
            });
        }
        info!("control channel listener stopped");
    }

    async fn handle_register(&self, server_id: ServerId, agent_version: &str) -> Result<Response, WireError> {
        self.hub.touch(server_id);
        let now = chrono::Utc::now();
        if let Err(e) = self.servers.touch_heartbeat(server_id, now).await {
            warn!(server_id = %server_id, error = %e, "failed to persist heartbeat");
        }

        // Version reconciliation: a changed version after an update command
        // is the completion signal for the update pipeline.
        match self.servers.get(server_id).await {
            Ok(Some(row)) => {
                let previous = row.agent_version.clone();
                if previous.as_deref() != Some(agent_version) {
                    if let Err(e) = self.servers.set_agent_version(server_id, agent_version).await {
                        warn!(server_id = %server_id, error = %e, "failed to persist agent version");
                    }
                    if previous.is_some() {
                        self.fabric.publish(&Event::agent_update_step(
                            server_id,
                            "updated",
                            StepStatus::Ok,
                            agent_version,
                        ));
                    }
                }
            }
            Ok(None) => {
                warn!(server_id = %server_id, "register from unknown server");
                return Err(WireError::unauthenticated("unknown server id"));
            }
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "failed to load server row");
            }
        }

        info!(server_id = %server_id, agent_version, "agent registered");
        Ok(Response::Registered {
            accepted: true,
            heartbeat_interval_secs: self.config.heartbeat_interval_secs,
        })
    }

    async fn handle_heartbeat(&self, server_id: ServerId, agent_version: &str) -> Result<Response, WireError> {
        self.hub.touch(server_id);
        let now = chrono::Utc::now();
        if let Err(e) = self.servers.touch_heartbeat(server_id, now).await {
            warn!(server_id = %server_id, error = %e, "failed to persist heartbeat");
        }
        // Reconcile version changes seen on heartbeat the same way Register
        // does; an agent may have been relaunched between heartbeats.
        if let Ok(Some(row)) = self.servers.get(server_id).await {
            let previous = row.agent_version.clone();
            if previous.as_deref() != Some(agent_version) {
                let _ = self.servers.set_agent_version(server_id, agent_version).await;
                if previous.is_some() {
                    self.fabric.publish(&Event::agent_update_step(
                        server_id,
                        "updated",
                        StepStatus::Ok,
                        agent_version,
                    ));
                }
            }
        }

        let commands = self.queue.drain(server_id);
        if !commands.is_empty() {
            debug!(server_id = %server_id, count = commands.len(), "piggy-backing commands on heartbeat");
        }
        Ok(Response::HeartbeatAck {
            commands: commands.iter().map(WireCommand::from).collect(),
        })
    }
}

/// The per-RPC authorization rule: validated chain (already enforced by the
/// handshake), OU equal to the agent role, non-empty CN parseable as a
/// server id.
fn authorize_agent(peer: &PeerIdentity) -> Result<ServerId, WireError> {
    if !peer.has_role(AGENT_ROLE) {
        return Err(WireError::unauthenticated(format!(
            "peer OU {:?} is not the agent role",
            peer.organizational_unit
        )));
    }
    if peer.common_name.is_empty() {
        return Err(WireError::unauthenticated("peer CN is empty"));
    }
    ServerId::from_str(&peer.common_name)
        .map_err(|_| WireError::unauthenticated("peer CN is not a server id"))
}

struct PlaneRpcHandler {
    server: Arc<PlaneControlServer>,
}

#[async_trait]
impl RpcHandler for PlaneRpcHandler {
    async fn handle(
        &self,
        peer: &PeerIdentity,
        request: Request,
        _ctx: RpcContext,
    ) -> Result<Response, WireError> {
        // Interceptor: runs before every handler, including streams.
        let server_id = authorize_agent(peer)?;

        match request {
            Request::Register { agent_version } => {
                self.server.handle_register(server_id, &agent_version).await
            }
            Request::Heartbeat { agent_version } => {
                self.server.handle_heartbeat(server_id, &agent_version).await
            }
            other => Err(WireError::new(
                super::protocol::ErrorCode::InvalidArgument,
                format!("operation {} is not served by the plane", other.op_name()),
            )),
        }
    }
}

/// Background sweep flipping servers to offline once their heartbeat falls
/// outside the liveness window.
pub async fn liveness_sweep(
    hub: Arc<AgentHub>,
    servers: Arc<dyn ServerRepository>,
    window: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(window / 3);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = shutdown.cancelled() => break,
        }
        let rows = match servers.list().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "liveness sweep failed to list servers");
                continue;
            }
        };
        for row in rows {
            if row.status == ServerStatus::Online && !hub.is_online(row.id) {
                info!(server_id = %row.id, "server missed its liveness window, marking offline");
                if let Err(e) = servers.set_status(row.id, ServerStatus::Offline).await {
                    warn!(server_id = %row.id, error = %e, "failed to mark server offline");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorize_rejects_wrong_role() {
        let peer = PeerIdentity {
            common_name: ServerId::new().to_string(),
            organizational_unit: Some("intruder".to_string()),
        };
        assert!(authorize_agent(&peer).is_err());
    }

    #[test]
    fn test_authorize_rejects_missing_ou() {
        let peer = PeerIdentity {
            common_name: ServerId::new().to_string(),
            organizational_unit: None,
        };
        assert!(authorize_agent(&peer).is_err());
    }

    #[test]
    fn test_authorize_rejects_non_uuid_cn() {
        let peer = PeerIdentity {
            common_name: "bob".to_string(),
            organizational_unit: Some(AGENT_ROLE.to_string()),
        };
        assert!(authorize_agent(&peer).is_err());
    }

    #[test]
    fn test_authorize_accepts_agent_leaf_identity() {
        let id = ServerId::new();
        let peer = PeerIdentity {
            common_name: id.to_string(),
            organizational_unit: Some(AGENT_ROLE.to_string()),
        };
        assert_eq!(authorize_agent(&peer).unwrap(), id);
    }
}
