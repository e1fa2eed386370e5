//! Plane-to-agent connection pool.
//!
//! One multiplexed transport per (host, port); callers share it. The pool
//! redials transparently when a cached transport has died, and closes
//! everything on shutdown. TLS is 1.3-only and the expected peer name is
//! the target's server id, so a transport can never be confused across
//! servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::error::ControlError;
use crate::domain::models::{DeploymentId, ServerId};
use crate::infrastructure::control::connection::{RpcClient, RpcStream};
use crate::infrastructure::control::protocol::{DeploySpec, Request, Response, StreamItem};
use crate::infrastructure::control::tls::{self, TlsMaterial};

/// Result of an `ExecuteDeploy` RPC.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub image_tag: Option<String>,
    pub logs: String,
}

/// Result of a `PushUpdate` exchange.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub success: bool,
    pub message: String,
}

/// A pooled connection to one agent.
pub struct AgentClient {
    addr: String,
    rpc: RpcClient,
    rpc_timeout: Duration,
}

impl AgentClient {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    /// Generic unary call with the pool's default deadline.
    pub async fn unary(&self, request: Request) -> Result<Response, ControlError> {
        self.rpc.call(request, self.rpc_timeout).await
    }

    /// Unary call with an explicit deadline (deploys run long).
    pub async fn unary_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, ControlError> {
        self.rpc.call(request, timeout).await
    }

    pub async fn execute_deploy(
        &self,
        spec: DeploySpec,
        timeout: Duration,
    ) -> Result<DeployOutcome, ControlError> {
        match self.rpc.call(Request::ExecuteDeploy(spec), timeout).await? {
            Response::DeployResult { success, error, image_tag, logs } => {
                Ok(DeployOutcome { success, error, image_tag, logs })
            }
            other => Err(ControlError::Remote(format!(
                "unexpected reply to execute_deploy: {other:?}"
            ))),
        }
    }

    /// Open the live log stream for a deployment.
    pub async fn stream_deploy_logs(
        &self,
        deployment_id: DeploymentId,
    ) -> Result<RpcStream, ControlError> {
        self.rpc
            .open_stream(Request::StreamDeployLogs { deployment_id })
            .await
    }

    pub async fn container_logs(
        &self,
        container_id: &str,
        tail: u32,
        follow: bool,
    ) -> Result<RpcStream, ControlError> {
        self.rpc
            .open_stream(Request::GetContainerLogs {
                container_id: container_id.to_string(),
                tail,
                follow,
            })
            .await
    }

    pub async fn container_stats(
        &self,
        container_id: &str,
        stream: bool,
    ) -> Result<RpcStream, ControlError> {
        self.rpc
            .open_stream(Request::GetContainerStats {
                container_id: container_id.to_string(),
                stream,
            })
            .await
    }

    /// Open a bidirectional terminal session inside a container.
    pub async fn exec_container(&self, container_id: &str) -> Result<RpcStream, ControlError> {
        self.rpc
            .open_stream(Request::ExecContainer { container_id: container_id.to_string() })
            .await
    }

    /// Direct-push update: header, ≤`chunk_size` data chunks, then the ack.
    pub async fn push_update(
        &self,
        version: &str,
        binary: &[u8],
        chunk_size: usize,
    ) -> Result<PushOutcome, ControlError> {
        let sha256_hex = hex::encode(Sha256::digest(binary));
        let mut stream = self
            .rpc
            .open_stream(Request::PushUpdate {
                version: version.to_string(),
                total_size: binary.len() as u64,
                sha256_hex: Some(sha256_hex),
            })
            .await?;

        for chunk in binary.chunks(chunk_size.max(1)) {
            stream
                .send_item(StreamItem::UpdateChunk { data_hex: hex::encode(chunk) })
                .await?;
        }
        stream.finish_sending().await?;

        loop {
            match stream.next().await {
                Some(super::connection::StreamEvent::Response(result)) => {
                    return match result.map_err(|e| ControlError::Remote(e.to_string()))? {
                        Response::PushUpdateAck { success, message } => {
                            Ok(PushOutcome { success, message })
                        }
                        other => Err(ControlError::Remote(format!(
                            "unexpected reply to push_update: {other:?}"
                        ))),
                    };
                }
                Some(_) => {}
                None => return Err(ControlError::ClosedEarly),
            }
        }
    }
}

/// Pool of agent transports keyed by address.
pub struct AgentClientPool {
    tls_config: Arc<rustls::ClientConfig>,
    rpc_timeout: Duration,
    clients: Mutex<HashMap<String, Arc<AgentClient>>>,
}

impl AgentClientPool {
    pub fn new(material: &TlsMaterial, rpc_timeout: Duration) -> Result<Self, ControlError> {
        Ok(Self {
            tls_config: tls::client_config(material)?,
            rpc_timeout,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Shared transport to the agent at `host:port`, dialing if needed.
    /// The TLS layer verifies the peer presents `server_id` as its CN/SAN.
    pub async fn get(
        &self,
        host: &str,
        port: u16,
        server_id: ServerId,
    ) -> Result<Arc<AgentClient>, ControlError> {
        let addr = format!("{host}:{port}");
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(&addr) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
            debug!(%addr, "pooled transport is dead, redialing");
            clients.remove(&addr);
        }

        let name = tls::server_name(&server_id.to_string())?;
        let (rpc, _identity) =
            RpcClient::connect_tls(&addr, Arc::clone(&self.tls_config), name).await?;
        let client = Arc::new(AgentClient {
            addr: addr.clone(),
            rpc,
            rpc_timeout: self.rpc_timeout,
        });
        clients.insert(addr, Arc::clone(&client));
        Ok(client)
    }

    /// Close every pooled transport; used at shutdown.
    pub async fn close_all(&self) {
        let mut clients = self.clients.lock().await;
        let count = clients.len();
        for (_, client) in clients.drain() {
            client.rpc.close();
        }
        if count > 0 {
            info!(count, "closed pooled agent transports");
        }
    }

    pub async fn pooled_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}
