//! Gateway between the deploy engine and agents.
//!
//! The engine only needs two things from an agent: run a deploy and stream
//! its logs. Hiding the pooled transport behind this trait keeps the
//! engine's serialization and lifecycle logic testable against a scripted
//! fake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::error::ControlError;
use crate::domain::models::{DeploymentId, Server};
use crate::infrastructure::control::{
    AgentClientPool, DeployOutcome, DeploySpec, StreamEvent, StreamItem,
};

/// Agent operations the deploy engine depends on.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Run `ExecuteDeploy` on the server's agent.
    async fn execute_deploy(
        &self,
        server: &Server,
        agent_port: u16,
        spec: DeploySpec,
        timeout: Duration,
    ) -> Result<DeployOutcome, ControlError>;

    /// Open `StreamDeployLogs` and pump each line into the returned channel.
    /// The channel closes when the stream ends, errors or is cancelled.
    async fn open_deploy_logs(
        &self,
        server: &Server,
        agent_port: u16,
        deployment_id: DeploymentId,
    ) -> Result<mpsc::Receiver<String>, ControlError>;
}

/// Production gateway backed by the shared transport pool.
pub struct PooledAgentGateway {
    pool: Arc<AgentClientPool>,
}

impl PooledAgentGateway {
    pub fn new(pool: Arc<AgentClientPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentGateway for PooledAgentGateway {
    async fn execute_deploy(
        &self,
        server: &Server,
        agent_port: u16,
        spec: DeploySpec,
        timeout: Duration,
    ) -> Result<DeployOutcome, ControlError> {
        let client = self.pool.get(&server.host, agent_port, server.id).await?;
        client.execute_deploy(spec, timeout).await
    }

    async fn open_deploy_logs(
        &self,
        server: &Server,
        agent_port: u16,
        deployment_id: DeploymentId,
    ) -> Result<mpsc::Receiver<String>, ControlError> {
        let client = self.pool.get(&server.host, agent_port, server.id).await?;
        let mut stream = client.stream_deploy_logs(deployment_id).await?;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Item(StreamItem::LogLine { line }) => {
                        if tx.send(line).await.is_err() {
                            stream.cancel().await;
                            break;
                        }
                    }
                    StreamEvent::Response(_) | StreamEvent::End { .. } => break,
                    StreamEvent::Item(_) => {}
                }
            }
            debug!(deployment_id = %deployment_id, "deploy log stream closed");
        });
        Ok(rx)
    }
}
