//! Plane-side agent update orchestration.
//!
//! Two delivery paths: the command-queue variant mints a single-use
//! download token and piggy-backs an UPDATE_AGENT command on the next
//! heartbeat; the direct variant pushes the binary over the control
//! channel in chunks. Completion in both cases is observed by version
//! reconciliation on the next Register/Heartbeat.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::error::UpdateError;
use crate::domain::models::{
    config::UpdateConfig, AgentCommand, AgentCommandKind, Event, Server, ServerId, StepStatus,
};
use crate::infrastructure::control::AgentClientPool;
use crate::services::{CommandQueue, EventFabric, TokenStore};

/// Plane-side half of the agent update channel.
pub struct AgentUpdater {
    config: UpdateConfig,
    api_prefix: String,
    agent_port: u16,
    queue: Arc<CommandQueue>,
    tokens: Arc<TokenStore>,
    fabric: Arc<EventFabric>,
    pool: Arc<AgentClientPool>,
}

impl AgentUpdater {
    pub fn new(
        config: UpdateConfig,
        api_prefix: String,
        agent_port: u16,
        queue: Arc<CommandQueue>,
        tokens: Arc<TokenStore>,
        fabric: Arc<EventFabric>,
        pool: Arc<AgentClientPool>,
    ) -> Self {
        Self { config, api_prefix, agent_port, queue, tokens, fabric, pool }
    }

    /// Queue an UPDATE_AGENT command whose payload is the tokenized
    /// download URL. Delivered on the server's next heartbeat.
    pub fn enqueue_update(&self, server_id: ServerId) -> String {
        let token = self.tokens.issue();
        let url = format!(
            "{}/{}/agent/binary?token={token}",
            self.config.download_base_url.trim_end_matches('/'),
            self.api_prefix.trim_matches('/'),
        );
        self.queue.enqueue(
            server_id,
            AgentCommand::with_payload(AgentCommandKind::UpdateAgent, url.clone()),
        );
        self.fabric.publish(&Event::agent_update_step(
            server_id,
            "queued",
            StepStatus::Started,
            "update command queued for next heartbeat",
        ));
        info!(server_id = %server_id, "agent update queued");
        url
    }

    /// Direct-push variant: stream the binary over the control channel.
    pub async fn push_update(&self, server: &Server, version: &str) -> Result<(), UpdateError> {
        let binary = tokio::fs::read(&self.config.agent_binary_path)
            .await
            .map_err(|e| UpdateError::Download(format!(
                "cannot read agent binary {}: {e}",
                self.config.agent_binary_path
            )))?;

        self.fabric.publish(&Event::agent_update_step(
            server.id,
            "push",
            StepStatus::Started,
            format!("pushing {} bytes", binary.len()),
        ));

        let client = self
            .pool
            .get(&server.host, self.agent_port, server.id)
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;
        let outcome = client
            .push_update(version, &binary, self.config.push_chunk_bytes)
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;

        if outcome.success {
            self.fabric.publish(&Event::agent_update_step(
                server.id,
                "push",
                StepStatus::Ok,
                outcome.message,
            ));
            Ok(())
        } else {
            self.fabric.publish(&Event::agent_update_step(
                server.id,
                "push",
                StepStatus::Failed,
                outcome.message.clone(),
            ));
            Err(UpdateError::Download(outcome.message))
        }
    }

    /// Periodic expiry sweep over the token store.
    pub async fn token_sweep_loop(tokens: Arc<TokenStore>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = shutdown.cancelled() => break,
            }
            let removed = tokens.sweep();
            if removed > 0 {
                warn!(removed, "expired unredeemed download tokens");
            }
        }
    }
}
