//! Agent-side RPC surface.
//!
//! Serves the plane's calls on the local listener. The peer must present a
//! leaf chaining to the shared CA whose OU is the control-plane role;
//! anything else is refused before dispatch.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::application::agent::deploy::DeployRunner;
use crate::application::agent::docker;
use crate::application::agent::log_hub::DeployLogHub;
use crate::application::agent::update::SelfUpdater;
use crate::application::agent::runtime::ExitReason;
use crate::domain::error::ExecError;
use crate::infrastructure::control::connection::{InboundItem, RpcContext, RpcHandler};
use crate::infrastructure::control::protocol::{ErrorCode, Request, Response, StreamItem, WireError};
use crate::infrastructure::pki::{PeerIdentity, PLANE_ROLE};
use crate::services::{Executor, sanitize_arg};

/// Handler for plane-initiated RPCs on the agent.
pub struct AgentRpcHandler {
    pub(super) exec: Executor,
    pub(super) runner: Arc<DeployRunner>,
    pub(super) log_hub: Arc<DeployLogHub>,
    pub(super) updater: Arc<SelfUpdater>,
    pub(super) domains_path: std::path::PathBuf,
    /// Signals the runtime to exit (and be relaunched) after an update.
    pub(super) exit_tx: mpsc::Sender<ExitReason>,
}

fn authorize_plane(peer: &PeerIdentity) -> Result<(), WireError> {
    if !peer.has_role(PLANE_ROLE) {
        return Err(WireError::unauthenticated(format!(
            "peer OU {:?} is not the control-plane role",
            peer.organizational_unit
        )));
    }
    Ok(())
}

fn exec_err(e: ExecError) -> WireError {
    WireError::internal(e.to_string())
}

#[async_trait]
impl RpcHandler for AgentRpcHandler {
    #[allow(clippy::too_many_lines)]
    async fn handle(
        &self,
        peer: &PeerIdentity,
        request: Request,
        mut ctx: RpcContext,
    ) -> Result<Response, WireError> {
        authorize_plane(peer)?;

        match request {
            Request::ExecuteDeploy(spec) => {
                info!(deployment_id = %spec.deployment_id, app = %spec.app_name, "executing deploy");
                let outcome = self.runner.run(&spec, &self.log_hub, &ctx.cancelled).await;
                Ok(Response::DeployResult {
                    success: outcome.success,
                    error: outcome.error,
                    image_tag: outcome.image_tag,
                    logs: outcome.logs,
                })
            }

            Request::StreamDeployLogs { deployment_id } => {
                let mut rx = self.log_hub.subscribe(deployment_id);
                loop {
                    tokio::select! {
                        line = rx.recv() => match line {
                            Some(line) => {
                                if ctx.send_item(StreamItem::LogLine { line }).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        () = ctx.cancelled.cancelled() => break,
                    }
                }
                Ok(Response::StreamDone)
            }

            Request::GetContainerLogs { container_id, tail, follow } => {
                let mut args = vec!["logs".to_string(), "--tail".to_string(), tail.to_string()];
                if follow {
                    args.push("-f".to_string());
                }
                args.push(sanitize_arg(&container_id));

                let (tx, mut rx) = mpsc::channel::<String>(256);
                let exec = self.exec.clone();
                let cancel = ctx.cancelled.clone();
                let timeout = if follow { Duration::from_secs(3600) } else { Duration::from_secs(60) };
                let run = tokio::spawn(async move {
                    exec.run_streaming("docker", &args, timeout, tx, &cancel).await
                });
                while let Some(line) = rx.recv().await {
                    if ctx.send_item(StreamItem::LogLine { line }).await.is_err() {
                        ctx.cancelled.cancel();
                        break;
                    }
                }
                let _ = run.await;
                Ok(Response::StreamDone)
            }

            Request::GetContainerStats { container_id, stream } => {
                let container = sanitize_arg(&container_id);
                loop {
                    let sample = docker::docker(
                        &self.exec,
                        &["stats", "--no-stream", "--format", "{{json .}}", container.as_str()],
                    )
                    .await
                    .map_err(exec_err)?;
                    ctx.send_item(StreamItem::StatSample { json: sample.trim().to_string() })
                        .await
                        .map_err(|e| WireError::internal(e.to_string()))?;
                    if !stream {
                        break;
                    }
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(2)) => {}
                        () = ctx.cancelled.cancelled() => break,
                    }
                }
                Ok(Response::StreamDone)
            }

            Request::PushUpdate { version, total_size, sha256_hex } => {
                debug!(version, total_size, "receiving pushed update");
                let mut data: Vec<u8> = Vec::with_capacity(usize::try_from(total_size).unwrap_or(0));
                while let Some(item) = ctx.next_inbound().await {
                    match item {
                        InboundItem::Item(StreamItem::UpdateChunk { data_hex }) => {
                            let chunk = hex::decode(&data_hex).map_err(|e| {
                                WireError::new(ErrorCode::InvalidArgument, format!("bad chunk: {e}"))
                            })?;
                            data.extend_from_slice(&chunk);
                            if data.len() as u64 > total_size {
                                return Ok(Response::PushUpdateAck {
                                    success: false,
                                    message: "received more bytes than the declared size".to_string(),
                                });
                            }
                        }
                        InboundItem::End { .. } => break,
                        InboundItem::Item(_) => {}
                    }
                }

                match self
                    .updater
                    .stage_bytes(&data, total_size, sha256_hex.as_deref())
                    .await
                {
                    Ok(()) => {
                        info!(version, "update staged, restarting for relaunch");
                        let exit_tx = self.exit_tx.clone();
                        tokio::spawn(async move {
                            // Give the ack a moment to flush before exiting.
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            let _ = exit_tx.send(ExitReason::Restart).await;
                        });
                        Ok(Response::PushUpdateAck {
                            success: true,
                            message: format!("staged version {version}"),
                        })
                    }
                    Err(e) => Ok(Response::PushUpdateAck { success: false, message: e.to_string() }),
                }
            }

            Request::ExecContainer { container_id } => {
                self.exec_container(&sanitize_arg(&container_id), &mut ctx).await
            }

            Request::GetSystemInfo => {
                let info = docker::system_info(&self.exec).await.map_err(exec_err)?;
                Ok(Response::SystemInfo(info))
            }
            Request::GetSystemMetrics => Ok(Response::SystemMetrics(docker::system_metrics().await)),
            Request::GetDockerInfo => {
                let text = docker::docker_info(&self.exec).await.map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::ListContainers => {
                let text = docker::list_containers(&self.exec).await.map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::RestartContainer { container_id } => {
                let text = docker::restart_container(&self.exec, &sanitize_arg(&container_id))
                    .await
                    .map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::StopContainer { container_id } => {
                let text = docker::stop_container(&self.exec, &sanitize_arg(&container_id))
                    .await
                    .map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::StartContainer { container_id } => {
                let text = docker::start_container(&self.exec, &sanitize_arg(&container_id))
                    .await
                    .map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::RemoveContainer { container_id } => {
                let text = docker::remove_container(&self.exec, &sanitize_arg(&container_id))
                    .await
                    .map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::ListImages => {
                let text = docker::list_images(&self.exec).await.map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::RemoveImage { image_id } => {
                let text = docker::remove_image(&self.exec, &sanitize_arg(&image_id))
                    .await
                    .map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::PruneImages => {
                let text = docker::prune_images(&self.exec).await.map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::ListNetworks => {
                let text = docker::list_networks(&self.exec).await.map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::CreateNetwork { name } => {
                let text = docker::create_network(&self.exec, &sanitize_arg(&name))
                    .await
                    .map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::RemoveNetwork { name } => {
                let text = docker::remove_network(&self.exec, &sanitize_arg(&name))
                    .await
                    .map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::ListVolumes => {
                let text = docker::list_volumes(&self.exec).await.map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::CreateVolume { name } => {
                let text = docker::create_volume(&self.exec, &sanitize_arg(&name))
                    .await
                    .map_err(exec_err)?;
                Ok(Response::Output { text })
            }
            Request::RemoveVolume { name } => {
                let text = docker::remove_volume(&self.exec, &sanitize_arg(&name))
                    .await
                    .map_err(exec_err)?;
                Ok(Response::Output { text })
            }

            Request::UpdateDomains { domains } => {
                let body = serde_json::to_vec(&domains)
                    .map_err(|e| WireError::internal(e.to_string()))?;
                tokio::fs::write(&self.domains_path, body)
                    .await
                    .map_err(|e| WireError::internal(e.to_string()))?;
                Ok(Response::Ack { message: format!("{} domains recorded", domains.len()) })
            }

            Request::Register { .. } | Request::Heartbeat { .. } => Err(WireError::new(
                ErrorCode::InvalidArgument,
                "register/heartbeat are served by the plane, not the agent",
            )),
        }
    }
}

impl AgentRpcHandler {
    /// Terminal-style session: stdin from the plane, stdout back, resize
    /// accepted but advisory (no pty allocation through the CLI).
    async fn exec_container(
        &self,
        container_id: &str,
        ctx: &mut RpcContext,
    ) -> Result<Response, WireError> {
        let mut child = tokio::process::Command::new("docker")
            .args(["exec", "-i", container_id, "/bin/sh"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WireError::internal(format!("docker exec spawn failed: {e}")))?;

        let mut stdin = child.stdin.take().expect("stdin piped");
        let mut stdout = child.stdout.take().expect("stdout piped");
        let cancelled = ctx.cancelled.clone();

        loop {
            let mut buf = [0u8; 4096];
            tokio::select! {
                read = stdout.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if ctx.send_item(StreamItem::ExecOutput { data }).await.is_err() {
                            break;
                        }
                    }
                },
                inbound = ctx.next_inbound() => match inbound {
                    Some(InboundItem::Item(StreamItem::ExecInput { data })) => {
                        if stdin.write_all(data.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(InboundItem::Item(StreamItem::ExecResize { cols, rows })) => {
                        debug!(cols, rows, "exec resize requested");
                    }
                    Some(InboundItem::End { .. }) | None => break,
                    Some(InboundItem::Item(_)) => {}
                },
                () = cancelled.cancelled() => break,
            }
        }

        let _ = child.kill().await;
        let _ = child.wait().await;
        Ok(Response::StreamDone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_role_required() {
        let agent_peer = PeerIdentity {
            common_name: "some-agent".to_string(),
            organizational_unit: Some("caravel-agent".to_string()),
        };
        assert!(authorize_plane(&agent_peer).is_err());

        let plane_peer = PeerIdentity {
            common_name: "caravel-plane".to_string(),
            organizational_unit: Some(PLANE_ROLE.to_string()),
        };
        assert!(authorize_plane(&plane_peer).is_ok());
    }
}
