//! Deploy engine: bounded worker pool with per-app serialization.
//!
//! Intents flow through an mpsc queue into N workers bounded by a
//! semaphore. For one app at most one deploy runs at a time; a second
//! intent arriving while the lock is held is cancelled outright rather
//! than queued, so webhook storms cannot fan out. The per-app lock is held
//! continuously across build, health check and rollback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::error::{DeployError, LockError};
use crate::domain::models::{
    config::{DeployConfig, HealthConfig},
    App, AppId, Deployment, DeploymentId, DeploymentStatus, Event, Server, ServerStatus,
};
use crate::domain::ports::{AppRepository, DeploymentRepository, ServerRepository};
use crate::application::gateway::AgentGateway;
use crate::infrastructure::control::DeploySpec;
use crate::services::{AgentHub, EventFabric, HealthChecker, Locker, ProbePolicy};

const INTAKE_QUEUE: usize = 256;

/// A deploy intent, as enqueued by the API layer.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub app_id: AppId,
    pub commit_sha: String,
    pub commit_message: String,
}

struct Intent {
    deployment_id: DeploymentId,
    app_id: AppId,
}

/// The worker-pool deploy engine.
pub struct DeployEngine {
    config: DeployConfig,
    health_defaults: HealthConfig,
    agent_port: u16,
    apps: Arc<dyn AppRepository>,
    deployments: Arc<dyn DeploymentRepository>,
    servers: Arc<dyn ServerRepository>,
    hub: Arc<AgentHub>,
    locker: Arc<Locker>,
    gateway: Arc<dyn AgentGateway>,
    fabric: Arc<EventFabric>,
    health: HealthChecker,
    intake_tx: mpsc::Sender<Intent>,
    intake_rx: Mutex<Option<mpsc::Receiver<Intent>>>,
    shutdown: CancellationToken,
    running: AtomicUsize,
}

impl DeployEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DeployConfig,
        health_defaults: HealthConfig,
        agent_port: u16,
        apps: Arc<dyn AppRepository>,
        deployments: Arc<dyn DeploymentRepository>,
        servers: Arc<dyn ServerRepository>,
        hub: Arc<AgentHub>,
        locker: Arc<Locker>,
        gateway: Arc<dyn AgentGateway>,
        fabric: Arc<EventFabric>,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_QUEUE);
        Self {
            config,
            health_defaults,
            agent_port,
            apps,
            deployments,
            servers,
            hub,
            locker,
            gateway,
            fabric,
            health: HealthChecker::new(),
            intake_tx,
            intake_rx: Mutex::new(Some(intake_rx)),
            shutdown: CancellationToken::new(),
            running: AtomicUsize::new(0),
        }
    }

    /// Record a deployment and queue it for a worker. Fails fast when the
    /// app does not exist; after this returns the deployment row is
    /// observable in status pending.
    pub async fn enqueue(&self, request: DeployRequest) -> Result<DeploymentId, DeployError> {
        let app = self
            .apps
            .get(request.app_id)
            .await?
            .ok_or(DeployError::AppNotFound(request.app_id))?;

        let deployment = Deployment::new(app.id, request.commit_sha, request.commit_message);
        self.deployments.create(&deployment).await?;

        let intent = Intent { deployment_id: deployment.id, app_id: app.id };
        if self.intake_tx.send(intent).await.is_err() {
            // Engine is shutting down; freeze the record as cancelled.
            self.deployments
                .mark_terminal(
                    deployment.id,
                    DeploymentStatus::Cancelled,
                    Some("deploy engine stopped".to_string()),
                    Utc::now(),
                )
                .await?;
            return Err(DeployError::DeploymentNotFound(deployment.id));
        }
        debug!(deployment_id = %deployment.id, app_id = %app.id, "deploy intent queued");
        Ok(deployment.id)
    }

    /// Spawn the dispatcher and worker pool. Call once.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = engine
                .intake_rx
                .lock()
                .await
                .take()
                .expect("deploy engine started twice");
            let permits = Arc::new(Semaphore::new(engine.config.workers));
            info!(workers = engine.config.workers, "deploy engine started");

            loop {
                let intent = tokio::select! {
                    intent = rx.recv() => intent,
                    () = engine.shutdown.cancelled() => break,
                };
                let Some(intent) = intent else { break };

                let permit = tokio::select! {
                    permit = Arc::clone(&permits).acquire_owned() => permit,
                    () = engine.shutdown.cancelled() => break,
                };
                let Ok(permit) = permit else { break };

                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.running.fetch_add(1, Ordering::SeqCst);
                    engine.execute_intent(intent).await;
                    engine.running.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }
            info!("deploy engine dispatcher stopped");
        });
    }

    /// Stop accepting work and cancel in-flight deadline waits.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Deploys executing right now; never exceeds the worker count.
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    async fn execute_intent(&self, intent: Intent) {
        // Re-load the app: it may have been purged while queued.
        let app = match self.apps.get(intent.app_id).await {
            Ok(Some(app)) => app,
            Ok(None) => {
                self.cancel_deployment(intent.deployment_id, "app deleted before deploy started")
                    .await;
                return;
            }
            Err(e) => {
                self.cancel_deployment(intent.deployment_id, &format!("failed to load app: {e}"))
                    .await;
                return;
            }
        };

        // Per-app serialization: fail fast on contention, never wait.
        if let Err(e) = self.locker.acquire(intent.app_id) {
            let reason = match e {
                LockError::Held(_) => {
                    format!("lock held: another deploy is in flight for app {}", intent.app_id)
                }
                other => format!("lock not acquirable: {other}"),
            };
            self.cancel_deployment(intent.deployment_id, &reason).await;
            return;
        }

        // The lock is held across the whole run, rollback included.
        let result = self.run_locked(&app, intent.deployment_id).await;
        if let Err(e) = self.locker.release(intent.app_id) {
            error!(app_id = %intent.app_id, error = %e, "failed to release app lock");
        }
        if let Err(e) = result {
            debug!(deployment_id = %intent.deployment_id, error = %e, "deploy finished with failure");
        }
    }

    async fn cancel_deployment(&self, deployment_id: DeploymentId, reason: &str) {
        info!(deployment_id = %deployment_id, reason, "deploy intent cancelled");
        if let Err(e) = self
            .deployments
            .mark_terminal(
                deployment_id,
                DeploymentStatus::Cancelled,
                Some(reason.to_string()),
                Utc::now(),
            )
            .await
        {
            error!(deployment_id = %deployment_id, error = %e, "failed to persist cancellation");
        }
    }

    async fn run_locked(&self, app: &App, deployment_id: DeploymentId) -> Result<(), DeployError> {
        let deployment = self
            .deployments
            .get(deployment_id)
            .await?
            .ok_or(DeployError::DeploymentNotFound(deployment_id))?;

        self.deployments.mark_running(deployment_id, Utc::now()).await?;
        self.fabric.publish(&Event::deploy_running(app.id, deployment_id));

        let previous_image_tag = self.last_successful_image(app.id).await?;
        self.deployments
            .set_image_tags(deployment_id, previous_image_tag.as_deref(), None)
            .await?;

        let server = match self.resolve_server(app.id).await {
            Ok(server) => server,
            Err(e) => {
                return self
                    .fail_deployment(app, deployment_id, None, None, &e.to_string())
                    .await;
            }
        };

        let spec = DeploySpec {
            app_id: app.id,
            deployment_id,
            app_name: app.name.clone(),
            repo_url: app.repo_url.clone(),
            branch: app.branch.clone(),
            commit_sha: deployment.commit_sha.clone(),
            workdir: app.workdir.clone(),
            config: app.config.clone(),
            previous_image_tag: previous_image_tag.clone(),
            rollback_to: None,
        };

        let deadline = Duration::from_secs(self.config.timeout_secs);
        let attempt = tokio::select! {
            attempt = tokio::time::timeout(deadline, self.attempt_deploy(app, &server, spec)) => attempt,
            () = self.shutdown.cancelled() => Ok(Err(DeployError::Agent("deploy cancelled: engine shutting down".into()))),
        };

        match attempt {
            Ok(Ok(image_tag)) => {
                self.deployments
                    .set_image_tags(deployment_id, None, Some(&image_tag))
                    .await?;
                self.deployments
                    .mark_terminal(deployment_id, DeploymentStatus::Success, None, Utc::now())
                    .await?;
                self.apps.set_last_deployed_at(app.id, Utc::now()).await?;
                self.fabric
                    .publish(&Event::deploy_success(app.id, deployment_id, image_tag));
                info!(deployment_id = %deployment_id, app_id = %app.id, "deploy succeeded");
                Ok(())
            }
            Ok(Err(e)) => {
                self.fail_deployment(
                    app,
                    deployment_id,
                    Some(&server),
                    previous_image_tag.as_deref(),
                    &e.to_string(),
                )
                .await
            }
            Err(_elapsed) => {
                let message = DeployError::DeadlineExceeded(self.config.timeout_secs).to_string();
                self.fail_deployment(
                    app,
                    deployment_id,
                    Some(&server),
                    previous_image_tag.as_deref(),
                    &message,
                )
                .await
            }
        }
    }

    /// The RPC plus health-check phase. Returns the new image tag.
    async fn attempt_deploy(
        &self,
        app: &App,
        server: &Server,
        spec: DeploySpec,
    ) -> Result<String, DeployError> {
        let deployment_id = spec.deployment_id;

        // Subscribe to the log stream before issuing the RPC so the
        // earliest lines are not lost.
        let log_rx = self
            .gateway
            .open_deploy_logs(server, self.agent_port, deployment_id)
            .await;
        let forwarder = match log_rx {
            Ok(mut rx) => {
                let fabric = Arc::clone(&self.fabric);
                let deployments = Arc::clone(&self.deployments);
                let app_id = app.id;
                let cap = self.config.log_cap_bytes;
                Some(tokio::spawn(async move {
                    while let Some(line) = rx.recv().await {
                        fabric.publish(&Event::deploy_log(app_id, deployment_id, line.clone()));
                        let mut stored = line;
                        stored.push('\n');
                        if let Err(e) = deployments.append_logs(deployment_id, &stored, cap).await {
                            warn!(deployment_id = %deployment_id, error = %e, "failed to append deploy logs");
                        }
                    }
                }))
            }
            Err(e) => {
                // Logs are advisory; the deploy itself still proceeds.
                warn!(deployment_id = %deployment_id, error = %e, "could not open deploy log stream");
                None
            }
        };

        let outcome = self
            .gateway
            .execute_deploy(server, self.agent_port, spec, Duration::from_secs(self.config.timeout_secs))
            .await;
        if let Some(handle) = forwarder {
            // The stream closes when the agent finishes; wait for the tail.
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        let outcome = outcome?;

        if !outcome.success {
            return Err(DeployError::Agent(
                outcome.error.unwrap_or_else(|| "agent reported failure".to_string()),
            ));
        }

        // Health gate against the app's public URL. Transient probe errors
        // are retried here; the ExecuteDeploy RPC itself is never retried.
        let url = app.health_url(&server.host);
        let policy = if app.config.health.timeout_secs > 0 {
            ProbePolicy::from(&app.config.health)
        } else {
            ProbePolicy {
                timeout: Duration::from_secs(self.health_defaults.timeout_secs),
                interval: Duration::from_secs(self.health_defaults.interval_secs),
                retries: self.health_defaults.retries,
            }
        };
        let cancel = self.shutdown.child_token();
        match self.health.check(&url, policy, &cancel).await {
            Ok(()) => {
                self.fabric
                    .publish(&Event::container_health(app.id, true, format!("{url} healthy")));
            }
            Err(e) => {
                self.fabric
                    .publish(&Event::container_health(app.id, false, e.to_string()));
                return Err(DeployError::HealthCheck(e.to_string()));
            }
        }

        Ok(outcome.image_tag.unwrap_or_else(|| format!("sha-{}", deployment_id)))
    }

    /// Failure path: roll back to the previous image under the same lock,
    /// then freeze the record as failed.
    async fn fail_deployment(
        &self,
        app: &App,
        deployment_id: DeploymentId,
        server: Option<&Server>,
        previous_image_tag: Option<&str>,
        message: &str,
    ) -> Result<(), DeployError> {
        warn!(deployment_id = %deployment_id, app_id = %app.id, message, "deploy failed");

        if let (Some(server), Some(previous)) = (server, previous_image_tag) {
            info!(deployment_id = %deployment_id, rollback_to = previous, "rolling back");
            let rollback_spec = DeploySpec {
                app_id: app.id,
                deployment_id,
                app_name: app.name.clone(),
                repo_url: app.repo_url.clone(),
                branch: app.branch.clone(),
                commit_sha: String::new(),
                workdir: app.workdir.clone(),
                config: app.config.clone(),
                previous_image_tag: None,
                rollback_to: Some(previous.to_string()),
            };
            // Rollback re-runs a known-good image; no rebuild path. Errors
            // here are logged but never change the failed status.
            match self
                .gateway
                .execute_deploy(server, self.agent_port, rollback_spec, Duration::from_secs(120))
                .await
            {
                Ok(outcome) if outcome.success => {
                    info!(deployment_id = %deployment_id, "rollback completed");
                }
                Ok(outcome) => {
                    error!(
                        deployment_id = %deployment_id,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "rollback reported failure"
                    );
                }
                Err(e) => {
                    error!(deployment_id = %deployment_id, error = %e, "rollback RPC failed");
                }
            }
        }

        self.deployments
            .mark_terminal(
                deployment_id,
                DeploymentStatus::Failed,
                Some(message.to_string()),
                Utc::now(),
            )
            .await?;
        self.fabric
            .publish(&Event::deploy_failed(app.id, deployment_id, message));
        Ok(())
    }

    async fn last_successful_image(&self, app_id: AppId) -> Result<Option<String>, DeployError> {
        let history = self.deployments.list_for_app(app_id, 50).await?;
        Ok(history
            .into_iter()
            .find(|d| d.status == DeploymentStatus::Success)
            .and_then(|d| d.current_image_tag))
    }

    /// Pick the deploy target: the first server that is online both in the
    /// hub and in its persisted row.
    async fn resolve_server(&self, app_id: AppId) -> Result<Server, DeployError> {
        let servers = self.servers.list().await?;
        servers
            .into_iter()
            .find(|s| s.status == ServerStatus::Online && self.hub.is_online(s.id))
            .ok_or(DeployError::NoServer(app_id))
    }
}
