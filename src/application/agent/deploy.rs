//! Agent-side deploy execution: clone, build, swap, health wait.
//!
//! Every step writes a line into the log hub, so the plane's live stream
//! and the buffered reply body come from the same source. Rollback specs
//! (`rollback_to` set) skip clone and build and swap straight to the named
//! image.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::agent::log_hub::DeployLogHub;
use crate::domain::models::DeploymentId;
use crate::infrastructure::control::protocol::DeploySpec;
use crate::infrastructure::control::DeployOutcome;
use crate::services::{sanitize_arg, Executor, HealthChecker, ProbePolicy};

const CLONE_TIMEOUT: Duration = Duration::from_secs(180);
const BUILD_TIMEOUT: Duration = Duration::from_secs(480);
const SWAP_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs deployments on the local host.
pub struct DeployRunner {
    exec: Executor,
    health: HealthChecker,
    /// Scratch space for clones, one directory per deployment.
    work_root: PathBuf,
    /// Docker network app containers join.
    network: String,
}

impl DeployRunner {
    pub fn new(work_root: PathBuf) -> Self {
        Self {
            exec: Executor::new(),
            health: HealthChecker::new(),
            work_root,
            network: "caravel".to_string(),
        }
    }

    /// Execute one deploy spec, streaming step lines into `hub`.
    /// Never panics; every failure becomes an unsuccessful outcome.
    pub async fn run(
        &self,
        spec: &DeploySpec,
        hub: &DeployLogHub,
        cancel: &CancellationToken,
    ) -> DeployOutcome {
        let id = spec.deployment_id;
        let result = self.run_inner(spec, hub, cancel).await;
        let logs = hub.finish(id);
        match result {
            Ok(image_tag) => DeployOutcome { success: true, error: None, image_tag: Some(image_tag), logs },
            Err(message) => {
                warn!(deployment_id = %id, error = %message, "deploy failed on agent");
                DeployOutcome { success: false, error: Some(message), image_tag: None, logs }
            }
        }
    }

    async fn run_inner(
        &self,
        spec: &DeploySpec,
        hub: &DeployLogHub,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        let id = spec.deployment_id;
        let app = sanitize_arg(&spec.app_name);
        if app.is_empty() {
            return Err("app name sanitized to empty".to_string());
        }

        let image_tag = if let Some(tag) = &spec.rollback_to {
            hub.publish(id, &format!("rolling back to image {tag}"));
            tag.clone()
        } else {
            let short_sha: String = spec.commit_sha.chars().take(12).collect();
            let tag = format!("{app}:{}", sanitize_arg(&short_sha));
            self.build_image(spec, &tag, hub, cancel).await?;
            tag
        };

        if cancel.is_cancelled() {
            return Err("deploy cancelled".to_string());
        }
        self.swap_container(spec, &app, &image_tag, hub, cancel).await?;
        info!(deployment_id = %id, image_tag, "deploy completed on agent");
        Ok(image_tag)
    }

    async fn build_image(
        &self,
        spec: &DeploySpec,
        image_tag: &str,
        hub: &DeployLogHub,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let id = spec.deployment_id;
        let workdir = self.work_root.join(id.to_string());
        let workdir_str = workdir.to_string_lossy().into_owned();
        let _ = tokio::fs::remove_dir_all(&workdir).await;

        hub.publish(id, &format!("cloning {} ({})", spec.repo_url, spec.branch));
        self.run_step(
            id,
            hub,
            "git",
            &[
                "clone".into(),
                "--branch".into(),
                sanitize_arg(&spec.branch),
                spec.repo_url.clone(),
                workdir_str.clone(),
            ],
            CLONE_TIMEOUT,
            cancel,
        )
        .await?;

        if !spec.commit_sha.is_empty() {
            hub.publish(id, &format!("checking out {}", spec.commit_sha));
            self.run_step(
                id,
                hub,
                "git",
                &[
                    "-C".into(),
                    workdir_str.clone(),
                    "checkout".into(),
                    sanitize_arg(&spec.commit_sha),
                ],
                SWAP_TIMEOUT,
                cancel,
            )
            .await?;
        }

        let context = if spec.workdir.is_empty() {
            workdir_str.clone()
        } else {
            format!("{workdir_str}/{}", sanitize_arg(&spec.workdir))
        };
        hub.publish(id, &format!("building image {image_tag}"));
        self.run_step(
            id,
            hub,
            "docker",
            &["build".into(), "-t".into(), image_tag.to_string(), context],
            BUILD_TIMEOUT,
            cancel,
        )
        .await?;

        let _ = tokio::fs::remove_dir_all(&workdir).await;
        Ok(())
    }

    async fn swap_container(
        &self,
        spec: &DeploySpec,
        app: &str,
        image_tag: &str,
        hub: &DeployLogHub,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let id = spec.deployment_id;
        let live = format!("caravel-{app}");
        let prev = format!("caravel-{app}-prev");

        // Park the old container; ignore errors when there is none.
        let _ = self.docker(&["rm".into(), "-f".into(), prev.clone()]).await;
        let had_previous = self
            .docker(&["rename".into(), live.clone(), prev.clone()])
            .await
            .is_ok();
        if had_previous {
            hub.publish(id, "stopping previous container");
            let _ = self.docker(&["stop".into(), prev.clone()]).await;
        }

        hub.publish(id, &format!("starting container {live}"));
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            live.clone(),
            "--network".into(),
            self.network.clone(),
            "--restart".into(),
            "unless-stopped".into(),
            "-p".into(),
            format!("{}:{}", spec.config.host_port, spec.config.port),
        ];
        for (key, value) in &spec.config.env {
            args.push("-e".into());
            args.push(format!("{}={}", sanitize_arg(key), value));
        }
        if let Some(cpus) = &spec.config.limits.cpus {
            args.push("--cpus".into());
            args.push(sanitize_arg(cpus));
        }
        if let Some(memory_mb) = spec.config.limits.memory_mb {
            args.push("--memory".into());
            args.push(format!("{memory_mb}m"));
        }
        if !spec.config.domains.is_empty() {
            let rule = spec
                .config
                .domains
                .iter()
                .map(|d| format!("Host(`{}`)", sanitize_arg(d)))
                .collect::<Vec<_>>()
                .join(" || ");
            args.push("--label".into());
            args.push("traefik.enable=true".into());
            args.push("--label".into());
            args.push(format!("traefik.http.routers.{app}.rule={rule}"));
            args.push("--label".into());
            args.push(format!(
                "traefik.http.services.{app}.loadbalancer.server.port={}",
                spec.config.port
            ));
        }
        args.push(image_tag.to_string());

        if let Err(e) = self.docker(&args).await {
            self.revert_swap(&live, &prev, had_previous).await;
            return Err(format!("container start failed: {e}"));
        }

        // Health readiness gate before the old container is discarded.
        hub.publish(id, "waiting for health readiness");
        let url = format!(
            "http://127.0.0.1:{}/{}",
            spec.config.host_port,
            spec.config.health.path.trim_start_matches('/'),
        );
        let policy = ProbePolicy::from(&spec.config.health);
        match self.health.check_with_backoff(&url, policy, cancel).await {
            Ok(()) => {
                hub.publish(id, "health check passed");
                if had_previous {
                    let _ = self.docker(&["rm".into(), "-f".into(), prev]).await;
                }
                Ok(())
            }
            Err(e) => {
                hub.publish(id, &format!("health check failed: {e}"));
                self.revert_swap(&live, &prev, had_previous).await;
                Err(format!("health check failed: {e}"))
            }
        }
    }

    /// Put the previous container back after a failed swap.
    async fn revert_swap(&self, live: &str, prev: &str, had_previous: bool) {
        let _ = self.docker(&["rm".into(), "-f".into(), live.to_string()]).await;
        if had_previous {
            let _ = self
                .docker(&["rename".into(), prev.to_string(), live.to_string()])
                .await;
            let _ = self.docker(&["start".into(), live.to_string()]).await;
        }
    }

    async fn docker(&self, args: &[String]) -> Result<String, String> {
        self.exec
            .run("docker", args, SWAP_TIMEOUT)
            .await
            .map(|o| o.stdout)
            .map_err(|e| e.to_string())
    }

    /// Run a build step, streaming its output lines into the hub.
    async fn run_step(
        &self,
        id: DeploymentId,
        hub: &DeployLogHub,
        program: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let exec = self.exec.clone();
        let program_owned = program.to_string();
        let args_owned = args.to_vec();
        let step_cancel = cancel.clone();
        let run = tokio::spawn(async move {
            exec.run_streaming(&program_owned, &args_owned, timeout, tx, &step_cancel)
                .await
        });

        while let Some(line) = rx.recv().await {
            hub.publish(id, &line);
        }
        match run.await {
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(code)) => Err(format!("{program} exited with status {code}")),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("{program} task failed: {e}")),
        }
    }
}
