//! SSH provisioning pipeline: raw host to running agent.
//!
//! An ordered step machine; every step publishes a provision-step event
//! with started/ok/skipped/failed and free-form provision-log lines in
//! between. Check steps inspect existing state and report ok or skipped so
//! re-provisioning a half-done host converges instead of erroring.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::domain::error::ProvisionError;
use crate::domain::models::{Event, Server, ServerId, ServerStatus, StepStatus};
use crate::domain::ports::ServerRepository;
use crate::infrastructure::pki::{CertificateAuthority, AGENT_ROLE};
use crate::infrastructure::ssh::{SshConnector, SshOutput, SshTransport};
use crate::services::EventFabric;

/// Leaf lifetime handed to agents at provision time.
const AGENT_CERT_LIFETIME: Duration = Duration::from_secs(90 * 86_400);

/// Docker network every app container joins.
const APP_NETWORK: &str = "caravel";

/// Ordered pipeline steps, by wire name.
pub const STEPS: &[&str] = &[
    "ssh_connect",
    "remote_env",
    "docker_check",
    "docker_install",
    "docker_start",
    "docker_network",
    "traefik_check",
    "traefik_install",
    "sftp_client",
    "install_dir",
    "agent_certs",
    "agent_binary",
    "systemd_unit",
    "start_agent",
];

/// Settings the provisioner needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Local path of the agent binary to ship.
    pub agent_binary_path: String,
    /// Address agents dial back to for Register/Heartbeat.
    pub plane_addr: String,
    /// Port the agent listens on for plane-initiated RPCs.
    pub agent_port: u16,
}

/// The SSH/SFTP installation pipeline.
pub struct Provisioner {
    connector: Arc<dyn SshConnector>,
    ca: Arc<CertificateAuthority>,
    servers: Arc<dyn ServerRepository>,
    fabric: Arc<EventFabric>,
    settings: ProvisionerSettings,
}

struct StepContext<'a> {
    fabric: &'a EventFabric,
    server_id: ServerId,
}

impl StepContext<'_> {
    fn started(&self, step: &str) {
        self.fabric
            .publish(&Event::provision_step(self.server_id, step, StepStatus::Started, ""));
    }

    fn ok(&self, step: &str, message: impl Into<String>) {
        self.fabric
            .publish(&Event::provision_step(self.server_id, step, StepStatus::Ok, message));
    }

    fn skipped(&self, step: &str, message: impl Into<String>) {
        self.fabric
            .publish(&Event::provision_step(self.server_id, step, StepStatus::Skipped, message));
    }

    fn failed(&self, step: &str, message: impl Into<String>) {
        self.fabric
            .publish(&Event::provision_step(self.server_id, step, StepStatus::Failed, message));
    }

    fn log(&self, line: impl Into<String>) {
        self.fabric.publish(&Event::provision_log(self.server_id, line));
    }
}

impl Provisioner {
    pub fn new(
        connector: Arc<dyn SshConnector>,
        ca: Arc<CertificateAuthority>,
        servers: Arc<dyn ServerRepository>,
        fabric: Arc<EventFabric>,
        settings: ProvisionerSettings,
    ) -> Self {
        Self { connector, ca, servers, fabric, settings }
    }

    /// Run the pipeline against one server. Emits provision-completed on
    /// success; any failure emits provision-failed naming the step and
    /// moves the server row to failed.
    pub async fn provision(&self, server: &Server) -> Result<(), ProvisionError> {
        let ctx = StepContext { fabric: &self.fabric, server_id: server.id };
        self.servers
            .set_status(server.id, ServerStatus::Provisioning)
            .await
            .map_err(|e| ProvisionError::Command(e.to_string()))?;

        match self.run_pipeline(server, &ctx).await {
            Ok(()) => {
                self.fabric.publish(&Event::provision_completed(server.id));
                info!(server_id = %server.id, host = %server.host, "provisioning completed");
                Ok(())
            }
            Err((step, e)) => {
                ctx.failed(step, e.to_string());
                self.fabric
                    .publish(&Event::provision_failed(server.id, step, e.to_string()));
                if let Err(db_err) = self.servers.set_status(server.id, ServerStatus::Failed).await {
                    warn!(server_id = %server.id, error = %db_err, "failed to persist failed status");
                }
                warn!(server_id = %server.id, step, error = %e, "provisioning failed");
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        server: &Server,
        ctx: &StepContext<'_>,
    ) -> Result<(), (&'static str, ProvisionError)> {
        // ssh_connect
        ctx.started("ssh_connect");
        let ssh = self
            .connector
            .connect(server)
            .await
            .map_err(|e| ("ssh_connect", e))?;
        ctx.ok("ssh_connect", format!("connected to {}:{}", server.host, server.ssh_port));

        let result = self.run_steps(server, ctx, ssh.as_ref()).await;
        let _ = ssh.close().await;
        result
    }

    #[allow(clippy::too_many_lines)]
    async fn run_steps(
        &self,
        server: &Server,
        ctx: &StepContext<'_>,
        ssh: &dyn SshTransport,
    ) -> Result<(), (&'static str, ProvisionError)> {
        // remote_env: learn the home directory and host facts.
        ctx.started("remote_env");
        let env = exec_ok(ssh, "echo \"$HOME\" && uname -s && uname -m")
            .await
            .map_err(|e| ("remote_env", e))?;
        let mut lines = env.stdout.lines();
        let home = lines.next().unwrap_or("").trim().to_string();
        if home.is_empty() {
            return Err((
                "remote_env",
                ProvisionError::Command("could not determine remote home directory".to_string()),
            ));
        }
        for line in lines {
            ctx.log(line.to_string());
        }
        ctx.ok("remote_env", format!("home={home}"));

        // docker_check / docker_install
        ctx.started("docker_check");
        let docker_present = ssh
            .exec("docker version --format '{{.Server.Version}}' 2>/dev/null")
            .await
            .map_err(|e| ("docker_check", e))?
            .success();
        if docker_present {
            ctx.ok("docker_check", "docker already installed");
            ctx.skipped("docker_install", "docker already installed");
        } else {
            ctx.ok("docker_check", "docker missing, will install");
            ctx.started("docker_install");
            exec_ok(ssh, "curl -fsSL https://get.docker.com | sh")
                .await
                .map_err(|e| ("docker_install", e))?;
            ctx.ok("docker_install", "docker installed");
        }

        // docker_start
        ctx.started("docker_start");
        if ssh.exec("docker info >/dev/null 2>&1").await.map_err(|e| ("docker_start", e))?.success() {
            ctx.ok("docker_start", "docker daemon running");
        } else {
            exec_ok(ssh, "sudo systemctl enable --now docker")
                .await
                .map_err(|e| ("docker_start", e))?;
            ctx.ok("docker_start", "docker daemon started");
        }

        // docker_network
        ctx.started("docker_network");
        let net_cmd = format!(
            "docker network inspect {APP_NETWORK} >/dev/null 2>&1 || docker network create {APP_NETWORK}"
        );
        exec_ok(ssh, &net_cmd).await.map_err(|e| ("docker_network", e))?;
        ctx.ok("docker_network", format!("network {APP_NETWORK} present"));

        // traefik_check / traefik_install
        ctx.started("traefik_check");
        let traefik = ssh
            .exec("docker ps --filter name=traefik --format '{{.Names}}'")
            .await
            .map_err(|e| ("traefik_check", e))?;
        if traefik.stdout.contains("traefik") {
            ctx.ok("traefik_check", "traefik already running");
            ctx.skipped("traefik_install", "traefik already running");
        } else {
            ctx.ok("traefik_check", "traefik missing, will install");
            ctx.started("traefik_install");
            let install = format!(
                "docker run -d --name traefik --restart unless-stopped \
                 --network {APP_NETWORK} -p 80:80 -p 443:443 \
                 -v /var/run/docker.sock:/var/run/docker.sock:ro \
                 -v traefik-acme:/acme \
                 traefik:v3.1 \
                 --providers.docker=true --providers.docker.exposedbydefault=false \
                 --entrypoints.web.address=:80 --entrypoints.websecure.address=:443 \
                 --certificatesresolvers.le.acme.email={email} \
                 --certificatesresolvers.le.acme.storage=/acme/acme.json \
                 --certificatesresolvers.le.acme.httpchallenge.entrypoint=web",
                email = crate::services::sanitize_arg(&server.acme_email),
            );
            exec_ok(ssh, &install).await.map_err(|e| ("traefik_install", e))?;
            ctx.ok("traefik_install", "traefik started");
        }

        // sftp_client: prove the subsystem works before shipping real files.
        ctx.started("sftp_client");
        let probe = format!("{home}/.caravel-sftp-probe");
        ssh.upload(&probe, b"ok").await.map_err(|e| ("sftp_client", e))?;
        let _ = ssh.exec(&format!("rm -f {probe}")).await;
        ctx.ok("sftp_client", "sftp subsystem available");

        // install_dir
        ctx.started("install_dir");
        let install_dir = format!("{home}/.caravel");
        exec_ok(
            ssh,
            &format!("mkdir -p {install_dir}/bin {install_dir}/certs && chmod 700 {install_dir}"),
        )
        .await
        .map_err(|e| ("install_dir", e))?;
        ctx.ok("install_dir", install_dir.clone());

        // agent_certs
        ctx.started("agent_certs");
        let leaf = self
            .ca
            .issue_leaf(&server.id.to_string(), AGENT_ROLE, AGENT_CERT_LIFETIME)
            .map_err(ProvisionError::Pki)
            .map_err(|e| ("agent_certs", e))?;
        let certs_dir = format!("{install_dir}/certs");
        ssh.upload(&format!("{certs_dir}/ca.crt"), self.ca.root_pem().as_bytes())
            .await
            .map_err(|e| ("agent_certs", e))?;
        ssh.upload(&format!("{certs_dir}/agent.crt"), leaf.cert_pem.as_bytes())
            .await
            .map_err(|e| ("agent_certs", e))?;
        ssh.upload(&format!("{certs_dir}/agent.key"), leaf.key_pem.as_bytes())
            .await
            .map_err(|e| ("agent_certs", e))?;
        exec_ok(
            ssh,
            &format!(
                "chown {user}:{user} {certs_dir}/ca.crt {certs_dir}/agent.crt {certs_dir}/agent.key && \
                 chmod 644 {certs_dir}/ca.crt {certs_dir}/agent.crt && chmod 600 {certs_dir}/agent.key",
                user = crate::services::sanitize_arg(&server.install_user),
            ),
        )
        .await
        .map_err(|e| ("agent_certs", e))?;
        let fingerprint = self
            .ca
            .root_fingerprint()
            .map_err(ProvisionError::Pki)
            .map_err(|e| ("agent_certs", e))?;
        ctx.log(format!("ca fingerprint sha256:{fingerprint}"));
        ctx.ok("agent_certs", format!("issued leaf CN={}", server.id));

        // agent_binary
        ctx.started("agent_binary");
        let binary = tokio::fs::read(&self.settings.agent_binary_path)
            .await
            .map_err(|e| {
                (
                    "agent_binary",
                    ProvisionError::Sftp(format!(
                        "cannot read local agent binary {}: {e}",
                        self.settings.agent_binary_path
                    )),
                )
            })?;
        let staged = format!("{install_dir}/bin/caravel-agent.tmp");
        let live = format!("{install_dir}/bin/caravel-agent");
        ssh.upload(&staged, &binary).await.map_err(|e| ("agent_binary", e))?;
        exec_ok(ssh, &format!("mv {staged} {live} && chmod 755 {live}"))
            .await
            .map_err(|e| ("agent_binary", e))?;
        ctx.ok("agent_binary", format!("{} bytes installed", binary.len()));

        // systemd_unit: hosts without a user-level supervisor fail here
        // cleanly, never fall back to a half-working setup.
        ctx.started("systemd_unit");
        if !ssh
            .exec("systemctl --user --version >/dev/null 2>&1")
            .await
            .map_err(|e| ("systemd_unit", e))?
            .success()
        {
            return Err((
                "systemd_unit",
                ProvisionError::Command("host has no user-level systemd".to_string()),
            ));
        }
        let unit = render_unit(&live, &certs_dir, server.id, &self.settings);
        exec_ok(ssh, &format!("mkdir -p {home}/.config/systemd/user"))
            .await
            .map_err(|e| ("systemd_unit", e))?;
        ssh.upload(
            &format!("{home}/.config/systemd/user/caravel-agent.service"),
            unit.as_bytes(),
        )
        .await
        .map_err(|e| ("systemd_unit", e))?;
        ctx.ok("systemd_unit", "unit installed");

        // start_agent
        ctx.started("start_agent");
        exec_ok(
            ssh,
            "systemctl --user daemon-reload && systemctl --user enable --now caravel-agent",
        )
        .await
        .map_err(|e| ("start_agent", e))?;
        ctx.ok("start_agent", "agent started");

        Ok(())
    }
}

async fn exec_ok(ssh: &dyn SshTransport, command: &str) -> Result<SshOutput, ProvisionError> {
    let output = ssh.exec(command).await?;
    if !output.success() {
        return Err(ProvisionError::Command(format!(
            "`{command}` exited {}: {}",
            output.exit_code,
            if output.stderr.is_empty() { &output.stdout } else { &output.stderr }
        )));
    }
    Ok(output)
}

/// User-level supervisor unit re-executing the agent with its certs.
fn render_unit(
    binary_path: &str,
    certs_dir: &str,
    server_id: ServerId,
    settings: &ProvisionerSettings,
) -> String {
    format!(
        "[Unit]\n\
         Description=Caravel agent\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={binary_path} \
         --server-addr {plane} \
         --server-id {server_id} \
         --ca-cert {certs_dir}/ca.crt \
         --cert {certs_dir}/agent.crt \
         --key {certs_dir}/agent.key \
         --agent-port {agent_port}\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        plane = settings.plane_addr,
        agent_port = settings.agent_port,
    )
}
