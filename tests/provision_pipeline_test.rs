//! Provisioner pipeline tests against a scripted SSH transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use caravel::application::provisioner::{Provisioner, ProvisionerSettings};
use caravel::domain::error::ProvisionError;
use caravel::domain::models::{
    Event, EventFilter, Server, ServerStatus, SshCredentials, StepStatus, Topic,
};
use caravel::domain::ports::ServerRepository;
use caravel::infrastructure::database::{DatabaseConnection, ServerRepositoryImpl};
use caravel::infrastructure::pki::CertificateAuthority;
use caravel::infrastructure::ssh::{SshConnector, SshOutput, SshTransport};
use caravel::services::{EventFabric, Subscription};

/// Scripted host: every exec succeeds (with docker/traefik reported
/// present), uploads are recorded, and one path can be poisoned to fail.
#[derive(Default)]
struct FakeHost {
    execs: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
    fail_upload_containing: Option<String>,
}

struct FakeTransport {
    host: Arc<FakeHost>,
}

#[async_trait]
impl SshTransport for FakeTransport {
    async fn exec(&self, command: &str) -> Result<SshOutput, ProvisionError> {
        self.host.execs.lock().unwrap().push(command.to_string());
        let stdout = if command.contains("$HOME") {
            "/home/deploy\nLinux\nx86_64\n".to_string()
        } else if command.contains("--filter name=traefik") {
            "traefik\n".to_string()
        } else {
            String::new()
        };
        Ok(SshOutput { stdout, stderr: String::new(), exit_code: 0 })
    }

    async fn upload(&self, remote_path: &str, _data: &[u8]) -> Result<(), ProvisionError> {
        if let Some(needle) = &self.host.fail_upload_containing {
            if remote_path.contains(needle) {
                return Err(ProvisionError::Sftp(format!("{remote_path}: connection reset")));
            }
        }
        self.host.uploads.lock().unwrap().push(remote_path.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), ProvisionError> {
        Ok(())
    }
}

struct FakeConnector {
    host: Arc<FakeHost>,
}

#[async_trait]
impl SshConnector for FakeConnector {
    async fn connect(&self, _server: &Server) -> Result<Box<dyn SshTransport>, ProvisionError> {
        Ok(Box::new(FakeTransport { host: Arc::clone(&self.host) }))
    }
}

struct Setup {
    provisioner: Provisioner,
    servers: Arc<ServerRepositoryImpl>,
    server: Server,
    host: Arc<FakeHost>,
    events: Subscription,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

async fn setup(host: FakeHost) -> Setup {
    let pki_dir = tempfile::tempdir().unwrap();
    let ca = Arc::new(CertificateAuthority::open(pki_dir.path()).unwrap());

    let binary_dir = tempfile::tempdir().unwrap();
    let binary_path = binary_dir.path().join("caravel-agent");
    std::fs::write(&binary_path, b"fake agent binary").unwrap();

    let db = DatabaseConnection::new("sqlite::memory:", 1).await.unwrap();
    db.migrate().await.unwrap();
    let servers = Arc::new(ServerRepositoryImpl::new(db.pool().clone()));
    let mut server = Server::new(
        "203.0.113.7",
        "deploy",
        SshCredentials::Password { password: "secret".into() },
    );
    server.acme_email = "ops@example.com".to_string();
    servers.create(&server).await.unwrap();

    let fabric = Arc::new(EventFabric::with_capacity(512));
    let events = fabric.subscribe(EventFilter::topics([
        Topic::ProvisionStep,
        Topic::ProvisionLog,
        Topic::ProvisionCompleted,
        Topic::ProvisionFailed,
    ]));

    let host = Arc::new(host);
    let provisioner = Provisioner::new(
        Arc::new(FakeConnector { host: Arc::clone(&host) }),
        ca,
        servers.clone(),
        fabric,
        ProvisionerSettings {
            agent_binary_path: binary_path.to_string_lossy().into_owned(),
            plane_addr: "plane.example:50051".to_string(),
            agent_port: 50052,
        },
    );

    Setup { provisioner, servers, server, host, events, _dirs: (pki_dir, binary_dir) }
}

fn drain(events: &mut Subscription) -> Vec<Event> {
    let mut out = Vec::new();
    while let Some(delivery) = events.try_next() {
        out.push(delivery.event);
    }
    out
}

#[tokio::test]
async fn test_happy_path_reaches_completed_with_ordered_steps() {
    let mut setup = setup(FakeHost::default()).await;
    setup.provisioner.provision(&setup.server).await.unwrap();

    let events = drain(&mut setup.events);
    assert!(matches!(events.last(), Some(Event::ProvisionCompleted { .. })));

    // Steps that ran, in emission order.
    let ok_steps: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            Event::ProvisionStep { step, status: StepStatus::Ok, .. } => Some(step.clone()),
            _ => None,
        })
        .collect();
    let position = |name: &str| ok_steps.iter().position(|s| s == name);
    assert!(position("ssh_connect").unwrap() < position("remote_env").unwrap());
    assert!(position("agent_certs").unwrap() < position("agent_binary").unwrap());
    assert!(position("agent_binary").unwrap() < position("systemd_unit").unwrap());
    assert!(position("systemd_unit").unwrap() < position("start_agent").unwrap());

    // Traefik was already running, so install is skipped.
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ProvisionStep { step, status: StepStatus::Skipped, .. } if step == "traefik_install"
    )));

    // CA, leaf and key all shipped; the unit file too.
    let uploads = setup.host.uploads.lock().unwrap().clone();
    assert!(uploads.iter().any(|p| p.ends_with("certs/ca.crt")));
    assert!(uploads.iter().any(|p| p.ends_with("certs/agent.crt")));
    assert!(uploads.iter().any(|p| p.ends_with("certs/agent.key")));
    assert!(uploads.iter().any(|p| p.ends_with("caravel-agent.service")));

    // The CA fingerprint was surfaced as a provision log line.
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ProvisionLog { line, .. } if line.contains("ca fingerprint sha256:")
    )));

    // Server stays provisioning until the agent's first Register.
    let row = setup.servers.get(setup.server.id).await.unwrap().unwrap();
    assert_eq!(row.status, ServerStatus::Provisioning);
}

#[tokio::test]
async fn test_sftp_failure_mid_pipeline_fails_at_named_step() {
    // The agent binary upload dies: provision-step(agent_binary, failed)
    // then provision-failed, server row moves to failed, and no
    // provision-completed is ever emitted.
    let mut setup = setup(FakeHost {
        fail_upload_containing: Some("bin/caravel-agent".to_string()),
        ..FakeHost::default()
    })
    .await;

    let result = setup.provisioner.provision(&setup.server).await;
    assert!(result.is_err());

    let events = drain(&mut setup.events);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ProvisionStep { step, status: StepStatus::Failed, .. } if step == "agent_binary"
    )));
    assert!(matches!(
        events.last(),
        Some(Event::ProvisionFailed { step, .. }) if step == "agent_binary"
    ));
    assert!(!events.iter().any(|e| matches!(e, Event::ProvisionCompleted { .. })));

    let row = setup.servers.get(setup.server.id).await.unwrap().unwrap();
    assert_eq!(row.status, ServerStatus::Failed);

    // Earlier steps completed before the failure.
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ProvisionStep { step, status: StepStatus::Ok, .. } if step == "agent_certs"
    )));
}

#[tokio::test]
async fn test_missing_local_binary_fails_agent_binary_step() {
    let mut setup = setup(FakeHost::default()).await;
    // Point at a binary that does not exist.
    let provisioner = Provisioner::new(
        Arc::new(FakeConnector { host: Arc::clone(&setup.host) }),
        Arc::new(CertificateAuthority::open(tempfile::tempdir().unwrap().path()).unwrap()),
        setup.servers.clone(),
        Arc::new(EventFabric::new()),
        ProvisionerSettings {
            agent_binary_path: "/nonexistent/caravel-agent".to_string(),
            plane_addr: "plane.example:50051".to_string(),
            agent_port: 50052,
        },
    );
    assert!(provisioner.provision(&setup.server).await.is_err());
    let row = setup.servers.get(setup.server.id).await.unwrap().unwrap();
    assert_eq!(row.status, ServerStatus::Failed);
}
