//! Deploy engine integration tests over real repositories (in-memory
//! SQLite) and a scripted agent gateway.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use caravel::application::deploy_engine::{DeployEngine, DeployRequest};
use caravel::application::gateway::AgentGateway;
use caravel::domain::error::ControlError;
use caravel::domain::models::config::{DeployConfig, HealthConfig};
use caravel::domain::models::{
    App, Deployment, DeploymentId, DeploymentStatus, EventFilter, Server, ServerStatus,
    SshCredentials, Topic,
};
use caravel::domain::ports::{AppRepository, DeploymentRepository, ServerRepository};
use caravel::infrastructure::control::{DeployOutcome, DeploySpec};
use caravel::infrastructure::database::{
    AppRepositoryImpl, DatabaseConnection, DeploymentRepositoryImpl, ServerRepositoryImpl,
};
use caravel::services::{AgentHub, EventFabric, Locker};

/// Scripted gateway: records specs, emits canned log lines, optionally
/// delays so concurrency is observable.
struct ScriptedGateway {
    /// Outcome per call, in order; the last entry repeats.
    outcomes: Mutex<Vec<DeployOutcome>>,
    specs: Mutex<Vec<DeploySpec>>,
    log_lines: Vec<String>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedGateway {
    fn new(outcomes: Vec<DeployOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            specs: Mutex::new(Vec::new()),
            log_lines: vec!["cloning".to_string(), "building".to_string()],
            delay: Duration::from_millis(50),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn ok_outcome(tag: &str) -> DeployOutcome {
        DeployOutcome {
            success: true,
            error: None,
            image_tag: Some(tag.to_string()),
            logs: String::new(),
        }
    }

    fn failed_outcome(message: &str) -> DeployOutcome {
        DeployOutcome {
            success: false,
            error: Some(message.to_string()),
            image_tag: None,
            logs: String::new(),
        }
    }

    fn specs(&self) -> Vec<DeploySpec> {
        self.specs.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentGateway for ScriptedGateway {
    async fn execute_deploy(
        &self,
        _server: &Server,
        _agent_port: u16,
        spec: DeploySpec,
        _timeout: Duration,
    ) -> Result<DeployOutcome, ControlError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.specs.lock().unwrap().push(spec);
        let mut outcomes = self.outcomes.lock().unwrap();
        let outcome = if outcomes.len() > 1 {
            outcomes.remove(0)
        } else {
            outcomes
                .first()
                .cloned()
                .unwrap_or_else(|| Self::ok_outcome("sha-default"))
        };
        Ok(outcome)
    }

    async fn open_deploy_logs(
        &self,
        _server: &Server,
        _agent_port: u16,
        _deployment_id: DeploymentId,
    ) -> Result<mpsc::Receiver<String>, ControlError> {
        let (tx, rx) = mpsc::channel(16);
        let lines = self.log_lines.clone();
        tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

struct Harness {
    engine: Arc<DeployEngine>,
    apps: Arc<AppRepositoryImpl>,
    deployments: Arc<DeploymentRepositoryImpl>,
    fabric: Arc<EventFabric>,
    gateway: Arc<ScriptedGateway>,
    /// Port of the mock health endpoint; apps publish on it.
    port: u16,
    _health_server: mockito::ServerGuard,
    _locks_dir: tempfile::TempDir,
}

async fn harness(gateway: Arc<ScriptedGateway>, workers: usize) -> Harness {
    // A mock HTTP endpoint stands in for the app's public health URL.
    let mut health_server = mockito::Server::new_async().await;
    health_server
        .mock("GET", "/health")
        .with_status(200)
        .expect_at_least(0)
        .create_async()
        .await;
    let health_addr = health_server.host_with_port();
    let (health_host, health_port) = health_addr.rsplit_once(':').unwrap();

    let db = DatabaseConnection::new("sqlite::memory:", 1).await.unwrap();
    db.migrate().await.unwrap();
    let apps = Arc::new(AppRepositoryImpl::new(db.pool().clone()));
    let deployments = Arc::new(DeploymentRepositoryImpl::new(db.pool().clone()));
    let servers = Arc::new(ServerRepositoryImpl::new(db.pool().clone()));

    // One online server whose host is the mock health endpoint.
    let mut server = Server::new(
        health_host,
        "deploy",
        SshCredentials::Password { password: "x".into() },
    );
    server.status = ServerStatus::Online;
    servers.create(&server).await.unwrap();
    servers
        .touch_heartbeat(server.id, chrono::Utc::now())
        .await
        .unwrap();
    let hub = Arc::new(AgentHub::default());
    hub.touch(server.id);

    let locks_dir = tempfile::tempdir().unwrap();
    let locker = Arc::new(Locker::open(locks_dir.path()).unwrap());
    let fabric = Arc::new(EventFabric::new());

    let config = DeployConfig {
        workers,
        timeout_secs: 30,
        log_cap_bytes: 1024 * 1024,
    };
    let engine = Arc::new(DeployEngine::new(
        config,
        HealthConfig { timeout_secs: 5, interval_secs: 1, retries: 2 },
        50052,
        apps.clone(),
        deployments.clone(),
        servers,
        hub,
        locker,
        gateway.clone(),
        fabric.clone(),
    ));
    engine.start();

    Harness {
        engine,
        apps,
        deployments,
        fabric,
        gateway,
        port: health_port.parse().unwrap(),
        _health_server: health_server,
        _locks_dir: locks_dir,
    }
}

async fn make_app(harness: &Harness, name: &str) -> App {
    let mut app = App::new(name, "https://git.example/app.git", "main");
    app.config.host_port = harness.port;
    app.config.health.path = "/health".to_string();
    app.config.health.timeout_secs = 5;
    app.config.health.interval_secs = 1;
    app.config.health.retries = 2;
    harness.apps.create(&app).await.unwrap();
    app
}

async fn wait_terminal(
    deployments: &DeploymentRepositoryImpl,
    id: DeploymentId,
) -> Deployment {
    for _ in 0..200 {
        let row = deployments.get(id).await.unwrap().unwrap();
        if row.status.is_terminal() {
            return row;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("deployment {id} never reached a terminal state");
}

#[tokio::test]
async fn test_happy_path_deploy_emits_ordered_events() {
    // Scenario: one app, one online server, a deploy that builds and
    // passes health; events must arrive running → log → success.
    let gateway = Arc::new(ScriptedGateway::new(vec![ScriptedGateway::ok_outcome("sha-bbb")]));
    let harness = harness(gateway, 2).await;
    let app = make_app(&harness, "app-1").await;

    let mut sub = harness.fabric.subscribe(EventFilter::topics([
        Topic::DeployRunning,
        Topic::DeployLog,
        Topic::DeploySuccess,
        Topic::DeployFailed,
    ]));

    let id = harness
        .engine
        .enqueue(DeployRequest {
            app_id: app.id,
            commit_sha: "bbbbbbbbbbbb".into(),
            commit_message: "feature".into(),
        })
        .await
        .unwrap();

    let row = wait_terminal(&harness.deployments, id).await;
    assert_eq!(row.status, DeploymentStatus::Success);
    assert_eq!(row.current_image_tag.as_deref(), Some("sha-bbb"));
    assert!(row.finished_at.unwrap() >= row.started_at.unwrap());
    assert!(row.logs.contains("cloning"));

    // last_deployed_at was written.
    let app_row = harness.apps.get(app.id).await.unwrap().unwrap();
    assert!(app_row.last_deployed_at.is_some());

    // Event ordering: running first, success last, at least one log line
    // in between. Allow the tail of the publish pipeline to settle.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut kinds = Vec::new();
    while let Some(delivery) = sub.try_next() {
        kinds.push(delivery.event.topic());
    }
    assert_eq!(kinds.first(), Some(&Topic::DeployRunning));
    assert_eq!(kinds.last(), Some(&Topic::DeploySuccess));
    assert!(kinds.iter().filter(|t| **t == Topic::DeployLog).count() >= 1);
    assert!(!kinds.contains(&Topic::DeployFailed));
}

#[tokio::test]
async fn test_agent_failure_rolls_back_and_fails() {
    // First deploy succeeds establishing a previous image; the second
    // fails on the agent and must dispatch a rollback to that image.
    let gateway = Arc::new(ScriptedGateway::new(vec![
        ScriptedGateway::ok_outcome("sha-aaa"),
        ScriptedGateway::failed_outcome("build exploded"),
        ScriptedGateway::ok_outcome("sha-aaa"), // rollback call
    ]));
    let harness = harness(gateway.clone(), 2).await;
    let app = make_app(&harness, "app-1").await;

    let first = harness
        .engine
        .enqueue(DeployRequest {
            app_id: app.id,
            commit_sha: "aaaaaaaaaaaa".into(),
            commit_message: "v1".into(),
        })
        .await
        .unwrap();
    let first_row = wait_terminal(&harness.deployments, first).await;
    assert_eq!(first_row.status, DeploymentStatus::Success);
    let deployed_at_before = harness.apps.get(app.id).await.unwrap().unwrap().last_deployed_at;

    let mut sub = harness.fabric.subscribe(EventFilter::topics([
        Topic::DeploySuccess,
        Topic::DeployFailed,
    ]));

    let second = harness
        .engine
        .enqueue(DeployRequest {
            app_id: app.id,
            commit_sha: "bbbbbbbbbbbb".into(),
            commit_message: "v2".into(),
        })
        .await
        .unwrap();
    let second_row = wait_terminal(&harness.deployments, second).await;
    assert_eq!(second_row.status, DeploymentStatus::Failed);
    assert!(second_row.error_message.unwrap().contains("build exploded"));
    assert_eq!(second_row.previous_image_tag.as_deref(), Some("sha-aaa"));

    // The rollback call targeted the previous image with no rebuild.
    let specs = gateway.specs();
    let rollback = specs.last().unwrap();
    assert_eq!(rollback.rollback_to.as_deref(), Some("sha-aaa"));

    // Failure is the terminal event; last_deployed_at is unchanged.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut saw_failed = false;
    while let Some(delivery) = sub.try_next() {
        saw_failed = delivery.event.topic() == Topic::DeployFailed;
    }
    assert!(saw_failed);
    let deployed_at_after = harness.apps.get(app.id).await.unwrap().unwrap().last_deployed_at;
    assert_eq!(deployed_at_before, deployed_at_after);
}

#[tokio::test]
async fn test_health_check_failure_triggers_rollback() {
    // The agent reports success but the container never answers 2xx on
    // its health path; the engine must roll back to the previous image
    // and record a health-check failure.
    let gateway = Arc::new(ScriptedGateway::new(vec![
        ScriptedGateway::ok_outcome("sha-aaa"),
        ScriptedGateway::ok_outcome("sha-bbb"),
        ScriptedGateway::ok_outcome("sha-aaa"), // rollback call
    ]));
    let harness = harness(gateway.clone(), 2).await;
    let app = make_app(&harness, "app-1").await;

    let first = harness
        .engine
        .enqueue(DeployRequest {
            app_id: app.id,
            commit_sha: "aaaaaaaaaaaa".into(),
            commit_message: "v1".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        wait_terminal(&harness.deployments, first).await.status,
        DeploymentStatus::Success
    );
    let deployed_at_before = harness.apps.get(app.id).await.unwrap().unwrap().last_deployed_at;

    // Point the app at a path the health endpoint does not serve.
    let mut broken = harness.apps.get(app.id).await.unwrap().unwrap();
    broken.config.health.path = "/does-not-exist".to_string();
    broken.config.health.timeout_secs = 3;
    broken.config.health.retries = 2;
    harness.apps.update_config(app.id, &broken.config).await.unwrap();

    let second = harness
        .engine
        .enqueue(DeployRequest {
            app_id: app.id,
            commit_sha: "bbbbbbbbbbbb".into(),
            commit_message: "v2".into(),
        })
        .await
        .unwrap();
    let row = wait_terminal(&harness.deployments, second).await;
    assert_eq!(row.status, DeploymentStatus::Failed);
    assert!(row.error_message.unwrap().contains("health check"));

    // Rollback went to the previously successful image.
    let specs = gateway.specs();
    assert_eq!(specs.last().unwrap().rollback_to.as_deref(), Some("sha-aaa"));

    // The failed deploy did not move last_deployed_at.
    let deployed_at_after = harness.apps.get(app.id).await.unwrap().unwrap().last_deployed_at;
    assert_eq!(deployed_at_before, deployed_at_after);
}

#[tokio::test]
async fn test_concurrent_intents_for_same_app_cancel_second() {
    // Webhook storm: two intents for the same app within milliseconds.
    // Exactly one runs; the other is cancelled with a lock-held message.
    let gateway = Arc::new(ScriptedGateway::new(vec![ScriptedGateway::ok_outcome("sha-x")]));
    let harness = harness(gateway, 2).await;
    let app = make_app(&harness, "app-1").await;

    let first = harness
        .engine
        .enqueue(DeployRequest {
            app_id: app.id,
            commit_sha: "111111111111".into(),
            commit_message: "one".into(),
        })
        .await
        .unwrap();
    let second = harness
        .engine
        .enqueue(DeployRequest {
            app_id: app.id,
            commit_sha: "222222222222".into(),
            commit_message: "two".into(),
        })
        .await
        .unwrap();

    let first_row = wait_terminal(&harness.deployments, first).await;
    let second_row = wait_terminal(&harness.deployments, second).await;

    let statuses = [first_row.status, second_row.status];
    assert!(statuses.contains(&DeploymentStatus::Success));
    assert!(statuses.contains(&DeploymentStatus::Cancelled));
    let cancelled = if first_row.status == DeploymentStatus::Cancelled {
        first_row
    } else {
        second_row
    };
    assert!(cancelled.error_message.unwrap().contains("lock held"));
}

#[tokio::test]
async fn test_deploys_for_different_apps_run_in_parallel() {
    let gateway = Arc::new(ScriptedGateway::new(vec![ScriptedGateway::ok_outcome("sha-x")]));
    let harness = harness(gateway.clone(), 2).await;
    let app_a = make_app(&harness, "app-a").await;
    let app_b = make_app(&harness, "app-b").await;

    let a = harness
        .engine
        .enqueue(DeployRequest {
            app_id: app_a.id,
            commit_sha: "aaaaaaaaaaaa".into(),
            commit_message: String::new(),
        })
        .await
        .unwrap();
    let b = harness
        .engine
        .enqueue(DeployRequest {
            app_id: app_b.id,
            commit_sha: "bbbbbbbbbbbb".into(),
            commit_message: String::new(),
        })
        .await
        .unwrap();

    let row_a = wait_terminal(&harness.deployments, a).await;
    let row_b = wait_terminal(&harness.deployments, b).await;
    assert_eq!(row_a.status, DeploymentStatus::Success);
    assert_eq!(row_b.status, DeploymentStatus::Success);

    // Both were in flight together at some point, and never more than the
    // worker count.
    assert!(harness.gateway.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_enqueue_for_missing_app_fails_fast() {
    let gateway = Arc::new(ScriptedGateway::new(vec![]));
    let harness = harness(gateway, 2).await;
    let missing = caravel::domain::models::AppId::new();
    let result = harness
        .engine
        .enqueue(DeployRequest {
            app_id: missing,
            commit_sha: "dead".into(),
            commit_message: String::new(),
        })
        .await;
    assert!(result.is_err());
}
