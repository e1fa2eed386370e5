//! Event model for the fabric.
//!
//! Every event is tagged with its topic, carries the key it targets (an app
//! or a server) and a timestamp assigned at construction. The enum is closed:
//! adding a topic is a compile-checked change everywhere events are routed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AppId, DeploymentId, ServerId};

/// Outcome of a single provisioning or update step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Started,
    Ok,
    Skipped,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Ok => write!(f, "ok"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Topic an event belongs to; the subscription key of the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    DeployRunning,
    DeploySuccess,
    DeployFailed,
    DeployLog,
    ContainerHealth,
    ProvisionStep,
    ProvisionLog,
    ProvisionCompleted,
    ProvisionFailed,
    AgentUpdateStep,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeployRunning => "deploy-running",
            Self::DeploySuccess => "deploy-success",
            Self::DeployFailed => "deploy-failed",
            Self::DeployLog => "deploy-log",
            Self::ContainerHealth => "container-health",
            Self::ProvisionStep => "provision-step",
            Self::ProvisionLog => "provision-log",
            Self::ProvisionCompleted => "provision-completed",
            Self::ProvisionFailed => "provision-failed",
            Self::AgentUpdateStep => "agent-update-step",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "deploy-running" => Some(Self::DeployRunning),
            "deploy-success" => Some(Self::DeploySuccess),
            "deploy-failed" => Some(Self::DeployFailed),
            "deploy-log" => Some(Self::DeployLog),
            "container-health" => Some(Self::ContainerHealth),
            "provision-step" => Some(Self::ProvisionStep),
            "provision-log" => Some(Self::ProvisionLog),
            "provision-completed" => Some(Self::ProvisionCompleted),
            "provision-failed" => Some(Self::ProvisionFailed),
            "agent-update-step" => Some(Self::AgentUpdateStep),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event published into the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    DeployRunning {
        app_id: AppId,
        deployment_id: DeploymentId,
        timestamp: DateTime<Utc>,
    },
    DeploySuccess {
        app_id: AppId,
        deployment_id: DeploymentId,
        image_tag: String,
        timestamp: DateTime<Utc>,
    },
    DeployFailed {
        app_id: AppId,
        deployment_id: DeploymentId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    DeployLog {
        app_id: AppId,
        deployment_id: DeploymentId,
        line: String,
        timestamp: DateTime<Utc>,
    },
    ContainerHealth {
        app_id: AppId,
        healthy: bool,
        detail: String,
        timestamp: DateTime<Utc>,
    },
    ProvisionStep {
        server_id: ServerId,
        step: String,
        status: StepStatus,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ProvisionLog {
        server_id: ServerId,
        line: String,
        timestamp: DateTime<Utc>,
    },
    ProvisionCompleted {
        server_id: ServerId,
        timestamp: DateTime<Utc>,
    },
    ProvisionFailed {
        server_id: ServerId,
        step: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    AgentUpdateStep {
        server_id: ServerId,
        step: String,
        status: StepStatus,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn deploy_running(app_id: AppId, deployment_id: DeploymentId) -> Self {
        Self::DeployRunning { app_id, deployment_id, timestamp: Utc::now() }
    }

    pub fn deploy_success(app_id: AppId, deployment_id: DeploymentId, image_tag: impl Into<String>) -> Self {
        Self::DeploySuccess { app_id, deployment_id, image_tag: image_tag.into(), timestamp: Utc::now() }
    }

    pub fn deploy_failed(app_id: AppId, deployment_id: DeploymentId, error: impl Into<String>) -> Self {
        Self::DeployFailed { app_id, deployment_id, error: error.into(), timestamp: Utc::now() }
    }

    pub fn deploy_log(app_id: AppId, deployment_id: DeploymentId, line: impl Into<String>) -> Self {
        Self::DeployLog { app_id, deployment_id, line: line.into(), timestamp: Utc::now() }
    }

    pub fn container_health(app_id: AppId, healthy: bool, detail: impl Into<String>) -> Self {
        Self::ContainerHealth { app_id, healthy, detail: detail.into(), timestamp: Utc::now() }
    }

    pub fn provision_step(
        server_id: ServerId,
        step: impl Into<String>,
        status: StepStatus,
        message: impl Into<String>,
    ) -> Self {
        Self::ProvisionStep { server_id, step: step.into(), status, message: message.into(), timestamp: Utc::now() }
    }

    pub fn provision_log(server_id: ServerId, line: impl Into<String>) -> Self {
        Self::ProvisionLog { server_id, line: line.into(), timestamp: Utc::now() }
    }

    pub fn provision_completed(server_id: ServerId) -> Self {
        Self::ProvisionCompleted { server_id, timestamp: Utc::now() }
    }

    pub fn provision_failed(server_id: ServerId, step: impl Into<String>, error: impl Into<String>) -> Self {
        Self::ProvisionFailed { server_id, step: step.into(), error: error.into(), timestamp: Utc::now() }
    }

    pub fn agent_update_step(
        server_id: ServerId,
        step: impl Into<String>,
        status: StepStatus,
        message: impl Into<String>,
    ) -> Self {
        Self::AgentUpdateStep { server_id, step: step.into(), status, message: message.into(), timestamp: Utc::now() }
    }

    /// Topic this event is published under.
    pub fn topic(&self) -> Topic {
        match self {
            Self::DeployRunning { .. } => Topic::DeployRunning,
            Self::DeploySuccess { .. } => Topic::DeploySuccess,
            Self::DeployFailed { .. } => Topic::DeployFailed,
            Self::DeployLog { .. } => Topic::DeployLog,
            Self::ContainerHealth { .. } => Topic::ContainerHealth,
            Self::ProvisionStep { .. } => Topic::ProvisionStep,
            Self::ProvisionLog { .. } => Topic::ProvisionLog,
            Self::ProvisionCompleted { .. } => Topic::ProvisionCompleted,
            Self::ProvisionFailed { .. } => Topic::ProvisionFailed,
            Self::AgentUpdateStep { .. } => Topic::AgentUpdateStep,
        }
    }

    /// App this event targets, if any.
    pub fn app_id(&self) -> Option<AppId> {
        match self {
            Self::DeployRunning { app_id, .. }
            | Self::DeploySuccess { app_id, .. }
            | Self::DeployFailed { app_id, .. }
            | Self::DeployLog { app_id, .. }
            | Self::ContainerHealth { app_id, .. } => Some(*app_id),
            _ => None,
        }
    }

    /// Server this event targets, if any.
    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            Self::ProvisionStep { server_id, .. }
            | Self::ProvisionLog { server_id, .. }
            | Self::ProvisionCompleted { server_id, .. }
            | Self::ProvisionFailed { server_id, .. }
            | Self::AgentUpdateStep { server_id, .. } => Some(*server_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::DeployRunning { timestamp, .. }
            | Self::DeploySuccess { timestamp, .. }
            | Self::DeployFailed { timestamp, .. }
            | Self::DeployLog { timestamp, .. }
            | Self::ContainerHealth { timestamp, .. }
            | Self::ProvisionStep { timestamp, .. }
            | Self::ProvisionLog { timestamp, .. }
            | Self::ProvisionCompleted { timestamp, .. }
            | Self::ProvisionFailed { timestamp, .. }
            | Self::AgentUpdateStep { timestamp, .. } => *timestamp,
        }
    }
}

/// Subscription filter: topics to include and an optional target key.
///
/// An empty topic set matches every topic.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub topics: Vec<Topic>,
    pub app_id: Option<AppId>,
    pub server_id: Option<ServerId>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn topic(topic: Topic) -> Self {
        Self { topics: vec![topic], ..Self::default() }
    }

    pub fn topics(topics: impl IntoIterator<Item = Topic>) -> Self {
        Self { topics: topics.into_iter().collect(), ..Self::default() }
    }

    pub fn for_app(mut self, app_id: AppId) -> Self {
        self.app_id = Some(app_id);
        self
    }

    pub fn for_server(mut self, server_id: ServerId) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.topics.is_empty() && !self.topics.contains(&event.topic()) {
            return false;
        }
        if let Some(app_id) = self.app_id {
            if event.app_id() != Some(app_id) {
                return false;
            }
        }
        if let Some(server_id) = self.server_id {
            if event.server_id() != Some(server_id) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_kebab_case_tag() {
        let event = Event::deploy_running(AppId::new(), DeploymentId::new());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deploy-running");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_filter_matches_topic_and_key() {
        let app = AppId::new();
        let other = AppId::new();
        let event = Event::deploy_log(app, DeploymentId::new(), "cloning");

        assert!(EventFilter::all().matches(&event));
        assert!(EventFilter::topic(Topic::DeployLog).for_app(app).matches(&event));
        assert!(!EventFilter::topic(Topic::DeployLog).for_app(other).matches(&event));
        assert!(!EventFilter::topic(Topic::DeployFailed).matches(&event));
    }

    #[test]
    fn test_filter_on_server_key_ignores_app_events() {
        let server = ServerId::new();
        let event = Event::deploy_log(AppId::new(), DeploymentId::new(), "x");
        assert!(!EventFilter::all().for_server(server).matches(&event));
    }
}
