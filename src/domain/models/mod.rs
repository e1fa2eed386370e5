//! Domain models for apps, deployments, servers, events and agent commands.

pub mod app;
pub mod command;
pub mod config;
pub mod deployment;
pub mod event;
pub mod ids;
pub mod server;

pub use app::{App, AppConfig, HealthCheckSpec, ResourceLimits};
pub use command::{AgentCommand, AgentCommandKind};
pub use config::Config;
pub use deployment::{Deployment, DeploymentStatus};
pub use event::{Event, EventFilter, StepStatus, Topic};
pub use ids::{AppId, DeploymentId, ServerId};
pub use server::{Server, ServerStatus, SshCredentials};
