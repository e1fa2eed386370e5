//! Caravel - self-hosted PaaS control plane
//!
//! Turns a pool of Linux hosts into a managed deploy fabric:
//! - SSH/SFTP provisioning that installs a per-host agent
//! - mTLS control channel (register, heartbeat, deploys, container ops)
//! - Bounded deploy engine with per-app serialization and rollback
//! - Event fabric streaming deploy/provision/update progress to the UI

pub mod api;
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use infrastructure::database::DatabaseConnection;
