//! Domain error types.
//!
//! Each enum covers one component, built with thiserror so the causal chain
//! survives wrapping. Predicates like `is_transient` drive the retry
//! decisions spelled out in the error-handling design: transient transport
//! errors may be retried in the updater and the health-check phase, never
//! around ExecuteDeploy itself.

use thiserror::Error;

use crate::domain::models::{AppId, DeploymentId, DeploymentStatus, ServerId};

/// Errors related to database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Database connection could not be established
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Database migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Row not found in query result
    #[error("Row not found")]
    RowNotFound,

    /// Serialization/deserialization of a stored blob failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::RowNotFound,
            other => Self::QueryFailed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<uuid::Error> for DatabaseError {
    fn from(e: uuid::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

/// Errors from the certificate authority.
#[derive(Error, Debug)]
pub enum PkiError {
    #[error("Failed to read CA material: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("Certificate parsing failed: {0}")]
    Parse(String),

    #[error("Certificate chain did not validate: {0}")]
    ChainInvalid(String),

    #[error("CA root is expired or not yet valid")]
    RootOutOfValidity,
}

impl From<rcgen::Error> for PkiError {
    fn from(e: rcgen::Error) -> Self {
        Self::Generation(e.to_string())
    }
}

/// Errors on the control channel, both sides.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Peer chain validated but identity is not acceptable for the surface.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Wire encoding error: {0}")]
    Codec(String),

    #[error("RPC timed out after {0} seconds")]
    Timeout(u64),

    /// Stream or connection ended before the exchange completed.
    #[error("Connection closed mid-exchange")]
    ClosedEarly,

    /// The remote handler reported a failure.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("RPC was cancelled")]
    Cancelled,
}

impl ControlError {
    /// Transient errors may be retried where the design allows it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_) | Self::ClosedEarly)
    }
}

/// Errors from the per-app lock table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Acquisition on a held key fails immediately; the caller must not wait.
    #[error("lock held for app {0}")]
    Held(AppId),

    #[error("release of unknown lock for app {0}")]
    NotHeld(AppId),

    #[error("lock sentinel error: {0}")]
    Sentinel(String),
}

/// Errors from external process execution.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Deadline fired; the process was killed. Partial output is preserved.
    #[error("{program} timed out after {timeout_secs}s")]
    Timeout {
        program: String,
        timeout_secs: u64,
        partial_stdout: String,
        partial_stderr: String,
    },

    #[error("{program} exited with status {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The caller's cancellation handle fired; the process was killed.
    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

/// Errors from the provisioning pipeline.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("SSH authentication failed: {0}")]
    Auth(String),

    #[error("Remote command failed: {0}")]
    Command(String),

    #[error("SFTP transfer failed: {0}")]
    Sftp(String),

    #[error("Step {step} failed for server {server_id}: {message}")]
    Step {
        server_id: ServerId,
        step: String,
        message: String,
    },

    #[error(transparent)]
    Pki(#[from] PkiError),
}

/// Errors from the agent self-update path.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Failed to stage new binary: {0}")]
    Io(#[from] std::io::Error),

    #[error("Update token rejected")]
    TokenRejected,
}

impl UpdateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Download(_))
    }
}

/// Errors surfaced by the deploy engine.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("App {0} not found")]
    AppNotFound(AppId),

    #[error("Deployment {0} not found")]
    DeploymentNotFound(DeploymentId),

    #[error("No online server available for app {0}")]
    NoServer(AppId),

    /// Another deploy for the same app holds the lock; intent is cancelled.
    #[error("lock held: another deploy is in flight for app {0}")]
    LockHeld(AppId),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("Deploy deadline of {0}s exceeded")]
    DeadlineExceeded(u64),

    /// Agent reply carried success=false or an error message.
    #[error("agent failure: {0}")]
    Agent(String),

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Errors from the HTTP health prober.
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("probe request failed: {0}")]
    Request(String),

    #[error("non-success status {0}")]
    BadStatus(u16),

    #[error("health deadline of {0}s exceeded")]
    DeadlineExceeded(u64),

    #[error("check cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_transience_classification() {
        assert!(ControlError::Timeout(30).is_transient());
        assert!(ControlError::ClosedEarly.is_transient());
        assert!(!ControlError::Unauthenticated("bad OU".into()).is_transient());
        assert!(!ControlError::Remote("build failed".into()).is_transient());
    }

    #[test]
    fn test_lock_held_message_names_the_app() {
        let app = AppId::new();
        let msg = LockError::Held(app).to_string();
        assert!(msg.contains("lock held"));
        assert!(msg.contains(&app.to_string()));
    }
}
