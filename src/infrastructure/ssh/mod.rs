//! SSH/SFTP transport used by the provisioner.
//!
//! The pipeline talks to a `SshTransport` trait object so its step machine
//! can be exercised against a scripted fake; the russh-backed
//! implementation is the production path.

pub mod client;

use async_trait::async_trait;

use crate::domain::error::ProvisionError;
use crate::domain::models::Server;

pub use client::RusshConnector;

/// Output of one remote command.
#[derive(Debug, Clone)]
pub struct SshOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl SshOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One established SSH session to a host.
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Run a command on the remote host and capture its output.
    async fn exec(&self, command: &str) -> Result<SshOutput, ProvisionError>;

    /// Write `data` to `remote_path` over SFTP, creating or truncating it.
    async fn upload(&self, remote_path: &str, data: &[u8]) -> Result<(), ProvisionError>;

    /// Close the session.
    async fn close(&self) -> Result<(), ProvisionError>;
}

/// Dials SSH sessions; injected into the provisioner.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, server: &Server) -> Result<Box<dyn SshTransport>, ProvisionError>;
}
