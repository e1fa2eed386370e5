//! russh-backed SSH transport.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::ChannelMsg;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::error::ProvisionError;
use crate::domain::models::{Server, SshCredentials};
use crate::infrastructure::ssh::{SshConnector, SshOutput, SshTransport};

struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Hosts are enrolled by the operator with credentials in hand; there
        // is no prior known_hosts entry to pin against on first contact.
        Ok(true)
    }
}

/// Production connector dialing real hosts with russh.
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, server: &Server) -> Result<Box<dyn SshTransport>, ProvisionError> {
        let config = Arc::new(client::Config::default());
        let addr = (server.host.as_str(), server.ssh_port);
        let mut handle = client::connect(config, addr, AcceptingHandler)
            .await
            .map_err(|e| ProvisionError::Connect(format!("{}:{}: {e}", server.host, server.ssh_port)))?;

        let authenticated = match &server.credentials {
            SshCredentials::Password { password } => handle
                .authenticate_password(&server.install_user, password)
                .await
                .map_err(|e| ProvisionError::Auth(e.to_string()))?,
            SshCredentials::PrivateKey { key_pem } => {
                let key = decode_secret_key(key_pem, None)
                    .map_err(|e| ProvisionError::Auth(format!("bad private key: {e}")))?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| ProvisionError::Auth(e.to_string()))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        &server.install_user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
                    .map_err(|e| ProvisionError::Auth(e.to_string()))?
            }
        };
        if !matches!(authenticated, russh::client::AuthResult::Success) {
            return Err(ProvisionError::Auth(format!(
                "authentication rejected for user {}",
                server.install_user
            )));
        }

        debug!(host = %server.host, user = %server.install_user, "ssh session established");
        Ok(Box::new(RusshTransport { handle }))
    }
}

/// One live russh session.
pub struct RusshTransport {
    handle: client::Handle<AcceptingHandler>,
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn exec(&self, command: &str) -> Result<SshOutput, ProvisionError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ProvisionError::Command(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ProvisionError::Command(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0u32;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = exit_status,
                Some(_) => {}
                None => break,
            }
        }

        Ok(SshOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn upload(&self, remote_path: &str, data: &[u8]) -> Result<(), ProvisionError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ProvisionError::Sftp(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ProvisionError::Sftp(e.to_string()))?;
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ProvisionError::Sftp(e.to_string()))?;

        let mut file = sftp
            .create(remote_path)
            .await
            .map_err(|e| ProvisionError::Sftp(format!("{remote_path}: {e}")))?;
        file.write_all(data)
            .await
            .map_err(|e| ProvisionError::Sftp(format!("{remote_path}: {e}")))?;
        file.shutdown()
            .await
            .map_err(|e| ProvisionError::Sftp(format!("{remote_path}: {e}")))?;
        sftp.close()
            .await
            .map_err(|e| ProvisionError::Sftp(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ProvisionError> {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(error = %e, "ssh disconnect failed");
        }
        Ok(())
    }
}
