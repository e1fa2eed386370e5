//! Agent-side self-update.
//!
//! Token-URL path: GET the payload URL, stream to a temp file in the
//! install dir, verify the byte count, rename over the live binary and let
//! the supervisor relaunch. Push path: receive hex chunks off the control
//! channel, verify size and checksum, same atomic rename. The old binary
//! survives every failure mode because the temp file is discarded on error.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::domain::error::UpdateError;

/// Staged self-replacement of the agent binary.
pub struct SelfUpdater {
    /// Path of the currently running binary, the rename target.
    live_path: PathBuf,
}

impl SelfUpdater {
    pub fn new(live_path: PathBuf) -> Self {
        Self { live_path }
    }

    fn temp_path(&self) -> PathBuf {
        self.live_path.with_extension("update-tmp")
    }

    /// Token-URL variant: download, verify size, atomically swap.
    /// Transient download errors are retried a bounded number of times.
    pub async fn download_and_stage(&self, url: &str) -> Result<u64, UpdateError> {
        let mut last_error = UpdateError::Download("no attempts".to_string());
        for attempt in 1..=3u32 {
            match self.try_download(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() && attempt < 3 => {
                    warn!(attempt, error = %e, "update download failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(2 * u64::from(attempt))).await;
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn try_download(&self, url: &str) -> Result<u64, UpdateError> {
        let response = reqwest::get(url)
            .await
            .map_err(|e| UpdateError::Download(e.to_string()))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(UpdateError::TokenRejected);
        }
        if !response.status().is_success() {
            return Err(UpdateError::Download(format!("status {}", response.status())));
        }
        let expected = response.content_length();

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp).await?;
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpdateError::Download(e.to_string()))?;
            received += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = expected {
            if expected != received {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(UpdateError::SizeMismatch { expected, received });
            }
        }

        self.promote(&temp).await?;
        Ok(received)
    }

    /// Push variant: bytes already assembled by the RPC handler.
    pub async fn stage_bytes(
        &self,
        data: &[u8],
        expected_size: u64,
        expected_sha256_hex: Option<&str>,
    ) -> Result<(), UpdateError> {
        if data.len() as u64 != expected_size {
            return Err(UpdateError::SizeMismatch {
                expected: expected_size,
                received: data.len() as u64,
            });
        }
        if let Some(expected) = expected_sha256_hex {
            let actual = hex::encode(Sha256::digest(data));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(UpdateError::ChecksumMismatch);
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, data).await?;
        self.promote(&temp).await
    }

    /// Atomic rename over the live binary, preserving executable mode.
    async fn promote(&self, temp: &Path) -> Result<(), UpdateError> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(temp, std::fs::Permissions::from_mode(0o755)).await?;
        tokio::fs::rename(temp, &self.live_path).await?;
        info!(path = %self.live_path.display(), "new agent binary staged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_stage_bytes_swaps_binary() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("agent");
        tokio::fs::write(&live, b"old").await.unwrap();

        let updater = SelfUpdater::new(live.clone());
        let payload = b"new-binary".to_vec();
        let sha = hex::encode(Sha256::digest(&payload));
        updater
            .stage_bytes(&payload, payload.len() as u64, Some(&sha))
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&live).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_size_mismatch_preserves_old_binary() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("agent");
        tokio::fs::write(&live, b"old").await.unwrap();

        let updater = SelfUpdater::new(live.clone());
        let err = updater.stage_bytes(b"xyz", 99, None).await.unwrap_err();
        assert!(matches!(err, UpdateError::SizeMismatch { expected: 99, received: 3 }));
        assert_eq!(tokio::fs::read(&live).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_preserves_old_binary() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("agent");
        tokio::fs::write(&live, b"old").await.unwrap();

        let updater = SelfUpdater::new(live.clone());
        let err = updater
            .stage_bytes(b"payload", 7, Some(&"0".repeat(64)))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::ChecksumMismatch));
        assert_eq!(tokio::fs::read(&live).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_download_from_http_endpoint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/agent/binary")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("binary-bytes")
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let live = dir.path().join("agent");
        tokio::fs::write(&live, b"old").await.unwrap();

        let updater = SelfUpdater::new(live.clone());
        let bytes = updater
            .download_and_stage(&format!("{}/agent/binary?token=abc", server.url()))
            .await
            .unwrap();
        assert_eq!(bytes, 12);
        assert_eq!(tokio::fs::read(&live).await.unwrap(), b"binary-bytes");
    }

    #[tokio::test]
    async fn test_unauthorized_download_is_token_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/agent/binary")
            .match_query(mockito::Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let live = dir.path().join("agent");
        tokio::fs::write(&live, b"old").await.unwrap();

        let updater = SelfUpdater::new(live.clone());
        let err = updater
            .download_and_stage(&format!("{}/agent/binary?token=bad", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::TokenRejected));
        assert_eq!(tokio::fs::read(&live).await.unwrap(), b"old");
    }
}
