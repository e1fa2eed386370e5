//! HTTP health probing with retry under a deadline.
//!
//! A single probe is a GET with a 10 second connect/read cap; success is any
//! 2xx response. Two retry shapes are offered: fixed interval under a
//! deadline, and exponential backoff doubling each attempt up to a 30 second
//! cap. Cancellation aborts either immediately.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::error::HealthError;
use crate::domain::models::HealthCheckSpec;

/// Per-probe connect/read cap.
const PROBE_CAP: Duration = Duration::from_secs(10);
/// Ceiling for the doubling backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Retry policy for a health check.
#[derive(Debug, Clone, Copy)]
pub struct ProbePolicy {
    /// Total deadline across all attempts.
    pub timeout: Duration,
    /// Pause between attempts (initial pause for the backoff variant).
    pub interval: Duration,
    /// Attempts before giving up.
    pub retries: u32,
}

impl From<&HealthCheckSpec> for ProbePolicy {
    fn from(spec: &HealthCheckSpec) -> Self {
        Self {
            timeout: Duration::from_secs(spec.timeout_secs),
            interval: Duration::from_secs(spec.interval_secs),
            retries: spec.retries,
        }
    }
}

/// HTTP prober shared by the deploy engine and the agent.
#[derive(Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_CAP)
            .connect_timeout(PROBE_CAP)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn probe_once(&self, url: &str) -> Result<(), HealthError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HealthError::Request(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(HealthError::BadStatus(response.status().as_u16()))
        }
    }

    /// Fixed-interval retry under the policy deadline.
    pub async fn check(
        &self,
        url: &str,
        policy: ProbePolicy,
        cancel: &CancellationToken,
    ) -> Result<(), HealthError> {
        self.check_inner(url, policy, cancel, false).await
    }

    /// Exponential backoff: the pause doubles each attempt, capped at 30s.
    pub async fn check_with_backoff(
        &self,
        url: &str,
        policy: ProbePolicy,
        cancel: &CancellationToken,
    ) -> Result<(), HealthError> {
        self.check_inner(url, policy, cancel, true).await
    }

    async fn check_inner(
        &self,
        url: &str,
        policy: ProbePolicy,
        cancel: &CancellationToken,
        backoff: bool,
    ) -> Result<(), HealthError> {
        let started = Instant::now();
        let mut pause = policy.interval;
        let mut last_error = HealthError::Request("no attempts made".to_string());

        for attempt in 1..=policy.retries.max(1) {
            if cancel.is_cancelled() {
                return Err(HealthError::Cancelled);
            }
            if started.elapsed() >= policy.timeout {
                return Err(HealthError::DeadlineExceeded(policy.timeout.as_secs()));
            }

            let probe = tokio::select! {
                result = self.probe_once(url) => result,
                () = cancel.cancelled() => return Err(HealthError::Cancelled),
            };
            match probe {
                Ok(()) => {
                    debug!(url, attempt, "health probe succeeded");
                    return Ok(());
                }
                Err(e) => {
                    debug!(url, attempt, error = %e, "health probe failed");
                    last_error = e;
                }
            }

            if attempt < policy.retries.max(1) {
                let remaining = policy.timeout.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(HealthError::DeadlineExceeded(policy.timeout.as_secs()));
                }
                let sleep_for = pause.min(remaining);
                tokio::select! {
                    () = tokio::time::sleep(sleep_for) => {}
                    () = cancel.cancelled() => return Err(HealthError::Cancelled),
                }
                if backoff {
                    pause = (pause * 2).min(BACKOFF_CAP);
                }
            }
        }
        Err(last_error)
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_policy(retries: u32) -> ProbePolicy {
        ProbePolicy {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(10),
            retries,
        }
    }

    #[tokio::test]
    async fn test_check_succeeds_on_2xx() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/health").with_status(200).create_async().await;

        let checker = HealthChecker::new();
        let url = format!("{}/health", server.url());
        checker
            .check(&url, quick_policy(3), &CancellationToken::new())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_retries_then_reports_last_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let checker = HealthChecker::new();
        let url = format!("{}/health", server.url());
        let err = checker
            .check(&url, quick_policy(3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::BadStatus(503)));
    }

    #[tokio::test]
    async fn test_backoff_variant_succeeds_on_2xx() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(204).create_async().await;

        let checker = HealthChecker::new();
        let url = format!("{}/health", server.url());
        checker
            .check_with_backoff(&url, quick_policy(3), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_aborts_immediately() {
        let checker = HealthChecker::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = checker
            .check("http://127.0.0.1:1/health", quick_policy(3), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::Cancelled));
    }
}
