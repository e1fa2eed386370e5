//! Router for the plane's HTTP surface.
//!
//! Two endpoints touch the core and are specified here: the single-use
//! tokenized agent-binary download, and server-sent event streams fed by
//! the event fabric.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tracing::{info, warn};

use crate::api::envelope::{ApiErrorCode, Envelope};
use crate::domain::models::{AppId, EventFilter, ServerId, Topic};
use crate::services::{EventFabric, TokenStore};

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct ApiState {
    pub tokens: Arc<TokenStore>,
    pub fabric: Arc<EventFabric>,
    pub agent_binary_path: String,
}

/// Build the router under the configured prefix (e.g. `api/v1`).
pub fn router(prefix: &str, state: ApiState) -> Router {
    let prefix = prefix.trim_matches('/');
    Router::new()
        .route(&format!("/{prefix}/agent/binary"), get(download_agent_binary))
        .route(&format!("/{prefix}/events/:topic"), get(event_stream))
        .with_state(state)
}

fn error_response(code: ApiErrorCode, message: impl Into<String>) -> Response {
    let envelope: Envelope<()> = Envelope::error(code, message);
    (code.http_status(), Json(envelope)).into_response()
}

#[derive(Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    token: String,
}

/// `GET /<prefix>/agent/binary?token=<hex64>` — single-use, 5 minute TTL.
async fn download_agent_binary(
    State(state): State<ApiState>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    if query.token.len() != 64 || !query.token.chars().all(|c| c.is_ascii_hexdigit()) {
        return error_response(ApiErrorCode::InvalidPayload, "malformed download token");
    }
    if !state.tokens.validate(&query.token) {
        warn!("agent binary download with invalid or reused token");
        return error_response(ApiErrorCode::Unauthorized, "invalid or expired token");
    }

    match tokio::fs::read(&state.agent_binary_path).await {
        Ok(bytes) => {
            info!(bytes = bytes.len(), "serving agent binary");
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        "attachment; filename=agent".to_string(),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, path = %state.agent_binary_path, "agent binary unreadable");
            error_response(ApiErrorCode::InternalError, "agent binary unavailable")
        }
    }
}

#[derive(Deserialize)]
struct EventQuery {
    app_id: Option<AppId>,
    server_id: Option<ServerId>,
}

/// `GET /<prefix>/events/<topic>` — server-sent stream of matching events.
/// Each event is a JSON object `{type, timestamp, ...}`; a `dropped` field
/// appears when the subscriber overflowed and lost events.
async fn event_stream(
    State(state): State<ApiState>,
    Path(topic): Path<String>,
    Query(query): Query<EventQuery>,
) -> Response {
    let Some(topic) = Topic::from_str(&topic) else {
        return error_response(ApiErrorCode::NotFound, format!("unknown topic {topic:?}"));
    };

    let mut filter = EventFilter::topic(topic);
    filter.app_id = query.app_id;
    filter.server_id = query.server_id;
    let subscription = state.fabric.subscribe(filter);

    let stream: std::pin::Pin<
        Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>,
    > = Box::pin(futures::stream::unfold(subscription, |mut sub| async move {
        let delivery = sub.next().await?;
        let mut json = match serde_json::to_value(&delivery.event) {
            Ok(json) => json,
            Err(_) => return None,
        };
        if delivery.dropped > 0 {
            if let Some(map) = json.as_object_mut() {
                map.insert("dropped".to_string(), delivery.dropped.into());
            }
        }
        let sse = SseEvent::default().data(json.to_string());
        Some((Ok(sse), sub))
    }));

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_state(binary_path: &str) -> ApiState {
        ApiState {
            tokens: Arc::new(TokenStore::new(Duration::from_secs(300))),
            fabric: Arc::new(EventFabric::new()),
            agent_binary_path: binary_path.to_string(),
        }
    }

    #[tokio::test]
    async fn test_download_rejects_malformed_token() {
        let state = test_state("/nonexistent");
        let response = download_agent_binary(
            State(state),
            Query(DownloadQuery { token: "zz".to_string() }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_download_rejects_unknown_token() {
        let state = test_state("/nonexistent");
        let response = download_agent_binary(
            State(state),
            Query(DownloadQuery { token: "a".repeat(64) }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_download_serves_binary_once_per_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent");
        tokio::fs::write(&path, b"fake-binary").await.unwrap();

        let state = test_state(path.to_str().unwrap());
        let token = state.tokens.issue();

        let first = download_agent_binary(
            State(state.clone()),
            Query(DownloadQuery { token: token.clone() }),
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);
        let disposition = first
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("filename=agent"));

        // Single use: the same token is now unauthorized.
        let second = download_agent_binary(State(state), Query(DownloadQuery { token })).await;
        assert_eq!(second.status(), StatusCode::UNAUTHORIZED);
    }
}
