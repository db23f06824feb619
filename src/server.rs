//! HTTP server - the Anthropic-facing surface
//!
//! Binds to 127.0.0.1 only (this is a local credential-holding proxy) and
//! exposes the four-endpoint surface an Anthropic-speaking client needs:
//!
//! - `GET  /`                         - status, mode, and role mappings
//! - `GET  /health`                   - liveness
//! - `POST /v1/messages`              - the Messages API, streaming SSE
//! - `POST /v1/messages/count_tokens` - forwarded for native targets,
//!                                      estimated for everything else

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::error::ProxyError;
use crate::router::ProxyRouter;
use crate::tokens::estimate_request_tokens;

/// Reject request bodies beyond this size before JSON parsing; base64
/// image payloads are large but not this large
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ProxyRouter>,
    pub config: Config,
    /// Client for forwarding count_tokens to Anthropic
    client: reqwest::Client,
}

/// Bind the listener: the configured port, or the first free port in the
/// scan range
pub async fn bind(config: &Config) -> Result<(TcpListener, u16)> {
    if let Some(port) = config.port {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind 127.0.0.1:{}", port))?;
        return Ok((listener, port));
    }
    for port in Config::PORT_RANGE {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            return Ok((listener, port));
        }
    }
    anyhow::bail!(
        "no free port in {}..{}",
        Config::PORT_RANGE.start,
        Config::PORT_RANGE.end
    )
}

/// Build the axum application
pub fn app(config: Config, port: u16) -> axum::Router {
    let state = AppState {
        router: Arc::new(ProxyRouter::new(config.clone(), port)),
        config,
        client: crate::transport::cloud_client(),
    };

    axum::Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Start the proxy server
pub async fn start_server(
    config: Config,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let (listener, port) = bind(&config).await?;
    tracing::info!("Proxy listening on 127.0.0.1:{}", port);

    let app = app(config, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Proxy server shut down gracefully");
    Ok(())
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    let mode = if state.config.monitor {
        "monitor"
    } else {
        "proxy"
    };
    Json(json!({
        "status": "ok",
        "mode": mode,
        "mappings": state.router.mappings(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            return ProxyError::BadRequest(format!("request body is not JSON: {}", e))
                .into_response();
        }
    };
    let Some(model) = raw.get("model").and_then(|m| m.as_str()).map(String::from) else {
        return ProxyError::BadRequest("request is missing 'model'".to_string()).into_response();
    };

    let handler = match state.router.handler_for(&model) {
        Ok(handler) => handler,
        Err(error) => return error.into_response(),
    };
    handler.handle(raw, &headers).await
}

async fn count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            return ProxyError::BadRequest(format!("request body is not JSON: {}", e))
                .into_response();
        }
    };
    let model = raw.get("model").and_then(|m| m.as_str()).unwrap_or("");

    if state.router.is_native(model) {
        return forward_count_tokens(&state, &headers, &body).await;
    }

    // Non-Anthropic tokenizers vary; a flat chars/4 estimate is close
    // enough for context gauges
    Json(json!({"input_tokens": estimate_request_tokens(&raw)})).into_response()
}

async fn forward_count_tokens(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    let base = state
        .config
        .env
        .base_url("ANTHROPIC")
        .unwrap_or("https://api.anthropic.com");

    let mut request = state
        .client
        .post(format!("{}/v1/messages/count_tokens", base))
        .header("content-type", "application/json")
        .body(body.to_vec());
    for name in ["x-api-key", "authorization", "anthropic-version", "anthropic-beta"] {
        if let Some(value) = headers.get(name) {
            request = request.header(name, value.as_bytes());
        }
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.bytes().await.unwrap_or_default();
            Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body))
                .unwrap_or_else(|_| {
                    ProxyError::Internal("count_tokens relay failed".to_string()).into_response()
                })
        }
        Err(e) => crate::error::classify_send_error(&e).into_response(),
    }
}
