//! Composed request handler
//!
//! A handler binds one Transport + one Adapter + one stream translator
//! (selected by the transport's stream format) + one token strategy, and
//! runs the per-request pipeline:
//!
//! 1. normalize the incoming payload (collecting dropped parameters)
//! 2. reset the adapter, convert messages and tools
//! 3. vision precondition: describe or strip images for non-vision targets
//! 4. build the payload, merge the transport's extra fields
//! 5. adapter's last-chance mutation (tool-name truncation)
//! 6. transport auth refresh (failure = 503 connection_error) and
//!    context-window discovery
//! 7. transport payload envelope
//! 8. dispatch, through the transport's queue when it has one
//! 9. on 401, force-refresh credentials once and retry once
//! 10. stream translation back to the client
//!
//! The handler performs no locking: per-request state is owned here; shared
//! state lives behind the adapter's own maps and the tracker's lock.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode};
use serde_json::Value;

use crate::adapter::Adapter;
use crate::claude::ClaudeRequest;
use crate::error::{classify_send_error, ProxyError};
use crate::stream::{self, StreamContext};
use crate::tracker::TokenTracker;
use crate::transport::Transport;
use crate::vision;

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("transport", &self.transport.name())
            .field("adapter", &self.adapter.name())
            .field("target_model", &self.target_model)
            .finish()
    }
}

pub struct Handler {
    pub transport: Arc<dyn Transport>,
    pub adapter: Arc<dyn Adapter>,
    pub tracker: Arc<TokenTracker>,
    pub target_model: String,
    /// Env override beats discovery; discovery beats the static table
    context_window_override: Option<u64>,
    vision_client: reqwest::Client,
    vision_base_url: String,
}

impl Handler {
    pub fn new(
        transport: Arc<dyn Transport>,
        adapter: Arc<dyn Adapter>,
        tracker: Arc<TokenTracker>,
        target_model: String,
        context_window_override: Option<u64>,
        vision_base_url: String,
    ) -> Self {
        Self {
            transport,
            adapter,
            tracker,
            target_model,
            context_window_override,
            vision_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(35))
                .build()
                .expect("vision HTTP client"),
            vision_base_url,
        }
    }

    /// Handle one /v1/messages request end to end
    pub async fn handle(&self, raw: Value, client_headers: &HeaderMap) -> Response<Body> {
        match self.try_handle(raw, client_headers).await {
            Ok(response) => response,
            Err(error) => axum::response::IntoResponse::into_response(error),
        }
    }

    async fn try_handle(
        &self,
        raw: Value,
        client_headers: &HeaderMap,
    ) -> Result<Response<Body>, ProxyError> {
        // 1. Normalize
        let (request, dropped) = ClaudeRequest::normalize(&raw)
            .map_err(|e| ProxyError::BadRequest(format!("invalid request body: {}", e)))?;

        // 2. Convert
        self.adapter.reset();
        let mut messages = self.adapter.convert_messages(&request)?;
        let tools = self.adapter.convert_tools(&request);

        // 3. Vision precondition
        if !self.adapter.supports_vision(&self.target_model) {
            let client_key = client_headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let outcome = vision::describe_or_strip(
                &mut messages,
                &self.vision_client,
                &self.vision_base_url,
                client_key,
            )
            .await;
            tracing::debug!("vision precondition: {:?}", outcome);
        }

        // 4. Assemble
        let mut body = self.adapter.build_payload(&request, messages, tools);
        if let Some(extra) = self.transport.extra_payload_fields().await {
            merge_payload_fields(&mut body, extra);
        }

        // 5. Last-chance mutation
        self.adapter.prepare_request(&mut body);

        // 6. Auth warm-up + context window
        self.transport.refresh_auth().await?;
        match self.context_window_override {
            Some(window) => self.tracker.set_context_window(window),
            None => {
                if let Some(window) = self.transport.discovered_context_window().await {
                    self.tracker.set_context_window(window);
                }
            }
        }

        // 7. Envelope
        let body = self.transport.transform_payload(body);

        // 8-9. Dispatch with a single re-auth retry on 401
        let response = self.send_with_reauth(&body, client_headers).await?;

        // 10. Stream translation
        let stream_body = stream::stream_response(
            self.transport.stream_format(),
            response,
            StreamContext {
                adapter: self.adapter.clone(),
                tracker: self.tracker.clone(),
                model: request.model.clone(),
            },
        );

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache");
        if !dropped.is_empty() {
            builder = builder.header("x-dropped-params", dropped.join(", "));
        }
        builder
            .body(stream_body)
            .map_err(|e| ProxyError::Internal(format!("response build failed: {}", e)))
    }

    async fn send_once(
        &self,
        body: &Value,
        client_headers: &HeaderMap,
    ) -> Result<reqwest::Response, ProxyError> {
        let mut headers = self.transport.headers().await?;

        // Native Anthropic with no configured key runs on the client's own
        // credentials, exactly as a transparent proxy should
        if self.transport.name() == "anthropic"
            && !headers.contains_key("x-api-key")
            && !headers.contains_key("authorization")
        {
            for name in ["x-api-key", "authorization", "anthropic-beta"] {
                if let Some(value) = client_headers.get(name) {
                    if let Ok(value) = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
                    {
                        if let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                        {
                            headers.insert(name, value);
                        }
                    }
                }
            }
        }

        let endpoint = self.transport.endpoint(&self.target_model);
        let request = self
            .transport
            .client()
            .post(&endpoint)
            .headers(headers)
            .timeout(self.transport.request_timeout())
            .json(body);

        let send = async move { request.send().await };
        let result = match self.transport.queue() {
            Some(queue) => queue.run(send).await,
            None => send.await,
        };

        result.map_err(|e| classify_send_error(&e))
    }

    async fn send_with_reauth(
        &self,
        body: &Value,
        client_headers: &HeaderMap,
    ) -> Result<reqwest::Response, ProxyError> {
        let response = self.send_once(body, client_headers).await?;

        let response = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::info!("{}: 401 from upstream, refreshing credentials", self.transport.name());
            if self.transport.force_refresh_auth().await? {
                self.send_once(body, client_headers).await?
            } else {
                response
            }
        } else {
            response
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Authentication(format!(
                "upstream rejected credentials: {}",
                body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

/// Merge transport-provided fields into the assembled body. Objects merge
/// one level deep (Ollama's `options` must combine with the adapter's
/// sampling options, not replace them); everything else overwrites.
fn merge_payload_fields(body: &mut Value, extra: Value) {
    let (Some(body_obj), Some(extra_obj)) = (body.as_object_mut(), extra.as_object()) else {
        return;
    };
    for (key, value) in extra_obj {
        match (body_obj.get_mut(key), value.as_object()) {
            (Some(Value::Object(existing)), Some(incoming)) => {
                for (inner_key, inner_value) in incoming {
                    existing.insert(inner_key.clone(), inner_value.clone());
                }
            }
            _ => {
                body_obj.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_deep_merges_objects() {
        let mut body = json!({"model": "m", "options": {"temperature": 0.7}});
        merge_payload_fields(&mut body, json!({"options": {"num_ctx": 32768}}));
        assert_eq!(body["options"]["temperature"], 0.7);
        assert_eq!(body["options"]["num_ctx"], 32768);
    }

    #[test]
    fn test_merge_overwrites_scalars() {
        let mut body = json!({"stream": false});
        merge_payload_fields(&mut body, json!({"stream": true, "usage": {"include": true}}));
        assert_eq!(body["stream"], true);
        assert_eq!(body["usage"]["include"], true);
    }
}
