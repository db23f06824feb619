//! Vertex AI transport (OAuth mode)
//!
//! Express mode (`VERTEX_API_KEY`) routes through the Gemini transport
//! instead; this module is the OAuth path. The access token comes from
//! `gcloud auth print-access-token` and is cached inside the transport
//! instance with a conservative expiry - never globally, so two Vertex
//! handlers with different projects don't share credentials.
//!
//! Vertex serves several publishers, each with its own endpoint verb and
//! body envelope. The publisher is detected from the model name.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use crate::config::Env;
use crate::error::ProxyError;

use super::{cloud_client, header_map, StreamFormat, Transport};

/// Access tokens live ~60 minutes; refresh after 50
const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publisher {
    Google,
    Anthropic,
    Mistral,
    Meta,
}

impl Publisher {
    /// Detect the publisher from the model name
    pub fn detect(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.starts_with("claude") {
            Publisher::Anthropic
        } else if lower.starts_with("mistral") || lower.starts_with("codestral") {
            Publisher::Mistral
        } else if lower.starts_with("llama") || lower.starts_with("meta/") {
            Publisher::Meta
        } else {
            Publisher::Google
        }
    }

    fn path_segment(&self) -> &'static str {
        match self {
            Publisher::Google => "google",
            Publisher::Anthropic => "anthropic",
            Publisher::Mistral => "mistralai",
            Publisher::Meta => "meta",
        }
    }
}

pub struct VertexTransport {
    project: String,
    location: String,
    publisher: Publisher,
    /// VERTEX_BASE_URL override (private deployments, tests)
    base_override: Option<String>,
    /// Test/automation override for the gcloud subprocess
    static_token: Option<String>,
    token: Mutex<Option<(String, Instant)>>,
    client: reqwest::Client,
}

impl VertexTransport {
    pub fn new(env: &Env, target_model: &str) -> Result<Self, ProxyError> {
        let project = env.get("VERTEX_PROJECT").map(String::from).ok_or_else(|| {
            ProxyError::Configuration(
                "vertex OAuth mode requires VERTEX_PROJECT (or set VERTEX_API_KEY for express mode)"
                    .to_string(),
            )
        })?;
        Ok(Self {
            project,
            location: env
                .get("VERTEX_LOCATION")
                .unwrap_or("us-central1")
                .to_string(),
            publisher: Publisher::detect(target_model),
            base_override: env.base_url("VERTEX").map(String::from),
            static_token: env.get("CLAUDISH_VERTEX_ACCESS_TOKEN").map(String::from),
            token: Mutex::new(None),
            client: cloud_client(),
        })
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher
    }

    async fn access_token(&self, force: bool) -> Result<String, ProxyError> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }

        if !force {
            let cached = self.token.lock().unwrap().clone();
            if let Some((token, acquired)) = cached {
                if acquired.elapsed() < TOKEN_TTL {
                    return Ok(token);
                }
            }
        }

        let output = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| {
                ProxyError::Connection(format!(
                    "vertex: failed to run gcloud ({}); install the Google Cloud SDK or set VERTEX_API_KEY",
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(ProxyError::Connection(format!(
                "vertex: gcloud auth print-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(ProxyError::Connection(
                "vertex: gcloud returned an empty access token".to_string(),
            ));
        }

        *self.token.lock().unwrap() = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

#[async_trait]
impl Transport for VertexTransport {
    fn name(&self) -> &'static str {
        "vertex"
    }

    fn stream_format(&self) -> StreamFormat {
        match self.publisher {
            Publisher::Google => StreamFormat::GeminiSse,
            Publisher::Anthropic => StreamFormat::AnthropicSse,
            Publisher::Mistral | Publisher::Meta => StreamFormat::OpenAiSse,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        let host = match &self.base_override {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{}-aiplatform.googleapis.com", self.location),
        };
        let root = format!(
            "{host}/v1/projects/{proj}/locations/{loc}",
            host = host,
            proj = self.project,
            loc = self.location
        );
        match self.publisher {
            Publisher::Google => format!(
                "{}/publishers/google/models/{}:streamGenerateContent?alt=sse",
                root, model
            ),
            Publisher::Anthropic => format!(
                "{}/publishers/anthropic/models/{}:streamRawPredict",
                root, model
            ),
            Publisher::Mistral => format!(
                "{}/publishers/mistralai/models/{}:streamRawPredict",
                root, model
            ),
            // Meta models are served through the OpenAPI-compatible endpoint
            Publisher::Meta => format!("{}/endpoints/openapi/chat/completions", root),
        }
    }

    async fn headers(&self) -> Result<HeaderMap, ProxyError> {
        let token = self.access_token(false).await?;
        let auth = format!("Bearer {}", token);
        Ok(header_map(&[
            ("authorization", auth.as_str()),
            ("content-type", "application/json"),
        ]))
    }

    fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn refresh_auth(&self) -> Result<(), ProxyError> {
        self.access_token(false).await.map(|_| ())
    }

    async fn force_refresh_auth(&self) -> Result<bool, ProxyError> {
        self.access_token(true).await.map(|_| true)
    }

    fn transform_payload(&self, mut payload: Value) -> Value {
        match self.publisher {
            // Already in Gemini format; Vertex takes it as-is
            Publisher::Google => payload,
            // Claude-on-Vertex: the model lives in the URL and the body
            // carries the anthropic_version pin instead
            Publisher::Anthropic => {
                if let Some(obj) = payload.as_object_mut() {
                    obj.remove("model");
                    obj.insert(
                        "anthropic_version".to_string(),
                        json!("vertex-2023-10-16"),
                    );
                }
                payload
            }
            Publisher::Mistral => payload,
            // The OpenAPI endpoint routes on a publisher-prefixed model id
            Publisher::Meta => {
                if let Some(obj) = payload.as_object_mut() {
                    if let Some(model) = obj.get("model").and_then(|m| m.as_str()) {
                        if !model.starts_with("meta/") {
                            let prefixed = format!("meta/{}", model);
                            obj.insert("model".to_string(), json!(prefixed));
                        }
                    }
                }
                payload
            }
        }
    }
}
