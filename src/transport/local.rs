//! Local inference transports: Ollama, LM Studio, vLLM, MLX
//!
//! Local servers differ from cloud providers in three ways this module has
//! to absorb:
//! - generation can take minutes, so the HTTP client carries 10-minute
//!   deadlines with TCP keep-alives
//! - availability is not a given: a 5-second health probe runs before the
//!   first send and failures produce a provider-specific hint
//! - the context window is discoverable at runtime (and Ollama silently
//!   truncates to 2048 unless `num_ctx` is forced up)
//!
//! Ollama speaks its native JSONL chat API; the other three are
//! OpenAI-compatible servers.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::Env;
use crate::error::ProxyError;

use super::queue::{local_queue, RequestQueue};
use super::{discovery_client, header_map, local_client, probe_client, StreamFormat, Transport};

/// Floor for Ollama's num_ctx; its out-of-the-box default of 2048 silently
/// truncates agent prompts
const OLLAMA_NUM_CTX_FLOOR: u64 = 32_768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalKind {
    Ollama,
    OpenAiCompat,
}

pub struct LocalTransport {
    provider: String,
    base_url: String,
    model: String,
    kind: LocalKind,
    client: reqwest::Client,
    probe: reqwest::Client,
    discovery: reqwest::Client,
    queue: Arc<RequestQueue>,
    discovered: Mutex<Option<u64>>,
    /// Leaked provider name for Transport::name's &'static str
    static_name: &'static str,
}

impl LocalTransport {
    /// Build for a named local provider (`ollama`, `lmstudio`, `vllm`, `mlx`)
    /// or an ad-hoc `scheme://` spec carrying its own base URL.
    pub fn new(
        provider: &str,
        model: &str,
        base_url: Option<String>,
        env: &Env,
        concurrency: usize,
    ) -> Self {
        let (kind, default_base, static_name): (LocalKind, &str, &'static str) = match provider {
            "ollama" => (LocalKind::Ollama, "http://localhost:11434", "ollama"),
            "lmstudio" => (LocalKind::OpenAiCompat, "http://localhost:1234", "lmstudio"),
            "vllm" => (LocalKind::OpenAiCompat, "http://localhost:8000", "vllm"),
            "mlx" => (LocalKind::OpenAiCompat, "http://localhost:8080", "mlx"),
            _ => (LocalKind::OpenAiCompat, "http://localhost:8000", "local"),
        };

        let env_override = env
            .base_url(&provider.to_ascii_uppercase())
            .map(String::from);
        let base = base_url
            .or(env_override)
            .unwrap_or_else(|| default_base.to_string());

        Self {
            provider: provider.to_string(),
            base_url: base.trim_end_matches('/').trim_end_matches("/v1").to_string(),
            model: model.to_string(),
            kind,
            client: local_client(),
            probe: probe_client(),
            discovery: discovery_client(),
            queue: local_queue(provider, concurrency),
            discovered: Mutex::new(None),
            static_name,
        }
    }

    fn probe_failure_hint(&self, err: &str) -> String {
        match self.provider.as_str() {
            "ollama" => format!(
                "ollama is not reachable at {} ({}); start it with `ollama serve`",
                self.base_url, err
            ),
            "lmstudio" => format!(
                "LM Studio's server is not reachable at {} ({}); enable it in the Developer tab",
                self.base_url, err
            ),
            "vllm" => format!(
                "vLLM is not reachable at {} ({}); check `vllm serve` is running",
                self.base_url, err
            ),
            "mlx" => format!(
                "MLX server is not reachable at {} ({}); start `mlx_lm.server`",
                self.base_url, err
            ),
            _ => format!("local server is not reachable at {} ({})", self.base_url, err),
        }
    }

    async fn discover_context_window(&self) -> Option<u64> {
        match self.kind {
            LocalKind::Ollama => self.discover_ollama().await,
            LocalKind::OpenAiCompat => self.discover_openai_compat().await,
        }
    }

    /// Ollama: POST /api/show, read `general.context_length` from model_info
    /// or `num_ctx` from the parameters dump
    async fn discover_ollama(&self) -> Option<u64> {
        let response = self
            .discovery
            .post(format!("{}/api/show", self.base_url))
            .json(&json!({"model": self.model}))
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;

        if let Some(info) = body.get("model_info").and_then(|i| i.as_object()) {
            for (key, value) in info {
                if key.ends_with(".context_length") || key == "general.context_length" {
                    if let Some(window) = value.as_u64() {
                        return Some(window);
                    }
                }
            }
        }

        // Fallback: "num_ctx 65536" somewhere in the parameters text
        let params = body.get("parameters").and_then(|p| p.as_str())?;
        for line in params.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() == Some("num_ctx") {
                if let Some(window) = parts.next().and_then(|v| v.parse().ok()) {
                    return Some(window);
                }
            }
        }
        None
    }

    /// LM Studio and friends report context length in /v1/models
    async fn discover_openai_compat(&self) -> Option<u64> {
        let response = self
            .discovery
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;
        let models = body.get("data")?.as_array()?;
        let entry = models
            .iter()
            .find(|m| m.get("id").and_then(|i| i.as_str()) == Some(self.model.as_str()))
            .or_else(|| models.first())?;
        for key in ["max_context_length", "context_length", "max_model_len"] {
            if let Some(window) = entry.get(key).and_then(|v| v.as_u64()) {
                return Some(window);
            }
        }
        None
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        self.static_name
    }

    fn stream_format(&self) -> StreamFormat {
        match self.kind {
            LocalKind::Ollama => StreamFormat::OllamaJsonl,
            LocalKind::OpenAiCompat => StreamFormat::OpenAiSse,
        }
    }

    fn endpoint(&self, _model: &str) -> String {
        match self.kind {
            LocalKind::Ollama => format!("{}/api/chat", self.base_url),
            LocalKind::OpenAiCompat => format!("{}/v1/chat/completions", self.base_url),
        }
    }

    async fn headers(&self) -> Result<HeaderMap, ProxyError> {
        Ok(header_map(&[("content-type", "application/json")]))
    }

    async fn extra_payload_fields(&self) -> Option<Value> {
        if self.kind != LocalKind::Ollama {
            return None;
        }
        let discovered = self.discovered_context_window().await.unwrap_or(0);
        let num_ctx = discovered.max(OLLAMA_NUM_CTX_FLOOR);
        Some(json!({"options": {"num_ctx": num_ctx}}))
    }

    fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(600)
    }

    fn queue(&self) -> Option<&RequestQueue> {
        Some(&self.queue)
    }

    /// Health probe: `/api/tags` first (Ollama), then `/v1/models`
    async fn refresh_auth(&self) -> Result<(), ProxyError> {
        let tags = self
            .probe
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await;
        if matches!(&tags, Ok(r) if r.status().is_success()) {
            return Ok(());
        }

        let models = self
            .probe
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await;
        match models {
            Ok(r) if r.status().is_success() => Ok(()),
            Ok(r) => Err(ProxyError::Connection(
                self.probe_failure_hint(&format!("status {}", r.status())),
            )),
            Err(e) => Err(ProxyError::Connection(self.probe_failure_hint(&e.to_string()))),
        }
    }

    async fn discovered_context_window(&self) -> Option<u64> {
        let mut cached = self.discovered.lock().await;
        if cached.is_none() {
            *cached = self.discover_context_window().await;
            if let Some(window) = *cached {
                tracing::debug!(
                    "{}: discovered context window {} for {}",
                    self.provider,
                    window,
                    self.model
                );
            }
        }
        *cached
    }
}
