//! Transport layer - per-provider capability bundles
//!
//! A transport knows how to reach one upstream provider: endpoint template,
//! auth headers, stream format, optional request queue, optional payload
//! envelope, and the HTTP client tuned for that provider's latency profile.
//! It knows nothing about message shapes; that is the adapter's job.
//!
//! Only `endpoint`, `headers`, and `stream_format` are mandatory; every other
//! capability has a no-op default so simple providers stay simple.

pub mod anthropic;
pub mod gemini;
pub mod local;
pub mod openai;
pub mod queue;
pub mod vertex;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::error::ProxyError;
pub use queue::RequestQueue;

/// Upstream streaming wire formats. Closed set: the stream module routes on
/// this with a dense match, never a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    OpenAiSse,
    OpenAiResponsesSse,
    GeminiSse,
    AnthropicSse,
    OllamaJsonl,
}

/// Per-provider capability bundle
#[async_trait]
pub trait Transport: Send + Sync {
    /// Provider name for logs and error messages
    fn name(&self) -> &'static str;

    /// Which translator consumes this provider's response stream
    fn stream_format(&self) -> StreamFormat;

    /// Request URL for a target model (template substitution)
    fn endpoint(&self, model: &str) -> String;

    /// Auth and content headers. Async because some providers refresh OAuth
    /// credentials inside this call.
    async fn headers(&self) -> Result<HeaderMap, ProxyError>;

    /// Fields merged into the assembled request body (e.g. Ollama's
    /// `{"options":{"num_ctx":...}}`)
    async fn extra_payload_fields(&self) -> Option<Value> {
        None
    }

    /// HTTP client tuned for this provider
    fn client(&self) -> &reqwest::Client;

    /// Per-request abort deadline
    fn request_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Rate-limited dispatch queue, when the provider needs one
    fn queue(&self) -> Option<&RequestQueue> {
        None
    }

    /// One-shot health check / credential warm-up before the first send.
    /// Fatal failures surface as connection_error 503.
    async fn refresh_auth(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    /// Called exactly once after a 401; returns true when credentials were
    /// refreshed and the request should be retried.
    async fn force_refresh_auth(&self) -> Result<bool, ProxyError> {
        Ok(false)
    }

    /// Envelope wrapping (Vertex publisher bodies, Code-Assist)
    fn transform_payload(&self, payload: Value) -> Value {
        payload
    }

    /// Runtime-discovered context window (local servers expose theirs)
    async fn discovered_context_window(&self) -> Option<u64> {
        None
    }
}

/// HTTP client for cloud providers: 30 s total deadline, HTTP/1.1 only to
/// avoid connection resets seen with several providers' HTTP/2 stacks.
pub fn cloud_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .http1_only()
        .build()
        .expect("cloud HTTP client")
}

/// HTTP client for local inference: generation can take minutes, so the
/// deadline is 10 minutes with TCP keep-alives holding the socket open.
pub fn local_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(600))
        .tcp_keepalive(Duration::from_secs(30))
        .http1_only()
        .build()
        .expect("local HTTP client")
}

/// Short-deadline client for health probes (5 s)
pub fn probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("probe HTTP client")
}

/// Short-deadline client for context-window discovery (3 s)
pub fn discovery_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .expect("discovery HTTP client")
}

/// Build a header map from (name, value) pairs, skipping values that fail
/// header validation instead of panicking on user-supplied keys.
pub fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = reqwest::header::HeaderValue::from_str(value) else {
            tracing::warn!("skipping invalid header value for {}", name);
            continue;
        };
        headers.insert(name, value);
    }
    headers
}
