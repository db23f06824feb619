//! Gemini direct transport
//!
//! Uses the generative-language API with `x-goog-api-key` auth. All Gemini
//! traffic in the process serializes through the shared single-flight queue;
//! the API throttles hard under concurrent calls from one key.

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use crate::config::Env;
use crate::error::ProxyError;

use super::queue::{gemini_queue, RequestQueue};
use super::{cloud_client, header_map, StreamFormat, Transport};

pub struct GeminiTransport {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiTransport {
    pub fn new(env: &Env) -> Result<Self, ProxyError> {
        let api_key = env
            .get("GEMINI_API_KEY")
            .map(String::from)
            .ok_or_else(|| {
                ProxyError::Configuration("provider 'gemini' requires GEMINI_API_KEY".to_string())
            })?;
        Ok(Self {
            base_url: env
                .base_url("GEMINI")
                .unwrap_or("https://generativelanguage.googleapis.com")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client: cloud_client(),
        })
    }

    /// Express-mode Vertex: same wire protocol, Vertex key and host
    pub fn vertex_express(env: &Env) -> Result<Self, ProxyError> {
        let api_key = env.get("VERTEX_API_KEY").map(String::from).ok_or_else(|| {
            ProxyError::Configuration("vertex express mode requires VERTEX_API_KEY".to_string())
        })?;
        Ok(Self {
            base_url: env
                .base_url("VERTEX")
                .unwrap_or("https://aiplatform.googleapis.com")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            client: cloud_client(),
        })
    }
}

#[async_trait]
impl Transport for GeminiTransport {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn stream_format(&self) -> StreamFormat {
        StreamFormat::GeminiSse
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        )
    }

    async fn headers(&self) -> Result<HeaderMap, ProxyError> {
        Ok(header_map(&[
            ("x-goog-api-key", self.api_key.as_str()),
            ("content-type", "application/json"),
        ]))
    }

    fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn queue(&self) -> Option<&RequestQueue> {
        Some(gemini_queue())
    }
}
