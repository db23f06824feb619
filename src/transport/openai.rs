//! OpenAI-compatible transports
//!
//! One transport covers every bearer-token chat-completions provider:
//! OpenAI itself, xAI, OpenRouter, GLM's paas endpoint, OllamaCloud,
//! opencode-zen, Poe and LiteLLM. OpenAI Codex models are detected by
//! substring and steered to `/responses` with the Responses stream format;
//! everything else speaks `/chat/completions`.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use crate::config::Env;
use crate::error::ProxyError;

use super::{cloud_client, header_map, StreamFormat, Transport};

#[derive(Debug)]
pub struct OpenAiCompatTransport {
    name: &'static str,
    base_url: String,
    api_key: Option<String>,
    /// Codex models go to /responses instead of /chat/completions
    responses_api: bool,
    extra_fields: Option<Value>,
    client: reqwest::Client,
}

impl OpenAiCompatTransport {
    pub fn openai(env: &Env, target_model: &str) -> Result<Self, ProxyError> {
        let api_key = require_key(env, &["OPENAI_API_KEY"], "openai")?;
        Ok(Self {
            name: "openai",
            base_url: base(env, "OPENAI", "https://api.openai.com/v1"),
            api_key: Some(api_key),
            responses_api: is_codex_model(target_model),
            extra_fields: None,
            client: cloud_client(),
        })
    }

    pub fn xai(env: &Env) -> Result<Self, ProxyError> {
        let api_key = require_key(env, &["XAI_API_KEY"], "xai")?;
        Ok(Self {
            name: "xai",
            base_url: base(env, "XAI", "https://api.x.ai/v1"),
            api_key: Some(api_key),
            responses_api: false,
            extra_fields: None,
            client: cloud_client(),
        })
    }

    pub fn openrouter(env: &Env) -> Result<Self, ProxyError> {
        let api_key = require_key(env, &["OPENROUTER_API_KEY"], "openrouter")?;
        Ok(Self {
            name: "openrouter",
            base_url: base(env, "OPENROUTER", "https://openrouter.ai/api/v1"),
            api_key: Some(api_key),
            responses_api: false,
            // Asks OpenRouter to include its accounting block in the final
            // usage chunk so the actual-cost strategy has real numbers
            extra_fields: Some(json!({"usage": {"include": true}})),
            client: cloud_client(),
        })
    }

    pub fn glm(env: &Env) -> Result<Self, ProxyError> {
        let api_key = require_key(env, &["ZHIPU_API_KEY", "GLM_API_KEY"], "glm")?;
        Ok(Self {
            name: "glm",
            base_url: base(env, "GLM", "https://open.bigmodel.cn/api/paas/v4"),
            api_key: Some(api_key),
            responses_api: false,
            extra_fields: None,
            client: cloud_client(),
        })
    }

    pub fn ollamacloud(env: &Env) -> Result<Self, ProxyError> {
        let api_key = require_key(env, &["OLLAMA_API_KEY"], "ollamacloud")?;
        Ok(Self {
            name: "ollamacloud",
            base_url: base(env, "OLLAMA_CLOUD", "https://ollama.com/v1"),
            api_key: Some(api_key),
            responses_api: false,
            extra_fields: None,
            client: cloud_client(),
        })
    }

    /// opencode-zen has a free tier; the key is optional
    pub fn opencode_zen(env: &Env) -> Self {
        Self {
            name: "opencode-zen",
            base_url: base(env, "OPENCODE_ZEN", "https://opencode.ai/zen/v1"),
            api_key: env.get("OPENCODE_ZEN_API_KEY").map(String::from),
            responses_api: false,
            extra_fields: None,
            client: cloud_client(),
        }
    }

    pub fn poe(env: &Env) -> Result<Self, ProxyError> {
        let api_key = require_key(env, &["POE_API_KEY"], "poe")?;
        Ok(Self {
            name: "poe",
            base_url: base(env, "POE", "https://api.poe.com/v1"),
            api_key: Some(api_key),
            responses_api: false,
            extra_fields: None,
            client: cloud_client(),
        })
    }

    /// LiteLLM requires a base URL; the key is optional (local deployments
    /// often run without auth)
    pub fn litellm(env: &Env) -> Result<Self, ProxyError> {
        let base_url = env
            .get("LITELLM_BASE_URL")
            .map(String::from)
            .ok_or_else(|| {
                ProxyError::Configuration("litellm requires LITELLM_BASE_URL".to_string())
            })?;
        Ok(Self {
            name: "litellm",
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: env.get("LITELLM_API_KEY").map(String::from),
            responses_api: false,
            // Forwarded verbatim by LiteLLM to providers that want the
            // Anthropic version pin
            extra_fields: Some(json!({"extra_headers": {"anthropic-version": "2023-06-01"}})),
            client: cloud_client(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Codex models use the Responses API
pub fn is_codex_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("codex")
}

fn base(env: &Env, prefix: &str, default: &str) -> String {
    env.base_url(prefix)
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

fn require_key(env: &Env, vars: &[&str], provider: &str) -> Result<String, ProxyError> {
    vars.iter()
        .find_map(|v| env.get(v))
        .map(String::from)
        .ok_or_else(|| {
            ProxyError::Configuration(format!("provider '{}' requires {}", provider, vars[0]))
        })
}

#[async_trait]
impl Transport for OpenAiCompatTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn stream_format(&self) -> StreamFormat {
        if self.responses_api {
            StreamFormat::OpenAiResponsesSse
        } else {
            StreamFormat::OpenAiSse
        }
    }

    fn endpoint(&self, _model: &str) -> String {
        if self.responses_api {
            format!("{}/responses", self.base_url)
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    async fn headers(&self) -> Result<HeaderMap, ProxyError> {
        let mut pairs: Vec<(&str, String)> =
            vec![("content-type", "application/json".to_string())];
        if let Some(key) = &self.api_key {
            pairs.push(("authorization", format!("Bearer {}", key)));
        }
        if self.name == "openrouter" {
            pairs.push(("http-referer", "https://github.com/claudish".to_string()));
            pairs.push(("x-title", "claudish".to_string()));
        }
        let borrowed: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Ok(header_map(&borrowed))
    }

    async fn extra_payload_fields(&self) -> Option<Value> {
        self.extra_fields.clone()
    }

    fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Env {
        Env::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn test_codex_detection() {
        assert!(is_codex_model("gpt-5.1-codex"));
        assert!(is_codex_model("Codex-Mini"));
        assert!(!is_codex_model("gpt-4o"));
    }

    #[test]
    fn test_openai_routes_codex_to_responses() {
        let e = env(&[("OPENAI_API_KEY", "k")]);
        let chat = OpenAiCompatTransport::openai(&e, "gpt-4o").unwrap();
        assert_eq!(chat.stream_format(), StreamFormat::OpenAiSse);
        assert_eq!(chat.endpoint("gpt-4o"), "https://api.openai.com/v1/chat/completions");

        let codex = OpenAiCompatTransport::openai(&e, "gpt-5.1-codex").unwrap();
        assert_eq!(codex.stream_format(), StreamFormat::OpenAiResponsesSse);
        assert_eq!(
            codex.endpoint("gpt-5.1-codex"),
            "https://api.openai.com/v1/responses"
        );
    }

    #[tokio::test]
    async fn test_bearer_header() {
        let t = OpenAiCompatTransport::xai(&env(&[("XAI_API_KEY", "xk")])).unwrap();
        let headers = t.headers().await.unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer xk");
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let err = OpenAiCompatTransport::openai(&env(&[]), "gpt-4o").unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));
    }

    #[test]
    fn test_zen_key_optional() {
        let t = OpenAiCompatTransport::opencode_zen(&env(&[]));
        assert!(t.api_key.is_none());
    }

    #[test]
    fn test_litellm_requires_base_url() {
        assert!(OpenAiCompatTransport::litellm(&env(&[])).is_err());
        let t = OpenAiCompatTransport::litellm(&env(&[(
            "LITELLM_BASE_URL",
            "http://localhost:4000/",
        )]))
        .unwrap();
        assert_eq!(t.endpoint("m"), "http://localhost:4000/chat/completions");
    }

    #[tokio::test]
    async fn test_openrouter_accounting_fields() {
        let t = OpenAiCompatTransport::openrouter(&env(&[("OPENROUTER_API_KEY", "k")])).unwrap();
        let extra = t.extra_payload_fields().await.unwrap();
        assert_eq!(extra["usage"]["include"], true);
    }
}
