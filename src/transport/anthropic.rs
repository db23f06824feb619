//! Native Anthropic transport and Anthropic-compatible providers
//!
//! MiniMax, Kimi, Z.AI and GLM-coding all expose Anthropic-shaped endpoints,
//! so one transport covers the native API and the compat family; only the
//! base URL and key source differ. Kimi-coding additionally falls back to an
//! OAuth bearer token (maintained by the external login flow) when no API
//! key is configured.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use crate::config::Env;
use crate::error::ProxyError;

use super::{cloud_client, header_map, StreamFormat, Transport};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// (provider, default base URL, key env vars, base-URL override prefix)
const COMPAT_PROVIDERS: &[(&str, &str, &[&str], &str)] = &[
    (
        "minimax",
        "https://api.minimax.io/anthropic",
        &["MINIMAX_API_KEY"],
        "MINIMAX",
    ),
    (
        "kimi",
        "https://api.moonshot.ai/anthropic",
        &["MOONSHOT_API_KEY", "KIMI_API_KEY"],
        "MOONSHOT",
    ),
    (
        "kimi-coding",
        "https://api.moonshot.ai/anthropic",
        &["MOONSHOT_API_KEY", "KIMI_API_KEY"],
        "MOONSHOT",
    ),
    (
        "zai",
        "https://api.z.ai/api/anthropic",
        &["ZAI_API_KEY"],
        "ZAI",
    ),
    (
        "glm-coding",
        "https://open.bigmodel.cn/api/anthropic",
        &["GLM_CODING_API_KEY"],
        "GLM_CODING",
    ),
];

#[derive(Debug)]
pub struct AnthropicTransport {
    name: &'static str,
    base_url: String,
    api_key: Option<String>,
    /// OAuth credentials file for the kimi-coding fallback
    oauth_file: Option<PathBuf>,
    bearer: Mutex<Option<String>>,
    client: reqwest::Client,
}

impl AnthropicTransport {
    /// The native Anthropic API. When no `ANTHROPIC_API_KEY` is set the
    /// handler forwards the client's own `x-api-key` instead.
    pub fn native(env: &Env) -> Self {
        let base_url = env
            .base_url("ANTHROPIC")
            .unwrap_or("https://api.anthropic.com")
            .to_string();
        Self {
            name: "anthropic",
            base_url,
            api_key: env.get("ANTHROPIC_API_KEY").map(String::from),
            oauth_file: None,
            bearer: Mutex::new(None),
            client: cloud_client(),
        }
    }

    /// An Anthropic-compatible provider (MiniMax, Kimi, Z.AI, GLM-coding)
    pub fn compat(provider: &str, env: &Env) -> Result<Self, ProxyError> {
        let entry = COMPAT_PROVIDERS
            .iter()
            .find(|(p, _, _, _)| *p == provider)
            .ok_or_else(|| {
                ProxyError::Configuration(format!("unknown anthropic-compat provider '{}'", provider))
            })?;
        let (name, default_base, key_vars, url_prefix) = *entry;

        let api_key = key_vars.iter().find_map(|v| env.get(v)).map(String::from);
        let oauth_file = (name == "kimi-coding" && api_key.is_none())
            .then(|| crate::config::Config::state_dir().join("kimi-oauth.json"));

        if api_key.is_none() && oauth_file.is_none() {
            return Err(ProxyError::Configuration(format!(
                "provider '{}' requires {} to be set",
                name, key_vars[0]
            )));
        }

        Ok(Self {
            name,
            base_url: env.base_url(url_prefix).unwrap_or(default_base).to_string(),
            api_key,
            oauth_file,
            bearer: Mutex::new(None),
            client: cloud_client(),
        })
    }

    fn load_oauth_token(&self) -> Result<String, ProxyError> {
        let path = self.oauth_file.as_ref().ok_or_else(|| {
            ProxyError::Authentication(format!("no credentials available for {}", self.name))
        })?;
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Connection(format!(
                "{}: no API key and no OAuth session ({}); run the login flow first",
                self.name, e
            ))
        })?;
        let parsed: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            ProxyError::Connection(format!("{}: corrupt OAuth credentials: {}", self.name, e))
        })?;
        parsed
            .get("access_token")
            .and_then(|t| t.as_str())
            .map(String::from)
            .ok_or_else(|| {
                ProxyError::Connection(format!("{}: OAuth credentials lack access_token", self.name))
            })
    }
}

#[async_trait]
impl Transport for AnthropicTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn stream_format(&self) -> StreamFormat {
        StreamFormat::AnthropicSse
    }

    fn endpoint(&self, _model: &str) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    async fn headers(&self) -> Result<HeaderMap, ProxyError> {
        let mut pairs: Vec<(&str, String)> = vec![
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ("content-type", "application/json".to_string()),
        ];

        if let Some(key) = &self.api_key {
            pairs.push(("x-api-key", key.clone()));
        } else if self.oauth_file.is_some() {
            let cached = self.bearer.lock().unwrap().clone();
            let token = match cached {
                Some(token) => token,
                None => {
                    let token = self.load_oauth_token()?;
                    *self.bearer.lock().unwrap() = Some(token.clone());
                    token
                }
            };
            pairs.push(("authorization", format!("Bearer {}", token)));
        }

        let borrowed: Vec<(&str, &str)> =
            pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Ok(header_map(&borrowed))
    }

    fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn refresh_auth(&self) -> Result<(), ProxyError> {
        // Only the OAuth fallback has anything to warm up
        if self.api_key.is_none() && self.oauth_file.is_some() {
            let token = self.load_oauth_token()?;
            *self.bearer.lock().unwrap() = Some(token);
        }
        Ok(())
    }

    async fn force_refresh_auth(&self) -> Result<bool, ProxyError> {
        if self.oauth_file.is_none() {
            return Ok(false);
        }
        // The external login flow may have rotated the token on disk
        let token = self.load_oauth_token()?;
        let mut bearer = self.bearer.lock().unwrap();
        let changed = bearer.as_deref() != Some(token.as_str());
        *bearer = Some(token);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Env {
        Env::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[tokio::test]
    async fn test_native_headers() {
        let t = AnthropicTransport::native(&env(&[("ANTHROPIC_API_KEY", "sk-test")]));
        let headers = t.headers().await.unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-test");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert_eq!(
            t.endpoint("claude-sonnet-4"),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[tokio::test]
    async fn test_compat_minimax() {
        let t =
            AnthropicTransport::compat("minimax", &env(&[("MINIMAX_API_KEY", "mk")])).unwrap();
        let headers = t.headers().await.unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "mk");
        assert_eq!(t.endpoint("minimax-m2"), "https://api.minimax.io/anthropic/v1/messages");
        assert_eq!(t.stream_format(), StreamFormat::AnthropicSse);
    }

    #[test]
    fn test_compat_requires_key() {
        let err = AnthropicTransport::compat("zai", &env(&[])).unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));
    }

    #[test]
    fn test_kimi_coding_accepts_oauth_fallback() {
        // No key: construction succeeds, auth resolution is deferred to
        // refresh_auth against the credentials file
        let t = AnthropicTransport::compat("kimi-coding", &env(&[])).unwrap();
        assert!(t.oauth_file.is_some());
    }

    #[test]
    fn test_base_url_override() {
        let t = AnthropicTransport::compat(
            "zai",
            &env(&[("ZAI_API_KEY", "k"), ("ZAI_BASE_URL", "http://localhost:9999")]),
        )
        .unwrap();
        assert_eq!(t.endpoint("glm-4.7"), "http://localhost:9999/v1/messages");
    }
}
