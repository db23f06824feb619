//! Router - per-request handler selection
//!
//! At startup the router gets the listening port, an optional default
//! target, the role map, and the monitor flag. Per request it resolves the
//! requested model to a target, constructs (or reuses) the composed handler
//! for that target, and dispatches.
//!
//! Resolution order:
//! - monitor mode short-circuits everything to the native passthrough
//! - `poe:`-prefixed targets go to the Poe handler
//! - a requested model containing opus/sonnet/haiku (case-insensitive)
//!   follows the role map when that role is set
//! - otherwise the default target, then the requested model verbatim
//!
//! A target containing `/` or `@` that cannot be built NEVER falls through
//! to native Anthropic - that is a missing API key, not an Anthropic model,
//! and it surfaces as a configuration error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::adapter::anthropic::AnthropicPassthroughAdapter;
use crate::adapter::gemini::GeminiAdapter;
use crate::adapter::grok::GrokAdapter;
use crate::adapter::litellm::LiteLlmAdapter;
use crate::adapter::local::{LocalAdapter, LocalBodyShape};
use crate::adapter::ollamacloud::OllamaCloudAdapter;
use crate::adapter::openai::{OpenAiChatAdapter, VisionRule};
use crate::adapter::openrouter::OpenRouterAdapter;
use crate::adapter::responses::OpenAiResponsesAdapter;
use crate::adapter::Adapter;
use crate::config::Config;
use crate::error::ProxyError;
use crate::handler::Handler;
use crate::model::resolver::{self, FallbackRoute, ProviderCategory, ProviderResolution};
use crate::tracker::{TokenStrategy, TokenTracker};
use crate::transport::anthropic::AnthropicTransport;
use crate::transport::gemini::GeminiTransport;
use crate::transport::local::LocalTransport;
use crate::transport::openai::{is_codex_model, OpenAiCompatTransport};
use crate::transport::vertex::{Publisher, VertexTransport};
use crate::transport::Transport;

/// Providers reachable through OpenRouter when their direct key is missing
fn openrouter_org(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("openai"),
        "gemini" => Some("google"),
        "xai" => Some("x-ai"),
        "kimi" | "kimi-coding" => Some("moonshotai"),
        "glm" | "glm-coding" | "zai" => Some("z-ai"),
        "minimax" => Some("minimax"),
        _ => None,
    }
}

pub struct ProxyRouter {
    config: Config,
    port: u16,
    handlers: Mutex<HashMap<String, Arc<Handler>>>,
}

impl ProxyRouter {
    pub fn new(config: Config, port: u16) -> Self {
        Self {
            config,
            port,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the requested model to the target model string
    pub fn resolve_target(&self, requested: &str) -> String {
        if self.config.monitor {
            return requested.to_string();
        }

        self.config
            .roles
            .target_for(requested)
            .or(self.config.default_model.as_deref())
            .unwrap_or(requested)
            .to_string()
    }

    /// True when the request would be served by the native Anthropic path
    /// (count_tokens forwards upstream in that case)
    pub fn is_native(&self, requested: &str) -> bool {
        if self.config.monitor {
            return true;
        }
        let target = self.resolve_target(requested);
        if target.starts_with("poe:") {
            return false;
        }
        resolver::resolve(&target, &self.config.env).category
            == ProviderCategory::NativeAnthropic
    }

    /// Mappings summary for GET /
    pub fn mappings(&self) -> Value {
        json!({
            "opus": self.config.roles.opus,
            "sonnet": self.config.roles.sonnet,
            "haiku": self.config.roles.haiku,
            "subagent": self.config.roles.subagent,
            "default": self.config.default_model,
        })
    }

    /// Handler for a requested model, cached by target string for the
    /// process lifetime
    pub fn handler_for(&self, requested: &str) -> Result<Arc<Handler>, ProxyError> {
        let target = self.resolve_target(requested);

        if let Some(handler) = self.handlers.lock().unwrap().get(&target) {
            return Ok(handler.clone());
        }

        let built = Arc::new(self.build_handler(&target)?);

        // Double-check under the lock: a concurrent first use may have won
        let mut cache = self.handlers.lock().unwrap();
        Ok(cache.entry(target).or_insert(built).clone())
    }

    fn make_handler(
        &self,
        transport: Arc<dyn Transport>,
        adapter: Arc<dyn Adapter>,
        provider_name: &str,
        model_name: &str,
        strategy: TokenStrategy,
    ) -> Handler {
        let window = self
            .config
            .context_window_override()
            .unwrap_or_else(|| adapter.context_window(model_name));
        let mut tracker =
            TokenTracker::new(self.port, provider_name, model_name, window, strategy);
        if let Some(ratio) = self
            .config
            .env
            .get("CLAUDISH_DELTA_FRESH_RATIO")
            .and_then(|v| v.parse::<f64>().ok())
        {
            tracker = tracker.with_fresh_ratio(ratio);
        }

        let vision_base = self
            .config
            .env
            .base_url("ANTHROPIC")
            .unwrap_or("https://api.anthropic.com")
            .to_string();

        Handler::new(
            transport,
            adapter,
            Arc::new(tracker),
            model_name.to_string(),
            self.config.context_window_override(),
            vision_base,
        )
    }

    fn native_handler(&self, model: &str) -> Handler {
        let transport = Arc::new(AnthropicTransport::native(&self.config.env));
        let adapter = Arc::new(AnthropicPassthroughAdapter::new(model));
        self.make_handler(
            transport,
            adapter,
            "anthropic",
            model,
            TokenStrategy::DeltaAware,
        )
    }

    fn openrouter_handler(&self, model: &str) -> Result<Handler, ProxyError> {
        let transport = Arc::new(OpenAiCompatTransport::openrouter(&self.config.env)?);
        let adapter = Arc::new(OpenRouterAdapter::new(model));
        Ok(self.make_handler(
            transport,
            adapter,
            "openrouter",
            model,
            TokenStrategy::ActualCost,
        ))
    }

    fn vertex_handler(&self, model: &str) -> Result<Handler, ProxyError> {
        let env = &self.config.env;

        // Express mode rides the Gemini wire protocol with a Vertex key
        if env.has("VERTEX_API_KEY") {
            let transport = Arc::new(GeminiTransport::vertex_express(env)?);
            let adapter = Arc::new(GeminiAdapter::new(model, self.use_sentinel()));
            return Ok(self.make_handler(
                transport,
                adapter,
                "vertex",
                model,
                TokenStrategy::AccumulateBoth,
            ));
        }

        let transport = Arc::new(VertexTransport::new(env, model)?);
        let (adapter, strategy): (Arc<dyn Adapter>, TokenStrategy) =
            match Publisher::detect(model) {
                Publisher::Google => (
                    Arc::new(GeminiAdapter::new(model, self.use_sentinel())),
                    TokenStrategy::AccumulateBoth,
                ),
                Publisher::Anthropic => (
                    Arc::new(AnthropicPassthroughAdapter::new(model)),
                    TokenStrategy::Standard,
                ),
                Publisher::Mistral | Publisher::Meta => (
                    Arc::new(OpenAiChatAdapter::new(model, VisionRule::Never)),
                    TokenStrategy::Standard,
                ),
            };
        Ok(self.make_handler(transport, adapter, "vertex", model, strategy))
    }

    fn use_sentinel(&self) -> bool {
        !self.config.env.flag("CLAUDISH_NO_SIGNATURE_SENTINEL")
    }

    fn direct_api_handler(
        &self,
        resolution: &ProviderResolution,
    ) -> Result<Handler, ProxyError> {
        let env = &self.config.env;
        let model = resolution.model_name.as_str();
        let provider = resolution.provider_name.as_str();

        match provider {
            "gemini" => {
                let transport = Arc::new(GeminiTransport::new(env)?);
                let adapter = Arc::new(GeminiAdapter::new(model, self.use_sentinel()));
                Ok(self.make_handler(
                    transport,
                    adapter,
                    provider,
                    model,
                    TokenStrategy::AccumulateBoth,
                ))
            }
            "openai" => {
                let transport = Arc::new(OpenAiCompatTransport::openai(env, model)?);
                let adapter: Arc<dyn Adapter> = if is_codex_model(model) {
                    Arc::new(OpenAiResponsesAdapter::new(model))
                } else {
                    Arc::new(OpenAiChatAdapter::new(model, VisionRule::OpenAiFamily))
                };
                Ok(self.make_handler(transport, adapter, provider, model, TokenStrategy::Standard))
            }
            "xai" => {
                let transport = Arc::new(OpenAiCompatTransport::xai(env)?);
                let adapter = Arc::new(GrokAdapter::new(model));
                Ok(self.make_handler(transport, adapter, provider, model, TokenStrategy::Standard))
            }
            "glm" => {
                let transport = Arc::new(OpenAiCompatTransport::glm(env)?);
                let adapter = Arc::new(OpenAiChatAdapter::new(model, VisionRule::GlmFamily));
                Ok(self.make_handler(transport, adapter, provider, model, TokenStrategy::Standard))
            }
            "minimax" | "kimi" | "kimi-coding" | "zai" | "glm-coding" => {
                let transport = Arc::new(AnthropicTransport::compat(provider, env)?);
                let adapter = Arc::new(AnthropicPassthroughAdapter::new(model));
                Ok(self.make_handler(transport, adapter, provider, model, TokenStrategy::Standard))
            }
            "ollamacloud" => {
                let transport = Arc::new(OpenAiCompatTransport::ollamacloud(env)?);
                let adapter = Arc::new(OllamaCloudAdapter::new(model));
                Ok(self.make_handler(transport, adapter, provider, model, TokenStrategy::Standard))
            }
            "litellm" => {
                let transport = Arc::new(OpenAiCompatTransport::litellm(env)?);
                let base_url = transport.base_url().to_string();
                let adapter = Arc::new(LiteLlmAdapter::new(model, base_url));
                Ok(self.make_handler(transport, adapter, provider, model, TokenStrategy::Standard))
            }
            "opencode-zen" => {
                let transport = Arc::new(OpenAiCompatTransport::opencode_zen(env));
                let adapter = Arc::new(OpenAiChatAdapter::new(model, VisionRule::Never));
                Ok(self.make_handler(transport, adapter, provider, model, TokenStrategy::Standard))
            }
            "vertex" => self.vertex_handler(model),
            other => Err(ProxyError::Configuration(format!(
                "no handler construction for provider '{}'",
                other
            ))),
        }
    }

    fn build_handler(&self, target: &str) -> Result<Handler, ProxyError> {
        if self.config.monitor {
            return Ok(self.native_handler(target));
        }

        if let Some(model) = target.strip_prefix("poe:") {
            let transport = Arc::new(OpenAiCompatTransport::poe(&self.config.env)?);
            let adapter = Arc::new(OpenAiChatAdapter::new(model, VisionRule::Always));
            return Ok(self.make_handler(transport, adapter, "poe", model, TokenStrategy::Standard));
        }

        let resolution = resolver::resolve(target, &self.config.env);
        if let Some(warning) = &resolution.deprecation_warning {
            tracing::warn!("{}", warning);
        }

        match resolution.category {
            ProviderCategory::Local => {
                let transport = Arc::new(LocalTransport::new(
                    &resolution.provider_name,
                    &resolution.model_name,
                    resolution.base_url.clone(),
                    &self.config.env,
                    self.config.local_concurrency,
                ));
                let shape = if resolution.provider_name == "ollama" {
                    LocalBodyShape::Ollama
                } else {
                    LocalBodyShape::OpenAiCompat
                };
                let adapter = Arc::new(LocalAdapter::new(
                    &resolution.model_name,
                    shape,
                    shape == LocalBodyShape::OpenAiCompat,
                    self.config.qwen_no_think(),
                ));
                Ok(self.make_handler(
                    transport,
                    adapter,
                    &resolution.provider_name,
                    &resolution.model_name,
                    TokenStrategy::Local,
                ))
            }
            ProviderCategory::NativeAnthropic => Ok(self.native_handler(&resolution.model_name)),
            ProviderCategory::OpenRouter => {
                if !resolution.api_key_available {
                    return Err(ProxyError::Configuration(
                        "OpenRouter target requires OPENROUTER_API_KEY".to_string(),
                    ));
                }
                self.openrouter_handler(&resolution.model_name)
            }
            ProviderCategory::DirectApi => {
                if resolution.api_key_available {
                    return self.direct_api_handler(&resolution);
                }
                // Key missing: walk the fallback chain before giving up
                for route in &resolution.fallback {
                    match route {
                        FallbackRoute::OpenRouter => {
                            if let Some(org) = openrouter_org(&resolution.provider_name) {
                                let model = format!("{}/{}", org, resolution.model_name);
                                tracing::warn!(
                                    "{} key missing; falling back to OpenRouter as {}",
                                    resolution.provider_name,
                                    model
                                );
                                return self.openrouter_handler(&model);
                            }
                        }
                        FallbackRoute::Vertex => {
                            tracing::warn!(
                                "{} key missing; falling back to Vertex",
                                resolution.provider_name
                            );
                            return self.vertex_handler(&resolution.model_name);
                        }
                    }
                }
                Err(ProxyError::Configuration(format!(
                    "provider '{}' requires {} (no fallback route available)",
                    resolution.provider_name,
                    resolution.required_api_key.unwrap_or("an API key"),
                )))
            }
            // Unknown specs with / or @ are misconfigurations, not Anthropic
            // models; refuse rather than passing garbage upstream
            ProviderCategory::Unknown => Err(ProxyError::Configuration(format!(
                "unrecognized model spec '{}'",
                target
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Env, RoleMap};
    use crate::transport::StreamFormat;

    fn config(pairs: &[(&str, &str)]) -> Config {
        Config {
            env: Env::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string()))),
            ..Config::default()
        }
    }

    fn router(config: Config) -> ProxyRouter {
        ProxyRouter::new(config, 52100)
    }

    #[test]
    fn test_role_map_resolution() {
        let mut cfg = config(&[("GEMINI_API_KEY", "k")]);
        cfg.roles = RoleMap {
            opus: Some("gemini@gemini-2.5-pro".to_string()),
            sonnet: None,
            haiku: None,
            subagent: Some("gemini@gemini-2.5-flash".to_string()),
        };
        cfg.default_model = Some("gemini@gemini-2.5-flash".to_string());
        let router = router(cfg);

        assert_eq!(
            router.resolve_target("claude-opus-4-1"),
            "gemini@gemini-2.5-pro"
        );
        // Sonnet unset: falls to the default
        assert_eq!(
            router.resolve_target("claude-sonnet-4"),
            "gemini@gemini-2.5-flash"
        );
        // Haiku unset: subagent covers it
        assert_eq!(
            router.resolve_target("claude-3-5-haiku"),
            "gemini@gemini-2.5-flash"
        );
        // Non-role model: default
        assert_eq!(router.resolve_target("gpt-4o"), "gemini@gemini-2.5-flash");
    }

    #[test]
    fn test_requested_verbatim_without_default() {
        let router = router(config(&[]));
        assert_eq!(router.resolve_target("claude-sonnet-4"), "claude-sonnet-4");
    }

    #[test]
    fn test_monitor_mode_is_always_native() {
        let mut cfg = config(&[]);
        cfg.monitor = true;
        cfg.default_model = Some("oai@gpt-4o".to_string());
        let router = router(cfg);
        assert_eq!(router.resolve_target("claude-sonnet-4"), "claude-sonnet-4");
        assert!(router.is_native("claude-sonnet-4"));
    }

    #[test]
    fn test_handler_cache_reuse() {
        let router = router(config(&[("GEMINI_API_KEY", "k")]));
        let a = router.handler_for("gemini@gemini-2.5-pro").unwrap();
        let b = router.handler_for("gemini@gemini-2.5-pro").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_slash_target_never_falls_to_native() {
        // No keys at all: a slash target must fail, not become Anthropic
        let router = router(config(&[]));
        let err = router.handler_for("somevendor/some-model").unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));

        let err = router.handler_for("oai@gpt-4o").unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));
    }

    #[test]
    fn test_fallback_to_openrouter() {
        let router = router(config(&[("OPENROUTER_API_KEY", "k")]));
        // No OPENAI_API_KEY: routes through OpenRouter as openai/gpt-4o
        let handler = router.handler_for("oai@gpt-4o").unwrap();
        assert_eq!(handler.transport.name(), "openrouter");
        assert_eq!(handler.target_model, "openai/gpt-4o");
    }

    #[test]
    fn test_codex_gets_responses_format() {
        let router = router(config(&[("OPENAI_API_KEY", "k")]));
        let handler = router.handler_for("oai@gpt-5.1-codex").unwrap();
        assert_eq!(
            handler.transport.stream_format(),
            StreamFormat::OpenAiResponsesSse
        );

        let handler = router.handler_for("oai@gpt-4o").unwrap();
        assert_eq!(handler.transport.stream_format(), StreamFormat::OpenAiSse);
    }

    #[test]
    fn test_local_target_builds_without_keys() {
        let router = router(config(&[]));
        let handler = router.handler_for("ollama@llama3.2").unwrap();
        assert_eq!(handler.transport.name(), "ollama");
        assert_eq!(handler.transport.stream_format(), StreamFormat::OllamaJsonl);
    }

    #[test]
    fn test_poe_prefix() {
        let router = router(config(&[("POE_API_KEY", "k")]));
        let handler = router.handler_for("poe:Claude-Sonnet-4").unwrap();
        assert_eq!(handler.transport.name(), "poe");
        assert_eq!(handler.target_model, "Claude-Sonnet-4");
    }

    #[test]
    fn test_anthropic_compat_providers() {
        let router = router(config(&[("MINIMAX_API_KEY", "k")]));
        let handler = router.handler_for("mm@minimax-m2").unwrap();
        assert_eq!(handler.transport.name(), "minimax");
        assert_eq!(
            handler.transport.stream_format(),
            StreamFormat::AnthropicSse
        );
    }

    #[test]
    fn test_is_native_for_count_tokens() {
        let router = router(config(&[("GEMINI_API_KEY", "k")]));
        assert!(router.is_native("claude-sonnet-4"));
        assert!(!router.is_native("gemini@gemini-2.5-pro"));
    }
}
