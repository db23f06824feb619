//! Provider resolution
//!
//! Classifies a raw model string into a provider category and reports which
//! API key it needs, whether that key is present, and which fallback routes
//! are open if it is not. This is a pure function over `(raw, env)` - it
//! never performs I/O, so the router can call it on every cache miss.
//!
//! Rule order (first match wins):
//! 1. Local prefixes (`ollama/`, `lmstudio/`, `vllm/`, `mlx/`, also `@` forms)
//!    and anything parseable as `scheme://...`
//! 2. Known direct-API prefixes (`gemini@`, `oai@`, `glm@`, `minimax@`, ...)
//! 3. Explicit `or@` / `openrouter/`
//! 4. Ecosystem prefixes used by OpenRouter (`google/`, `openai/`, `x-ai/`, ...)
//! 5. No `/` and no `@` - native Anthropic
//! 6. Otherwise unknown

use super::{normalize_provider, ModelSpec, NATIVE_PROVIDER};
use crate::config::Env;

/// Disjoint provider categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCategory {
    Local,
    DirectApi,
    OpenRouter,
    NativeAnthropic,
    Unknown,
}

/// Open fallback routes for a direct-API provider whose key is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackRoute {
    OpenRouter,
    Vertex,
}

/// Result of resolving a raw model string against the environment
#[derive(Debug, Clone)]
pub struct ProviderResolution {
    pub category: ProviderCategory,
    pub provider_name: String,
    pub model_name: String,
    /// Canonical `provider@model` id (or the original string for native/local)
    pub full_id: String,
    /// Primary env var holding the provider's API key, if one is required
    pub required_api_key: Option<&'static str>,
    pub api_key_available: bool,
    /// Routes to try when the key is missing (direct-api only)
    pub fallback: Vec<FallbackRoute>,
    pub deprecation_warning: Option<String>,
    /// Base URL for `scheme://` local specs
    pub base_url: Option<String>,
}

/// Providers served over their own HTTP APIs.
/// (canonical name, key env vars - any one suffices, key is optional)
/// `key_optional` covers free tiers (opencode-zen), keyless deployments
/// (litellm) and OAuth fallbacks (kimi-coding).
const DIRECT_PROVIDERS: &[(&str, &[&str], bool)] = &[
    ("gemini", &["GEMINI_API_KEY"], false),
    ("openai", &["OPENAI_API_KEY"], false),
    ("xai", &["XAI_API_KEY"], false),
    ("minimax", &["MINIMAX_API_KEY"], false),
    ("kimi", &["MOONSHOT_API_KEY", "KIMI_API_KEY"], false),
    ("kimi-coding", &["MOONSHOT_API_KEY", "KIMI_API_KEY"], true),
    ("glm", &["ZHIPU_API_KEY", "GLM_API_KEY"], false),
    ("glm-coding", &["GLM_CODING_API_KEY"], false),
    ("zai", &["ZAI_API_KEY"], false),
    ("ollamacloud", &["OLLAMA_API_KEY"], false),
    ("litellm", &["LITELLM_API_KEY"], true),
    ("vertex", &["VERTEX_API_KEY", "VERTEX_PROJECT"], false),
    ("opencode-zen", &[], true),
];

/// Local inference server prefixes
const LOCAL_PROVIDERS: &[&str] = &["ollama", "lmstudio", "vllm", "mlx"];

/// Org prefixes that identify OpenRouter-style ecosystem model ids
const ECOSYSTEM_PREFIXES: &[&str] = &[
    "google",
    "openai",
    "anthropic",
    "x-ai",
    "meta-llama",
    "mistralai",
    "qwen",
    "deepseek",
    "moonshotai",
    "z-ai",
    "minimax",
    "nvidia",
    "microsoft",
    "amazon",
    "cohere",
    "perplexity",
];

fn direct_provider(name: &str) -> Option<&'static (&'static str, &'static [&'static str], bool)> {
    DIRECT_PROVIDERS.iter().find(|(p, _, _)| *p == name)
}

fn key_available(env: &Env, vars: &[&str]) -> bool {
    vars.iter().any(|v| env.has(v))
}

fn fallback_routes(env: &Env) -> Vec<FallbackRoute> {
    let mut routes = Vec::new();
    if env.has("OPENROUTER_API_KEY") {
        routes.push(FallbackRoute::OpenRouter);
    }
    if env.has("VERTEX_API_KEY") || env.has("VERTEX_PROJECT") {
        routes.push(FallbackRoute::Vertex);
    }
    routes
}

/// Resolve a raw model string. Pure over `(raw, env)`.
pub fn resolve(raw: &str, env: &Env) -> ProviderResolution {
    let raw = raw.trim();

    // Rule 1a: scheme://host/... is always local
    if raw.contains("://") {
        let spec = ModelSpec::parse(raw);
        return ProviderResolution {
            category: ProviderCategory::Local,
            provider_name: spec.provider,
            model_name: spec.model,
            full_id: raw.to_string(),
            required_api_key: None,
            api_key_available: true,
            fallback: Vec::new(),
            deprecation_warning: None,
            base_url: spec.base_url,
        };
    }

    // Rule 1b: known local prefixes, slash or @ form
    for local in LOCAL_PROVIDERS {
        let model = raw
            .strip_prefix(&format!("{}/", local))
            .or_else(|| raw.strip_prefix(&format!("{}@", local)));
        if let Some(model) = model {
            return ProviderResolution {
                category: ProviderCategory::Local,
                provider_name: local.to_string(),
                model_name: model.to_string(),
                full_id: format!("{}@{}", local, model),
                required_api_key: None,
                api_key_available: true,
                fallback: Vec::new(),
                deprecation_warning: None,
                base_url: None,
            };
        }
    }

    // @-form: the provider name is explicit
    if let Some((prefix, model)) = raw.split_once('@') {
        let (provider, legacy) = normalize_provider(prefix);
        let warning = legacy.then(|| {
            format!(
                "model spec '{}' uses the deprecated short form '{}'; use '{}@{}'",
                raw, prefix, provider, model
            )
        });

        if provider == "openrouter" {
            return openrouter_resolution(model, env, warning);
        }

        if let Some((name, keys, optional)) = direct_provider(&provider) {
            let available = key_available(env, keys);
            return ProviderResolution {
                category: ProviderCategory::DirectApi,
                provider_name: name.to_string(),
                model_name: model.to_string(),
                full_id: format!("{}@{}", name, model),
                required_api_key: keys.first().copied(),
                api_key_available: available || *optional,
                fallback: if available || *optional {
                    Vec::new()
                } else {
                    fallback_routes(env)
                },
                deprecation_warning: warning,
                base_url: None,
            };
        }

        return unknown_resolution(raw);
    }

    // Slash forms: explicit openrouter, direct aliases, or ecosystem prefixes
    if let Some((prefix, model)) = raw.split_once('/') {
        if prefix == "openrouter" {
            return openrouter_resolution(model, env, None);
        }

        let (provider, legacy) = normalize_provider(prefix);
        let is_ecosystem = ECOSYSTEM_PREFIXES.contains(&prefix);

        // Direct aliases win over ecosystem prefixes only when the raw prefix
        // is not itself an ecosystem org name ("openai/gpt-4o" is OpenRouter,
        // "oai@gpt-4o" is direct).
        if !is_ecosystem {
            if let Some((name, keys, optional)) = direct_provider(&provider) {
                let available = key_available(env, keys);
                let warning = legacy.then(|| {
                    format!(
                        "model spec '{}' uses the deprecated short form '{}'",
                        raw, prefix
                    )
                });
                return ProviderResolution {
                    category: ProviderCategory::DirectApi,
                    provider_name: name.to_string(),
                    model_name: model.to_string(),
                    full_id: format!("{}@{}", name, model),
                    required_api_key: keys.first().copied(),
                    api_key_available: available || *optional,
                    fallback: if available || *optional {
                        Vec::new()
                    } else {
                        fallback_routes(env)
                    },
                    deprecation_warning: warning,
                    base_url: None,
                };
            }
        }

        if is_ecosystem {
            // The whole id (org/model) is the OpenRouter model name
            return openrouter_resolution(raw, env, None);
        }

        return unknown_resolution(raw);
    }

    // Rule 5: bare model name - native Anthropic
    ProviderResolution {
        category: ProviderCategory::NativeAnthropic,
        provider_name: NATIVE_PROVIDER.to_string(),
        model_name: raw.to_string(),
        full_id: raw.to_string(),
        required_api_key: Some("ANTHROPIC_API_KEY"),
        api_key_available: env.has("ANTHROPIC_API_KEY"),
        fallback: Vec::new(),
        deprecation_warning: None,
        base_url: None,
    }
}

fn openrouter_resolution(
    model: &str,
    env: &Env,
    warning: Option<String>,
) -> ProviderResolution {
    ProviderResolution {
        category: ProviderCategory::OpenRouter,
        provider_name: "openrouter".to_string(),
        model_name: model.to_string(),
        full_id: format!("openrouter@{}", model),
        required_api_key: Some("OPENROUTER_API_KEY"),
        api_key_available: env.has("OPENROUTER_API_KEY"),
        fallback: Vec::new(),
        deprecation_warning: warning,
        base_url: None,
    }
}

fn unknown_resolution(raw: &str) -> ProviderResolution {
    ProviderResolution {
        category: ProviderCategory::Unknown,
        provider_name: String::new(),
        model_name: raw.to_string(),
        full_id: raw.to_string(),
        required_api_key: None,
        api_key_available: false,
        fallback: Vec::new(),
        deprecation_warning: None,
        base_url: None,
    }
}
