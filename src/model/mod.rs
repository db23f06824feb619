//! Model spec parsing
//!
//! A target model is addressed as one of:
//! - `provider@model` (e.g. `oai@gpt-4o`, `gemini@gemini-2.5-pro`)
//! - `provider/model` for ecosystem-style ids (e.g. `openrouter/x-ai/grok-4`)
//! - `scheme://host:port/path/model` for ad-hoc local endpoints
//! - a bare model name, which means native Anthropic
//!
//! Short provider aliases are normalized here; single-character forms are
//! accepted but flagged as deprecated.

pub mod resolver;

pub use resolver::{resolve, ProviderCategory, ProviderResolution};

/// Structured model identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
    /// Reconstructed base URL for `scheme://` specs
    pub base_url: Option<String>,
}

/// Provider name for targets with no explicit provider
pub const NATIVE_PROVIDER: &str = "native-anthropic";

/// Alias table: short form → canonical provider name.
/// Single-character entries are legacy and produce a deprecation warning.
const ALIASES: &[(&str, &str)] = &[
    ("g", "gemini"),
    ("gem", "gemini"),
    ("oai", "openai"),
    ("or", "openrouter"),
    ("mm", "minimax"),
    ("k", "kimi"),
    ("kc", "kimi-coding"),
    ("gc", "glm-coding"),
    ("z", "zai"),
    ("oc", "ollamacloud"),
    ("zen", "opencode-zen"),
    ("v", "vertex"),
    ("x", "xai"),
    ("lite", "litellm"),
];

/// Normalize a provider alias to its canonical name.
/// Returns (canonical, was_legacy_short_form).
pub fn normalize_provider(provider: &str) -> (String, bool) {
    let lower = provider.to_ascii_lowercase();
    for (alias, canonical) in ALIASES {
        if lower == *alias {
            return (canonical.to_string(), alias.len() == 1);
        }
    }
    (lower, false)
}

impl ModelSpec {
    /// Parse a raw model string into a structured spec.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();

        // scheme://host:port/path/model — synthesize a provider from the host
        // and peel the model off the last path segment
        if let Some((scheme, rest)) = raw.split_once("://") {
            if !scheme.is_empty() && !rest.is_empty() {
                return Self::parse_url_spec(scheme, rest);
            }
        }

        // provider@model
        if let Some((provider, model)) = raw.split_once('@') {
            if !provider.is_empty() && !model.is_empty() {
                let (provider, _) = normalize_provider(provider);
                return ModelSpec {
                    provider,
                    model: model.to_string(),
                    base_url: None,
                };
            }
        }

        // Everything else is a native Anthropic model name (ecosystem-style
        // slash ids are classified later by the resolver, not split here)
        ModelSpec {
            provider: NATIVE_PROVIDER.to_string(),
            model: raw.to_string(),
            base_url: None,
        }
    }

    fn parse_url_spec(scheme: &str, rest: &str) -> Self {
        let (host, path) = match rest.split_once('/') {
            Some((h, p)) => (h, p),
            None => (rest, ""),
        };

        let model = path.rsplit('/').next().unwrap_or("").to_string();
        let base_path = match path.rfind('/') {
            Some(idx) => &path[..idx],
            None => "",
        };

        let base_url = if base_path.is_empty() {
            format!("{}://{}", scheme, host)
        } else {
            format!("{}://{}/{}", scheme, host, base_path)
        };

        // Synthesized provider: the host with port and dots flattened
        let provider = host.replace([':', '.'], "-");

        ModelSpec {
            provider,
            model,
            base_url: Some(base_url),
        }
    }

    /// Render back to the `provider@model` form. Inverse of `parse` for all
    /// registered providers.
    pub fn unparse(&self) -> String {
        if self.provider == NATIVE_PROVIDER {
            self.model.clone()
        } else {
            format!("{}@{}", self.provider, self.model)
        }
    }
}
