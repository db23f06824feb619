//! Runtime configuration
//!
//! The core consumes a listening port, a default target model, per-role
//! overrides, and environment variables. Profile files on disk belong to the
//! outer CLI and never reach this layer; everything here is env + flags.

use std::collections::HashMap;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Immutable snapshot of the process environment.
///
/// The provider resolver is a pure function over `(raw, env)`; snapshotting
/// keeps it deterministic and lets tests inject environments without
/// touching process globals.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    /// Capture the current process environment
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build from explicit pairs (tests)
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            vars: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    /// Whether the variable is set to a non-empty value
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Provider base-URL override, e.g. `base_url("OPENAI")` reads
    /// `OPENAI_BASE_URL`
    pub fn base_url(&self, provider_prefix: &str) -> Option<&str> {
        self.vars
            .get(&format!("{}_BASE_URL", provider_prefix))
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Boolean flag: "1" or "true" (case-insensitive)
    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// Per-role model overrides. A request whose model name contains the role
/// (case-insensitive) is redirected to the mapped target.
#[derive(Debug, Clone, Default)]
pub struct RoleMap {
    pub opus: Option<String>,
    pub sonnet: Option<String>,
    pub haiku: Option<String>,
    pub subagent: Option<String>,
}

impl RoleMap {
    /// Look up the mapped target for a requested model name, if any.
    /// Haiku-class requests fall back to the subagent mapping: agent CLIs
    /// use their haiku slot for subagent work.
    pub fn target_for(&self, requested_model: &str) -> Option<&str> {
        let lower = requested_model.to_ascii_lowercase();
        if lower.contains("opus") {
            return self.opus.as_deref();
        }
        if lower.contains("sonnet") {
            return self.sonnet.as_deref();
        }
        if lower.contains("haiku") {
            return self.haiku.as_deref().or(self.subagent.as_deref());
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.opus.is_none()
            && self.sonnet.is_none()
            && self.haiku.is_none()
            && self.subagent.is_none()
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on (127.0.0.1 only). None = auto-pick from the range.
    pub port: Option<u16>,
    /// Default target when no role override matches
    pub default_model: Option<String>,
    /// Per-role overrides
    pub roles: RoleMap,
    /// Monitor mode: every request goes straight to Anthropic unchanged
    pub monitor: bool,
    /// Concurrency limit for local inference requests (0 = unbounded)
    pub local_concurrency: usize,
    /// Optional log file (the proxy shares a terminal with its client)
    pub log_file: Option<PathBuf>,
    /// Environment snapshot
    pub env: Env,
}

impl Config {
    /// Port range scanned when no explicit port is given
    pub const PORT_RANGE: std::ops::Range<u16> = 52100..52200;

    /// State directory: `~/.claudish`
    pub fn state_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claudish")
    }

    /// Token status file for a listening port
    pub fn token_status_path(port: u16) -> PathBuf {
        Self::state_dir().join(format!("tokens-{}.json", port))
    }

    /// Context-window override from `CLAUDISH_CONTEXT_WINDOW`
    pub fn context_window_override(&self) -> Option<u64> {
        self.env
            .get("CLAUDISH_CONTEXT_WINDOW")
            .and_then(|v| v.parse().ok())
    }

    /// Qwen `/no_think` directive toggle
    pub fn qwen_no_think(&self) -> bool {
        self.env.flag("CLAUDISH_QWEN_NO_THINK")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            default_model: None,
            roles: RoleMap::default(),
            monitor: false,
            local_concurrency: 0,
            log_file: None,
            env: Env::capture(),
        }
    }
}
