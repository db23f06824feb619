//! LiteLLM adapter
//!
//! LiteLLM fronts arbitrary backends with an OpenAI-compatible API, so this
//! is the standard chat translation plus two LiteLLM-specific pieces:
//!
//! - **MiniMax image workaround.** LiteLLM fails to forward `image_url`
//!   parts to MiniMax backends; for any target model containing `minimax`
//!   the image parts are rewritten into inline `[Image base64:...]` text
//!   appended to the last text part of the same message.
//!
//! - **Vision hints.** Whether the backend model accepts images is read from
//!   the local model caches the pricing warmer maintains
//!   (`~/.claudish/litellm-models-<hash>.json` and `all-models.json`),
//!   falling back to a family-name heuristic.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::claude::ClaudeRequest;
use crate::config::Config;
use crate::error::ProxyError;

use super::openai::{
    convert_messages_openai, convert_tools_openai, OpenAiChatAdapter, VisionRule,
};
use super::{Adapter, ToolNameMap};

pub struct LiteLlmAdapter {
    inner: OpenAiChatAdapter,
    base_url: String,
}

impl LiteLlmAdapter {
    pub fn new(target_model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            inner: OpenAiChatAdapter::new(target_model, VisionRule::Always),
            base_url: base_url.into(),
        }
    }

    /// Cache file name: sha256 of the base URL, first 16 hex chars
    pub fn models_cache_path(base_url: &str) -> std::path::PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(base_url.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        Config::state_dir().join(format!("litellm-models-{}.json", &hash[..16]))
    }

    fn vision_hint_from_caches(&self, model: &str) -> Option<bool> {
        let candidates = [
            Self::models_cache_path(&self.base_url),
            Config::state_dir().join("all-models.json"),
        ];
        for path in candidates {
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            if let Some(hint) = vision_hint(&parsed, model) {
                return Some(hint);
            }
        }
        None
    }
}

/// Search a model-list document for a vision capability flag
fn vision_hint(doc: &Value, model: &str) -> Option<bool> {
    let entries = doc
        .get("data")
        .and_then(|d| d.as_array())
        .or_else(|| doc.as_array())?;
    let entry = entries.iter().find(|e| {
        ["id", "model_name", "model"].iter().any(|key| {
            e.get(key)
                .and_then(|v| v.as_str())
                .map(|v| v == model || v.ends_with(model))
                .unwrap_or(false)
        })
    })?;
    entry
        .pointer("/model_info/supports_vision")
        .or_else(|| entry.get("supports_vision"))
        .and_then(|v| v.as_bool())
}

/// LiteLLM's MiniMax path drops image_url parts; inline them as text
fn inline_images_for_minimax(messages: &mut Value) {
    let Some(messages) = messages.as_array_mut() else {
        return;
    };
    for message in messages {
        let Some(parts) = message.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };

        let mut inlined: Vec<String> = Vec::new();
        parts.retain(|part| {
            if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                if let Some(url) = part.pointer("/image_url/url").and_then(|u| u.as_str()) {
                    let raw = url.split_once(',').map(|(_, d)| d).unwrap_or(url);
                    inlined.push(format!("\n[Image base64:{}]", raw));
                }
                false
            } else {
                true
            }
        });

        if inlined.is_empty() {
            continue;
        }
        let suffix = inlined.concat();
        // Append to the last text part, or add one if none survives
        if let Some(last_text) = parts
            .iter_mut()
            .rev()
            .find(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
        {
            if let Some(slot) = last_text.get_mut("text") {
                let combined = format!("{}{}", slot.as_str().unwrap_or(""), suffix);
                *slot = json!(combined);
            }
        } else {
            parts.push(json!({"type": "text", "text": suffix}));
        }
    }
}

impl Adapter for LiteLlmAdapter {
    fn name(&self) -> &'static str {
        "litellm"
    }

    fn reset(&self) {
        self.inner.reset();
    }

    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError> {
        let mut messages = Value::Array(convert_messages_openai(req));
        if self.inner.target_model().to_ascii_lowercase().contains("minimax") {
            inline_images_for_minimax(&mut messages);
        }
        Ok(messages)
    }

    fn convert_tools(&self, req: &ClaudeRequest) -> Value {
        convert_tools_openai(req)
    }

    fn build_payload(&self, req: &ClaudeRequest, messages: Value, tools: Value) -> Value {
        self.inner.build_payload(req, messages, tools)
    }

    fn prepare_request(&self, body: &mut Value) {
        self.inner.prepare_request(body);
    }

    fn resolve_tool_name(&self, name: &str) -> String {
        self.inner.resolve_tool_name(name)
    }

    fn supports_vision(&self, model: &str) -> bool {
        if let Some(hint) = self.vision_hint_from_caches(model) {
            return hint;
        }
        // Heuristic for uncached backends: the common multimodal families
        let lower = model.to_ascii_lowercase();
        ["gpt-4o", "gpt-5", "gemini", "claude", "pixtral", "llava", "-vl"]
            .iter()
            .any(|family| lower.contains(family))
    }
}

/// Exposed for the router: the inner tool-name map must merge outward when
/// LiteLLM is composed under another adapter.
impl LiteLlmAdapter {
    pub fn tool_names(&self) -> &ToolNameMap {
        self.inner.tool_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimax_images_inlined() {
        let raw = json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "look at this"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "QUJD"}}
                ]
            }]
        });
        let (req, _) = ClaudeRequest::normalize(&raw).unwrap();
        let adapter = LiteLlmAdapter::new("minimax-m2", "http://localhost:4000");
        let messages = adapter.convert_messages(&req).unwrap();

        let parts = messages[0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["text"], "look at this\n[Image base64:QUJD]");
    }

    #[test]
    fn test_non_minimax_keeps_image_url() {
        let raw = json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "QUJD"}}
                ]
            }]
        });
        let (req, _) = ClaudeRequest::normalize(&raw).unwrap();
        let adapter = LiteLlmAdapter::new("gpt-4o", "http://localhost:4000");
        let messages = adapter.convert_messages(&req).unwrap();
        let parts = messages[0]["content"].as_array().unwrap();
        assert_eq!(parts[1]["type"], "image_url");
    }

    #[test]
    fn test_vision_hint_parsing() {
        let doc = json!({"data": [
            {"model_name": "my-backend", "model_info": {"supports_vision": true}},
            {"model_name": "text-only", "model_info": {"supports_vision": false}}
        ]});
        assert_eq!(vision_hint(&doc, "my-backend"), Some(true));
        assert_eq!(vision_hint(&doc, "text-only"), Some(false));
        assert_eq!(vision_hint(&doc, "absent"), None);
    }

    #[test]
    fn test_vision_heuristic_fallback() {
        let adapter = LiteLlmAdapter::new("m", "http://localhost:4000/test-no-cache");
        assert!(adapter.supports_vision("openai/gpt-4o"));
        assert!(adapter.supports_vision("qwen2-vl-72b"));
        assert!(!adapter.supports_vision("deepseek-chat"));
    }

    #[test]
    fn test_cache_path_is_hash_keyed() {
        let a = LiteLlmAdapter::models_cache_path("http://a:4000");
        let b = LiteLlmAdapter::models_cache_path("http://b:4000");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("litellm-models-"));
        // 16-hex-char hash segment
        assert_eq!(name.len(), "litellm-models-".len() + 16 + ".json".len());
    }
}
