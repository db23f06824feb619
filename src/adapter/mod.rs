//! Adapter layer - request translation per model family
//!
//! An adapter converts the canonical Anthropic request into one upstream
//! wire format and post-processes that upstream's streamed text. Adapters
//! are stateless per request except for two maps with handler lifetime:
//! the tool-name map (provider-truncated name -> original) and, for Gemini,
//! the thought-signature map, which deliberately survives `reset()`.

pub mod anthropic;
pub mod context_window;
pub mod gemini;
pub mod grok;
pub mod litellm;
pub mod local;
pub mod ollamacloud;
pub mod openai;
pub mod openrouter;
pub mod responses;

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::claude::ClaudeRequest;
use crate::error::ProxyError;

/// A tool call recovered from inline text (Grok's XML escape hatch)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToolCall {
    pub name: String,
    pub arguments: String,
}

/// Result of streaming text post-processing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessedText {
    pub cleaned: String,
    pub was_transformed: bool,
    /// Structured tool calls recovered from the text stream; the translator
    /// emits these as tool_use blocks
    pub tool_calls: Vec<ExtractedToolCall>,
}

impl ProcessedText {
    pub fn passthrough(chunk: &str) -> Self {
        Self {
            cleaned: chunk.to_string(),
            was_transformed: false,
            tool_calls: Vec::new(),
        }
    }
}

/// Mapping from provider-truncated tool names back to the originals, so the
/// streamer can restore the real name before emitting `content_block_start`.
/// Lifetime = handler; cleared on `Adapter::reset`.
#[derive(Debug, Default)]
pub struct ToolNameMap {
    map: Mutex<HashMap<String, String>>,
}

impl ToolNameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, truncated: impl Into<String>, original: impl Into<String>) {
        self.map.lock().unwrap().insert(truncated.into(), original.into());
    }

    /// Original name for a possibly-truncated one; identity when unmapped
    pub fn resolve(&self, name: &str) -> String {
        self.map
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn clear(&self) {
        self.map.lock().unwrap().clear();
    }

    /// Fold another map's entries in (outer adapters merge their inner's)
    pub fn merge_from(&self, other: &ToolNameMap) {
        let other = other.map.lock().unwrap().clone();
        self.map.lock().unwrap().extend(other);
    }
}

/// Per-model-family request translator
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Clear per-request state. Thought signatures survive by design; the
    /// next request references tool calls from the previous response.
    fn reset(&self);

    /// Translate canonical messages into the upstream's message/content shape
    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError>;

    /// Translate tool definitions; empty array when the target has no tools
    fn convert_tools(&self, req: &ClaudeRequest) -> Value;

    /// Assemble the full request body from converted parts
    fn build_payload(&self, req: &ClaudeRequest, messages: Value, tools: Value) -> Value;

    /// Last-chance body mutation: tool-name truncation, local-only cleanup
    fn prepare_request(&self, _body: &mut Value) {}

    /// Streaming text post-processor (reasoning filter, XML normalizer)
    fn process_text_content(&self, chunk: &str, _accumulated: &str) -> ProcessedText {
        ProcessedText::passthrough(chunk)
    }

    /// Invoked by the Gemini stream translator when a functionCall is seen
    fn register_tool_call(&self, _id: &str, _name: &str, _signature: Option<&str>) {}

    /// Reverse a provider-truncated tool name to the original
    fn resolve_tool_name(&self, name: &str) -> String {
        name.to_string()
    }

    /// Context window hint for the target model (overridden at runtime by
    /// local discovery)
    fn context_window(&self, model: &str) -> u64 {
        context_window::lookup(model)
    }

    /// Whether the target model accepts image inputs
    fn supports_vision(&self, model: &str) -> bool;
}
