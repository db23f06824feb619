//! OpenRouter adapter
//!
//! OpenRouter fronts many model families behind one OpenAI-chat endpoint,
//! but the quirks of the underlying family leak through the text stream.
//! The outer adapter does the chat translation; a model-specific inner
//! adapter is composed in (not inherited) purely for streaming text
//! post-processing and last-chance request preparation - Grok's XML tool
//! calls, Gemini's leaked reasoning. Tool-name lookups consult the outer
//! map first, then the inner's.

use serde_json::Value;

use crate::claude::ClaudeRequest;
use crate::error::ProxyError;

use super::gemini::GeminiAdapter;
use super::grok::GrokAdapter;
use super::openai::{OpenAiChatAdapter, VisionRule};
use super::{Adapter, ProcessedText};

pub struct OpenRouterAdapter {
    chat: OpenAiChatAdapter,
    /// Model-family post-processor, when the family needs one
    inner: Option<Box<dyn Adapter>>,
}

impl OpenRouterAdapter {
    pub fn new(target_model: impl Into<String>) -> Self {
        let target_model = target_model.into();
        let lower = target_model.to_ascii_lowercase();

        let inner: Option<Box<dyn Adapter>> = if lower.contains("grok") || lower.contains("x-ai") {
            Some(Box::new(GrokAdapter::new(target_model.clone())))
        } else if lower.contains("gemini") {
            Some(Box::new(GeminiAdapter::new(target_model.clone(), true)))
        } else {
            None
        };

        Self {
            chat: OpenAiChatAdapter::new(target_model, VisionRule::Always),
            inner,
        }
    }
}

/// Remove `format: "uri"` annotations; several OpenRouter backends reject
/// the keyword outright
fn strip_uri_formats(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            if map.get("format").and_then(|f| f.as_str()) == Some("uri") {
                map.remove("format");
            }
            for value in map.values_mut() {
                strip_uri_formats(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_uri_formats(item);
            }
        }
        _ => {}
    }
}

impl Adapter for OpenRouterAdapter {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn reset(&self) {
        self.chat.reset();
        if let Some(inner) = &self.inner {
            inner.reset();
        }
    }

    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError> {
        self.chat.convert_messages(req)
    }

    fn convert_tools(&self, req: &ClaudeRequest) -> Value {
        let mut tools = self.chat.convert_tools(req);
        strip_uri_formats(&mut tools);
        tools
    }

    fn build_payload(&self, req: &ClaudeRequest, messages: Value, tools: Value) -> Value {
        self.chat.build_payload(req, messages, tools)
    }

    fn prepare_request(&self, body: &mut Value) {
        self.chat.prepare_request(body);
        if let Some(inner) = &self.inner {
            inner.prepare_request(body);
        }
    }

    fn process_text_content(&self, chunk: &str, accumulated: &str) -> ProcessedText {
        match &self.inner {
            Some(inner) => inner.process_text_content(chunk, accumulated),
            None => ProcessedText::passthrough(chunk),
        }
    }

    fn register_tool_call(&self, id: &str, name: &str, signature: Option<&str>) {
        if let Some(inner) = &self.inner {
            inner.register_tool_call(id, name, signature);
        }
    }

    fn resolve_tool_name(&self, name: &str) -> String {
        let resolved = self.chat.resolve_tool_name(name);
        if resolved != name {
            return resolved;
        }
        match &self.inner {
            Some(inner) => inner.resolve_tool_name(name),
            None => resolved,
        }
    }

    fn supports_vision(&self, model: &str) -> bool {
        let lower = model.to_ascii_lowercase();
        [
            "gpt-4o", "gpt-5", "gemini", "claude", "pixtral", "llava", "-vl", "vision",
        ]
        .iter()
        .any(|family| lower.contains(family))
    }
}
