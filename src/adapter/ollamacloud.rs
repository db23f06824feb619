//! OllamaCloud adapter
//!
//! The hosted Ollama endpoint handles plain chat only: no tool calling, no
//! images. Everything collapses to strings - tool activity is rendered as
//! inline text markers so the model still sees what happened in earlier
//! turns, and the tool definitions are dropped entirely.

use serde_json::{json, Value};

use crate::claude::{ClaudeRequest, ContentBlock, MessageContent, Role};
use crate::error::ProxyError;

use super::Adapter;

pub struct OllamaCloudAdapter {
    target_model: String,
}

impl OllamaCloudAdapter {
    pub fn new(target_model: impl Into<String>) -> Self {
        Self {
            target_model: target_model.into(),
        }
    }
}

/// Render a message's blocks as parts. Images stay as `image_url` parts
/// here so the vision proxy can see them; assembly flattens to strings.
fn convert_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Blocks(blocks) => {
            let parts: Vec<Value> = blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
                    ContentBlock::ToolUse { name, input, .. } => Some(json!({
                        "type": "text",
                        "text": format!(
                            "[Tool Call: {} {}]",
                            name,
                            serde_json::to_string(input).unwrap_or_default()
                        ),
                    })),
                    ContentBlock::ToolResult { content, .. } => Some(json!({
                        "type": "text",
                        "text": format!(
                            "[Tool Result]: {}",
                            content.as_ref().map(|c| c.flatten()).unwrap_or_default()
                        ),
                    })),
                    ContentBlock::Image { source } => Some(json!({
                        "type": "image_url",
                        "image_url": {
                            "url": crate::util::to_data_url(&source.media_type, &source.data)
                        },
                    })),
                    ContentBlock::Thinking { .. } => None,
                })
                .collect();
            Value::Array(parts)
        }
    }
}

impl Adapter for OllamaCloudAdapter {
    fn name(&self) -> &'static str {
        "ollamacloud"
    }

    fn reset(&self) {}

    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError> {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = req.system_text() {
            if !system.is_empty() {
                messages.push(json!({"role": "system", "content": system}));
            }
        }
        for msg in &req.messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": convert_content(&msg.content)}));
        }
        Ok(Value::Array(messages))
    }

    /// No tool support
    fn convert_tools(&self, _req: &ClaudeRequest) -> Value {
        json!([])
    }

    fn build_payload(&self, req: &ClaudeRequest, messages: Value, _tools: Value) -> Value {
        let mut messages = messages;
        crate::adapter::local::flatten_string_messages(&mut messages);
        let mut body = json!({
            "model": self.target_model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(temperature) = req.temperature {
            obj.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = req.max_tokens {
            obj.insert("max_tokens".to_string(), json!(max_tokens));
        }
        body
    }

    fn supports_vision(&self, _model: &str) -> bool {
        false
    }
}
