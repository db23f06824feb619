//! Anthropic → OpenAI Responses API adapter (Codex models)
//!
//! The Responses API restructures everything: conversation history lives in
//! `input[]` items rather than `messages`, the system prompt moves to a
//! top-level `instructions` string, tool definitions are flat (no nested
//! `function` object), and historical tool activity becomes explicit
//! `function_call` / `function_call_output` items.
//!
//! Tool names are capped hard (Qwen-served Codex-compatible backends enforce
//! 64 chars), so truncation plus the tool-name map matters most here.

use serde_json::{json, Value};

use crate::claude::{ClaudeRequest, ContentBlock, MessageContent, Role};
use crate::error::ProxyError;

use super::{Adapter, ToolNameMap};

/// Responses API floor on max_output_tokens
const MIN_OUTPUT_TOKENS: u64 = 16;

/// Hard cap on function names for Responses-served backends
pub const RESPONSES_TOOL_NAME_LIMIT: usize = 64;

pub struct OpenAiResponsesAdapter {
    target_model: String,
    tool_names: ToolNameMap,
}

impl OpenAiResponsesAdapter {
    pub fn new(target_model: impl Into<String>) -> Self {
        Self {
            target_model: target_model.into(),
            tool_names: ToolNameMap::new(),
        }
    }
}

/// Reverse a streamer-minted Claude tool id back to the upstream call id:
/// `toolu_call_x` came from a bare `call_x`, any other `toolu_x` came from
/// `fc_x` with the prefix swapped.
fn upstream_call_id(id: &str) -> String {
    match id.strip_prefix("toolu_") {
        Some(rest) if rest.starts_with("call_") => rest.to_string(),
        Some(rest) => format!("fc_{}", rest),
        None => id.to_string(),
    }
}

impl Adapter for OpenAiResponsesAdapter {
    fn name(&self) -> &'static str {
        "openai-responses"
    }

    fn reset(&self) {
        self.tool_names.clear();
    }

    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError> {
        let mut items: Vec<Value> = Vec::new();

        for msg in &req.messages {
            let (role, text_type) = match msg.role {
                Role::User => ("user", "input_text"),
                Role::Assistant => ("assistant", "output_text"),
            };

            let mut content_parts: Vec<Value> = Vec::new();
            let blocks = match &msg.content {
                MessageContent::Text(text) => {
                    items.push(json!({
                        "role": role,
                        "content": [{"type": text_type, "text": text}],
                    }));
                    continue;
                }
                MessageContent::Blocks(blocks) => blocks,
            };

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        content_parts.push(json!({"type": text_type, "text": text}));
                    }
                    ContentBlock::Image { source } => {
                        content_parts.push(json!({
                            "type": "input_image",
                            "image_url": crate::util::to_data_url(&source.media_type, &source.data),
                        }));
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        // Flush accumulated content first to keep block order
                        if !content_parts.is_empty() {
                            items.push(json!({"role": role, "content": content_parts}));
                            content_parts = Vec::new();
                        }
                        items.push(json!({
                            "type": "function_call",
                            "call_id": upstream_call_id(id),
                            "name": name,
                            "arguments": serde_json::to_string(input).unwrap_or_default(),
                            "status": "completed",
                        }));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        if !content_parts.is_empty() {
                            items.push(json!({"role": role, "content": content_parts}));
                            content_parts = Vec::new();
                        }
                        items.push(json!({
                            "type": "function_call_output",
                            "call_id": upstream_call_id(tool_use_id),
                            "output": content.as_ref().map(|c| c.flatten()).unwrap_or_default(),
                        }));
                    }
                    ContentBlock::Thinking { .. } => {}
                }
            }

            if !content_parts.is_empty() {
                items.push(json!({"role": role, "content": content_parts}));
            }
        }

        Ok(Value::Array(items))
    }

    /// Responses tools are flat: no nested `function` object
    fn convert_tools(&self, req: &ClaudeRequest) -> Value {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .flatten()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                })
            })
            .collect();
        Value::Array(tools)
    }

    fn build_payload(&self, req: &ClaudeRequest, messages: Value, tools: Value) -> Value {
        let mut body = json!({
            "model": self.target_model,
            "input": messages,
            "stream": true,
        });
        let obj = body.as_object_mut().unwrap();

        if let Some(system) = req.system_text() {
            if !system.is_empty() {
                obj.insert("instructions".to_string(), json!(system));
            }
        }
        if let Some(max_tokens) = req.max_tokens {
            obj.insert(
                "max_output_tokens".to_string(),
                json!(max_tokens.max(MIN_OUTPUT_TOKENS)),
            );
        }
        if let Some(temperature) = req.temperature {
            obj.insert("temperature".to_string(), json!(temperature));
        }
        if tools.as_array().map(|t| !t.is_empty()).unwrap_or(false) {
            obj.insert("tools".to_string(), tools);
        }

        body
    }

    /// Flat tool shape: the name sits at `/name`, not `/function/name`.
    /// Truncations also rewrite historical `function_call` items so names
    /// stay consistent across the conversation.
    fn prepare_request(&self, body: &mut Value) {
        let mut renames: Vec<(String, String)> = Vec::new();

        if let Some(tools) = body.get_mut("tools").and_then(|t| t.as_array_mut()) {
            for tool in tools {
                let Some(name) = tool.get("name").and_then(|n| n.as_str()).map(String::from)
                else {
                    continue;
                };
                if name.len() > RESPONSES_TOOL_NAME_LIMIT {
                    let truncated = crate::util::truncate_utf8_safe(&name, RESPONSES_TOOL_NAME_LIMIT)
                        .to_string();
                    self.tool_names.insert(truncated.clone(), name.clone());
                    renames.push((name, truncated.clone()));
                    tool["name"] = json!(truncated);
                }
            }
        }

        if renames.is_empty() {
            return;
        }
        if let Some(items) = body.get_mut("input").and_then(|i| i.as_array_mut()) {
            for item in items {
                if item.get("type").and_then(|t| t.as_str()) != Some("function_call") {
                    continue;
                }
                if let Some(current) = item.get("name").and_then(|n| n.as_str()) {
                    if let Some((_, truncated)) =
                        renames.iter().find(|(original, _)| original == current)
                    {
                        item["name"] = json!(truncated.clone());
                    }
                }
            }
        }
    }

    fn resolve_tool_name(&self, name: &str) -> String {
        self.tool_names.resolve(name)
    }

    fn supports_vision(&self, _model: &str) -> bool {
        true
    }
}
