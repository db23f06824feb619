//! Anthropic → OpenAI Chat Completions adapter
//!
//! The workhorse translation: most cloud providers (OpenAI, xAI, OpenRouter,
//! GLM, opencode-zen, Poe, LiteLLM) and all OpenAI-compatible local servers
//! speak this format.
//!
//! # Key mappings
//!
//! | Anthropic                       | OpenAI                            |
//! |---------------------------------|-----------------------------------|
//! | Top-level `system` field        | `messages[0].role: "system"`      |
//! | `image` (base64 source)         | `image_url` with `data:` URL      |
//! | `tool_use` block                | assistant `tool_calls[]` entry    |
//! | `tool_result` block             | separate `role: "tool"` message   |
//! | `thinking.budget_tokens`        | `reasoning_effort` (o-series)     |
//! | `max_tokens`                    | `max_completion_tokens` (new fams)|
//!
//! A single Anthropic message can fan out into several OpenAI messages:
//! tool_result blocks become their own `role: "tool"` entries, emitted ahead
//! of the remaining user content so they follow the assistant turn that
//! issued the calls.

use serde::Serialize;
use serde_json::{json, Value};

use crate::claude::{ClaudeRequest, ContentBlock, MessageContent, Role, ToolChoice};
use crate::error::ProxyError;
use crate::util::{to_data_url, truncate_utf8_safe};

use super::{Adapter, ToolNameMap};

/// OpenAI caps function names at 64 characters
pub const OPENAI_TOOL_NAME_LIMIT: usize = 64;

/// Per-provider vision capability rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionRule {
    Always,
    Never,
    /// OpenAI: everything modern except 3.5 and the mini reasoning models
    OpenAiFamily,
    /// GLM: only the `glm-*v*` vision variants
    GlmFamily,
    /// xAI: only explicit vision models
    GrokFamily,
}

impl VisionRule {
    pub fn allows(&self, model: &str) -> bool {
        let lower = model.to_ascii_lowercase();
        match self {
            VisionRule::Always => true,
            VisionRule::Never => false,
            VisionRule::OpenAiFamily => {
                !lower.contains("gpt-3.5")
                    && !lower.contains("o1-mini")
                    && !lower.contains("o3-mini")
                    && !lower.contains("o4-mini")
            }
            VisionRule::GlmFamily => {
                // glm-4v, glm-4.5v, glm-4.6v ... the v sits inside the version
                lower
                    .strip_prefix("glm-")
                    .map(|rest| rest.contains('v'))
                    .unwrap_or(false)
            }
            VisionRule::GrokFamily => lower.contains("vision"),
        }
    }
}

pub struct OpenAiChatAdapter {
    target_model: String,
    vision: VisionRule,
    tool_names: ToolNameMap,
    tool_name_limit: usize,
}

impl OpenAiChatAdapter {
    pub fn new(target_model: impl Into<String>, vision: VisionRule) -> Self {
        Self {
            target_model: target_model.into(),
            vision,
            tool_names: ToolNameMap::new(),
            tool_name_limit: OPENAI_TOOL_NAME_LIMIT,
        }
    }

    pub fn target_model(&self) -> &str {
        &self.target_model
    }

    pub fn tool_names(&self) -> &ToolNameMap {
        &self.tool_names
    }
}

// ============================================================================
// OpenAI Wire Types (Serialize)
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum OpenAiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
pub(crate) struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiFunctionCall {
    pub name: String,
    pub arguments: String,
}

// ============================================================================
// Conversion
// ============================================================================

/// The newer OpenAI families reject `max_tokens` in favor of
/// `max_completion_tokens`
pub fn uses_completion_tokens(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    ["gpt-5", "o1", "o3", "o4"]
        .iter()
        .any(|family| lower.starts_with(family) || lower.contains(&format!("/{}", family)))
}

/// Map a thinking budget onto the o-series `reasoning_effort` ladder
pub fn reasoning_effort_for_budget(budget_tokens: u64) -> &'static str {
    if budget_tokens < 4_000 {
        "minimal"
    } else if budget_tokens < 16_000 {
        "low"
    } else if budget_tokens < 32_000 {
        "medium"
    } else {
        "high"
    }
}

fn is_reasoning_family(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    lower.starts_with("o1") || lower.starts_with("o3")
}

/// Anthropic tool ids minted by our streamers carry a `toolu_` prefix over
/// the upstream call id; strip it when sending the conversation back.
pub fn upstream_call_id(id: &str) -> String {
    match id.strip_prefix("toolu_") {
        Some(rest) if rest.starts_with("call_") => rest.to_string(),
        _ => id.to_string(),
    }
}

/// Convert one Anthropic message into one or more OpenAI messages.
/// Shared with the LiteLLM and local adapters.
pub(crate) fn convert_message(
    role: Role,
    content: &MessageContent,
) -> Vec<OpenAiMessage> {
    let role_str = match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let blocks = match content {
        MessageContent::Text(text) => {
            return vec![OpenAiMessage {
                role: role_str,
                content: Some(OpenAiContent::Text(text.clone())),
                tool_calls: None,
                tool_call_id: None,
            }];
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut messages: Vec<OpenAiMessage> = Vec::new();
    let mut text_parts: Vec<String> = Vec::new();
    let mut image_parts: Vec<OpenAiContentPart> = Vec::new();
    let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::Image { source } => {
                image_parts.push(OpenAiContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: to_data_url(&source.media_type, &source.data),
                    },
                });
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(OpenAiToolCall {
                    id: upstream_call_id(id),
                    call_type: "function",
                    function: OpenAiFunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_default(),
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                // Tool results become their own role:"tool" messages, placed
                // ahead of the remaining user content so they directly follow
                // the assistant turn that called them
                messages.push(OpenAiMessage {
                    role: "tool",
                    content: Some(OpenAiContent::Text(
                        content.as_ref().map(|c| c.flatten()).unwrap_or_default(),
                    )),
                    tool_calls: None,
                    tool_call_id: Some(upstream_call_id(tool_use_id)),
                });
            }
            // Not part of the OpenAI chat format
            ContentBlock::Thinking { .. } => {}
        }
    }

    if !text_parts.is_empty() || !image_parts.is_empty() || !tool_calls.is_empty() {
        let content = if !image_parts.is_empty() {
            let mut parts: Vec<OpenAiContentPart> = text_parts
                .into_iter()
                .map(|text| OpenAiContentPart::Text { text })
                .collect();
            parts.extend(image_parts);
            Some(OpenAiContent::Parts(parts))
        } else if !text_parts.is_empty() {
            // A lone text block collapses back to a bare string
            Some(OpenAiContent::Text(text_parts.join("")))
        } else {
            None
        };

        messages.push(OpenAiMessage {
            role: role_str,
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    } else if messages.is_empty() {
        messages.push(OpenAiMessage {
            role: role_str,
            content: Some(OpenAiContent::Text(String::new())),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    messages
}

/// Build the OpenAI messages array including the flattened system prompt
pub(crate) fn convert_messages_openai(req: &ClaudeRequest) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();

    if let Some(system) = req.system_text() {
        if !system.is_empty() {
            out.push(json!({"role": "system", "content": system}));
        }
    }

    for msg in &req.messages {
        for converted in convert_message(msg.role, &msg.content) {
            out.push(serde_json::to_value(converted).unwrap_or(Value::Null));
        }
    }

    out
}

/// Standard OpenAI tool schema conversion
pub(crate) fn convert_tools_openai(req: &ClaudeRequest) -> Value {
    let tools: Vec<Value> = req
        .tools
        .iter()
        .flatten()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect();
    Value::Array(tools)
}

pub(crate) fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Any => json!("required"),
        ToolChoice::Tool { name } => {
            json!({"type": "function", "function": {"name": name}})
        }
    }
}

/// Truncate tool names beyond `limit` in an assembled body, recording the
/// truncated -> original mapping. Mutates both the tool definitions and any
/// historical assistant tool_calls so the names stay consistent.
pub(crate) fn truncate_tool_names(body: &mut Value, limit: usize, names: &ToolNameMap) {
    let mut renames: Vec<(String, String)> = Vec::new();

    if let Some(tools) = body.get_mut("tools").and_then(|t| t.as_array_mut()) {
        for tool in tools {
            let Some(name) = tool
                .pointer("/function/name")
                .and_then(|n| n.as_str())
                .map(String::from)
            else {
                continue;
            };
            if name.len() > limit {
                let truncated = truncate_utf8_safe(&name, limit).to_string();
                names.insert(truncated.clone(), name.clone());
                renames.push((name, truncated.clone()));
                if let Some(slot) = tool.pointer_mut("/function/name") {
                    *slot = json!(truncated);
                }
            }
        }
    }

    if renames.is_empty() {
        return;
    }

    if let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for message in messages {
            let Some(calls) = message.get_mut("tool_calls").and_then(|c| c.as_array_mut())
            else {
                continue;
            };
            for call in calls {
                let Some(slot) = call.pointer_mut("/function/name") else {
                    continue;
                };
                if let Some(current) = slot.as_str() {
                    if let Some((_, truncated)) =
                        renames.iter().find(|(original, _)| original == current)
                    {
                        *slot = json!(truncated);
                    }
                }
            }
        }
    }
}

impl Adapter for OpenAiChatAdapter {
    fn name(&self) -> &'static str {
        "openai-chat"
    }

    fn reset(&self) {
        self.tool_names.clear();
    }

    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError> {
        Ok(Value::Array(convert_messages_openai(req)))
    }

    fn convert_tools(&self, req: &ClaudeRequest) -> Value {
        convert_tools_openai(req)
    }

    fn build_payload(&self, req: &ClaudeRequest, messages: Value, tools: Value) -> Value {
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
            let key = if uses_completion_tokens(&self.target_model) {
                "max_completion_tokens"
            } else {
                "max_tokens"
            };
            obj.insert(key.to_string(), json!(max_tokens));
        }

        if let Some(budget) = req.thinking.as_ref().and_then(|t| t.budget_tokens) {
            if is_reasoning_family(&self.target_model) {
                obj.insert(
                    "reasoning_effort".to_string(),
                    json!(reasoning_effort_for_budget(budget)),
                );
            }
        }

        if tools.as_array().map(|t| !t.is_empty()).unwrap_or(false) {
            obj.insert("tools".to_string(), tools);
            if let Some(choice) = &req.tool_choice {
                obj.insert("tool_choice".to_string(), convert_tool_choice(choice));
            }
        }

        body
    }

    fn prepare_request(&self, body: &mut Value) {
        truncate_tool_names(body, self.tool_name_limit, &self.tool_names);
    }

    fn resolve_tool_name(&self, name: &str) -> String {
        self.tool_names.resolve(name)
    }

    fn supports_vision(&self, model: &str) -> bool {
        self.vision.allows(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> ClaudeRequest {
        ClaudeRequest::normalize(&body).unwrap().0
    }

    fn adapter() -> OpenAiChatAdapter {
        OpenAiChatAdapter::new("gpt-4o", VisionRule::OpenAiFamily)
    }

    #[test]
    fn test_system_becomes_first_message() {
        let req = request(json!({
            "model": "claude-sonnet-4",
            "system": "You are helpful",
            "messages": [{"role": "user", "content": "Hello"}]
        }));
        let messages = adapter().convert_messages(&req).unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "You are helpful");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "Hello");
    }

    #[test]
    fn test_single_text_block_collapses_to_string() {
        let req = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
        }));
        let messages = adapter().convert_messages(&req).unwrap();
        assert_eq!(messages[0]["content"], "hi");
    }

    #[test]
    fn test_image_becomes_data_url() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAA="}}
                ]
            }]
        }));
        let messages = adapter().convert_messages(&req).unwrap();
        let parts = messages[0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAA=");
    }

    #[test]
    fn test_tool_use_and_result_round_trip() {
        let req = request(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "toolu_call_1", "name": "get_weather", "input": {"city": "London"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_call_1", "content": "Sunny"}
                ]}
            ]
        }));
        let messages = adapter().convert_messages(&req).unwrap();

        let assistant = &messages[1];
        assert_eq!(assistant["role"], "assistant");
        assert_eq!(assistant["content"], "checking");
        // toolu_ prefix minted by our streamer is stripped for the upstream
        assert_eq!(assistant["tool_calls"][0]["id"], "call_1");
        assert_eq!(assistant["tool_calls"][0]["function"]["name"], "get_weather");
        assert_eq!(
            assistant["tool_calls"][0]["function"]["arguments"],
            "{\"city\":\"London\"}"
        );

        let tool = &messages[2];
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "call_1");
        assert_eq!(tool["content"], "Sunny");
    }

    #[test]
    fn test_max_completion_tokens_families() {
        assert!(uses_completion_tokens("gpt-5"));
        assert!(uses_completion_tokens("o1-preview"));
        assert!(uses_completion_tokens("o3-mini"));
        assert!(uses_completion_tokens("o4-mini"));
        assert!(!uses_completion_tokens("gpt-4o"));

        let req = request(json!({"model": "m", "messages": [], "max_tokens": 500}));
        let a = OpenAiChatAdapter::new("gpt-5", VisionRule::OpenAiFamily);
        let body = a.build_payload(&req, json!([]), json!([]));
        assert_eq!(body["max_completion_tokens"], 500);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_reasoning_effort_thresholds() {
        assert_eq!(reasoning_effort_for_budget(3_999), "minimal");
        assert_eq!(reasoning_effort_for_budget(4_000), "low");
        assert_eq!(reasoning_effort_for_budget(15_999), "low");
        assert_eq!(reasoning_effort_for_budget(16_000), "medium");
        assert_eq!(reasoning_effort_for_budget(31_999), "medium");
        assert_eq!(reasoning_effort_for_budget(32_000), "high");
    }

    #[test]
    fn test_reasoning_effort_only_for_o_series() {
        let req = request(json!({
            "model": "m",
            "messages": [],
            "thinking": {"budget_tokens": 20000}
        }));

        let o3 = OpenAiChatAdapter::new("o3", VisionRule::OpenAiFamily);
        let body = o3.build_payload(&req, json!([]), json!([]));
        assert_eq!(body["reasoning_effort"], "medium");

        let gpt = OpenAiChatAdapter::new("gpt-4o", VisionRule::OpenAiFamily);
        let body = gpt.build_payload(&req, json!([]), json!([]));
        assert!(body.get("reasoning_effort").is_none());
    }

    #[test]
    fn test_stream_options_always_set() {
        let req = request(json!({"model": "m", "messages": []}));
        let body = adapter().build_payload(&req, json!([]), json!([]));
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_tool_choice_mapping() {
        assert_eq!(convert_tool_choice(&ToolChoice::Auto), json!("auto"));
        assert_eq!(convert_tool_choice(&ToolChoice::Any), json!("required"));
        assert_eq!(
            convert_tool_choice(&ToolChoice::Tool { name: "x".into() }),
            json!({"type": "function", "function": {"name": "x"}})
        );
    }

    #[test]
    fn test_tool_name_truncation_updates_map() {
        let long_name = "a".repeat(80);
        let adapter = adapter();
        let mut body = json!({
            "tools": [{"type": "function", "function": {"name": long_name, "parameters": {}}}],
            "messages": [{
                "role": "assistant",
                "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": long_name, "arguments": "{}"}}]
            }]
        });
        adapter.prepare_request(&mut body);

        let truncated = "a".repeat(OPENAI_TOOL_NAME_LIMIT);
        assert_eq!(body["tools"][0]["function"]["name"], truncated);
        assert_eq!(
            body["messages"][0]["tool_calls"][0]["function"]["name"],
            truncated
        );
        assert_eq!(adapter.resolve_tool_name(&truncated), long_name);
    }

    #[test]
    fn test_vision_rules() {
        assert!(VisionRule::OpenAiFamily.allows("gpt-4o"));
        assert!(!VisionRule::OpenAiFamily.allows("gpt-3.5-turbo"));
        assert!(!VisionRule::OpenAiFamily.allows("o3-mini"));
        assert!(VisionRule::GlmFamily.allows("glm-4.6v"));
        assert!(!VisionRule::GlmFamily.allows("glm-4.7"));
        assert!(VisionRule::GrokFamily.allows("grok-2-vision"));
        assert!(!VisionRule::GrokFamily.allows("grok-4"));
    }

    #[test]
    fn test_thinking_blocks_dropped() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "answer"}
                ]
            }]
        }));
        let messages = adapter().convert_messages(&req).unwrap();
        assert_eq!(messages[0]["content"], "answer");
    }
}
