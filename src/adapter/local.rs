//! Local inference adapter
//!
//! Local servers need hand-tuned sampling: each model family ships with
//! recommended parameters that the hosting server does not apply on its own.
//! The adapter also floors `max_tokens` at 8192 (agent tool calls die when a
//! local default of 512 truncates mid-JSON) and strips the cloud-only
//! thinking controls that local servers reject.
//!
//! Two shapes are produced: Ollama's native `/api/chat` body (string
//! content, sampling under `options`) and the OpenAI-compatible body for
//! LM Studio / vLLM / MLX.

use serde_json::{json, Value};

use crate::claude::{ClaudeRequest, ContentBlock, MessageContent, Role};
use crate::error::ProxyError;

use super::openai::{convert_messages_openai, convert_tools_openai};
use super::{Adapter, ToolNameMap};

/// Requested max_tokens below this are raised to it
pub const LOCAL_MAX_TOKENS_FLOOR: u64 = 8_192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalBodyShape {
    /// Ollama `/api/chat`: string content, `options` for sampling
    Ollama,
    /// LM Studio / vLLM / MLX `/v1/chat/completions`
    OpenAiCompat,
}

/// Recommended sampling per model family
#[derive(Debug, Clone, Copy)]
struct SamplingParams {
    temperature: f64,
    top_p: f64,
    top_k: Option<u32>,
    min_p: Option<f64>,
    repeat_penalty: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFamily {
    Qwen,
    DeepSeek,
    Llama,
    Mistral,
    Generic,
}

impl ModelFamily {
    fn detect(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.contains("qwen") {
            ModelFamily::Qwen
        } else if lower.contains("deepseek") {
            ModelFamily::DeepSeek
        } else if lower.contains("llama") {
            ModelFamily::Llama
        } else if lower.contains("mistral") || lower.contains("mixtral") {
            ModelFamily::Mistral
        } else {
            ModelFamily::Generic
        }
    }

    fn sampling(&self) -> SamplingParams {
        match self {
            ModelFamily::Qwen => SamplingParams {
                temperature: 0.7,
                top_p: 0.8,
                top_k: Some(20),
                min_p: None,
                repeat_penalty: Some(1.05),
            },
            ModelFamily::DeepSeek => SamplingParams {
                temperature: 0.6,
                top_p: 0.95,
                top_k: Some(40),
                min_p: None,
                repeat_penalty: None,
            },
            ModelFamily::Llama => SamplingParams {
                temperature: 0.7,
                top_p: 0.9,
                top_k: Some(40),
                min_p: Some(0.05),
                repeat_penalty: Some(1.1),
            },
            ModelFamily::Mistral => SamplingParams {
                temperature: 0.7,
                top_p: 0.9,
                top_k: Some(50),
                min_p: None,
                repeat_penalty: None,
            },
            ModelFamily::Generic => SamplingParams {
                temperature: 0.7,
                top_p: 0.9,
                top_k: None,
                min_p: None,
                repeat_penalty: None,
            },
        }
    }
}

pub struct LocalAdapter {
    target_model: String,
    shape: LocalBodyShape,
    supports_tools: bool,
    qwen_no_think: bool,
    tool_names: ToolNameMap,
}

impl LocalAdapter {
    pub fn new(
        target_model: impl Into<String>,
        shape: LocalBodyShape,
        supports_tools: bool,
        qwen_no_think: bool,
    ) -> Self {
        Self {
            target_model: target_model.into(),
            shape,
            supports_tools,
            qwen_no_think,
            tool_names: ToolNameMap::new(),
        }
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::detect(&self.target_model)
    }

    fn system_text(&self, req: &ClaudeRequest) -> Option<String> {
        let mut system = req.system_text().filter(|s| !s.is_empty());
        if self.qwen_no_think && self.family() == ModelFamily::Qwen {
            system = Some(match system {
                Some(text) => format!("{} /no_think", text),
                None => "/no_think".to_string(),
            });
        }
        system
    }

    /// Ollama messages: tool activity inlined as text markers. Images stay
    /// as `image_url` parts at this stage so the vision proxy can inspect
    /// and replace them; `build_payload` flattens whatever remains.
    fn convert_messages_ollama(&self, req: &ClaudeRequest) -> Vec<Value> {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = self.system_text(req) {
            messages.push(json!({"role": "system", "content": system}));
        }
        for msg in &req.messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content = match &msg.content {
                MessageContent::Text(text) => json!(text),
                MessageContent::Blocks(blocks) => {
                    let parts: Vec<Value> = blocks
                        .iter()
                        .filter_map(|block| match block {
                            ContentBlock::Text { text } => {
                                Some(json!({"type": "text", "text": text}))
                            }
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
            };
            messages.push(json!({"role": role, "content": content}));
        }
        messages
    }
}

/// Collapse part arrays into plain strings for providers that only accept
/// string content. Text parts join on newlines; any image_url part still
/// present (vision proxy failed or was skipped) is dropped. An array that
/// collapses to nothing becomes the empty string; a single text part
/// unwraps to its bare text.
pub(crate) fn flatten_string_messages(messages: &mut Value) {
    let Some(messages) = messages.as_array_mut() else {
        return;
    };
    for message in messages {
        let Some(parts) = message.get("content").and_then(|c| c.as_array()) else {
            continue;
        };
        let texts: Vec<&str> = parts
            .iter()
            .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect();
        message["content"] = json!(texts.join("\n"));
    }
}

impl Adapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    fn reset(&self) {
        self.tool_names.clear();
    }

    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError> {
        match self.shape {
            LocalBodyShape::Ollama => Ok(Value::Array(self.convert_messages_ollama(req))),
            LocalBodyShape::OpenAiCompat => {
                let mut messages = convert_messages_openai(req);
                // The /no_think directive rides on the system message
                if self.qwen_no_think && self.family() == ModelFamily::Qwen {
                    if let Some(system) = messages
                        .iter_mut()
                        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("system"))
                    {
                        if let Some(slot) = system.get_mut("content") {
                            let amended = format!("{} /no_think", slot.as_str().unwrap_or(""));
                            *slot = json!(amended);
                        }
                    } else {
                        messages.insert(0, json!({"role": "system", "content": "/no_think"}));
                    }
                }
                Ok(Value::Array(messages))
            }
        }
    }

    fn convert_tools(&self, req: &ClaudeRequest) -> Value {
        if !self.supports_tools {
            return json!([]);
        }
        convert_tools_openai(req)
    }

    fn build_payload(&self, req: &ClaudeRequest, messages: Value, tools: Value) -> Value {
        let sampling = self.family().sampling();
        let temperature = req.temperature.unwrap_or(sampling.temperature);
        let max_tokens = req
            .max_tokens
            .unwrap_or(LOCAL_MAX_TOKENS_FLOOR)
            .max(LOCAL_MAX_TOKENS_FLOOR);

        match self.shape {
            LocalBodyShape::Ollama => {
                let mut messages = messages;
                flatten_string_messages(&mut messages);
                let mut options = json!({
                    "temperature": temperature,
                    "top_p": sampling.top_p,
                    "num_predict": max_tokens,
                });
                let opts = options.as_object_mut().unwrap();
                if let Some(top_k) = sampling.top_k {
                    opts.insert("top_k".to_string(), json!(top_k));
                }
                if let Some(min_p) = sampling.min_p {
                    opts.insert("min_p".to_string(), json!(min_p));
                }
                if let Some(penalty) = sampling.repeat_penalty {
                    opts.insert("repeat_penalty".to_string(), json!(penalty));
                }
                json!({
                    "model": self.target_model,
                    "messages": messages,
                    "stream": true,
                    "options": options,
                })
            }
            LocalBodyShape::OpenAiCompat => {
                let mut body = json!({
                    "model": self.target_model,
                    "messages": messages,
                    "stream": true,
                    "stream_options": {"include_usage": true},
                    "temperature": temperature,
                    "top_p": sampling.top_p,
                    "max_tokens": max_tokens,
                });
                let obj = body.as_object_mut().unwrap();
                if let Some(top_k) = sampling.top_k {
                    obj.insert("top_k".to_string(), json!(top_k));
                }
                if let Some(min_p) = sampling.min_p {
                    obj.insert("min_p".to_string(), json!(min_p));
                }
                if let Some(penalty) = sampling.repeat_penalty {
                    obj.insert("repetition_penalty".to_string(), json!(penalty));
                }
                if self.supports_tools {
                    if let Some(array) = tools.as_array() {
                        if !array.is_empty() {
                            obj.insert("tools".to_string(), tools);
                        }
                    }
                }
                body
            }
        }
    }

    /// Strip cloud-only thinking controls that local servers reject
    fn prepare_request(&self, body: &mut Value) {
        if let Some(obj) = body.as_object_mut() {
            obj.remove("thinking");
            obj.remove("reasoning_effort");
            obj.remove("thinkingConfig");
        }
    }

    fn resolve_tool_name(&self, name: &str) -> String {
        self.tool_names.resolve(name)
    }

    fn supports_vision(&self, model: &str) -> bool {
        // Only the explicit vision builds of local models can see
        let lower = model.to_ascii_lowercase();
        ["llava", "-vl", "vision", "moondream", "bakllava"]
            .iter()
            .any(|family| lower.contains(family))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> ClaudeRequest {
        ClaudeRequest::normalize(&body).unwrap().0
    }

    #[test]
    fn test_max_tokens_floor() {
        let adapter = LocalAdapter::new("llama3.2", LocalBodyShape::OpenAiCompat, true, false);
        let req = request(json!({"model": "m", "messages": [], "max_tokens": 4096}));
        let body = adapter.build_payload(&req, json!([]), json!([]));
        assert_eq!(body["max_tokens"], 8192);

        let req = request(json!({"model": "m", "messages": [], "max_tokens": 16000}));
        let body = adapter.build_payload(&req, json!([]), json!([]));
        assert_eq!(body["max_tokens"], 16000);
    }

    #[test]
    fn test_family_sampling_qwen() {
        let adapter = LocalAdapter::new("qwen2.5-coder", LocalBodyShape::OpenAiCompat, true, false);
        let req = request(json!({"model": "m", "messages": []}));
        let body = adapter.build_payload(&req, json!([]), json!([]));
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["top_p"], 0.8);
        assert_eq!(body["top_k"], 20);
        assert_eq!(body["repetition_penalty"], 1.05);
    }

    #[test]
    fn test_family_sampling_deepseek_ollama() {
        let adapter = LocalAdapter::new("deepseek-r1", LocalBodyShape::Ollama, false, false);
        let req = request(json!({"model": "m", "messages": []}));
        let body = adapter.build_payload(&req, json!([]), json!([]));
        assert_eq!(body["options"]["temperature"], 0.6);
        assert_eq!(body["options"]["top_p"], 0.95);
        assert_eq!(body["options"]["top_k"], 40);
        assert_eq!(body["options"]["num_predict"], 8192);
    }

    #[test]
    fn test_requested_temperature_wins() {
        let adapter = LocalAdapter::new("llama3.2", LocalBodyShape::Ollama, false, false);
        let req = request(json!({"model": "m", "messages": [], "temperature": 0.1}));
        let body = adapter.build_payload(&req, json!([]), json!([]));
        assert_eq!(body["options"]["temperature"], 0.1);
    }

    #[test]
    fn test_ollama_body_flattens_to_strings() {
        let adapter = LocalAdapter::new("llama3.2", LocalBodyShape::Ollama, false, false);
        let req = request(json!({
            "model": "m",
            "system": "sys",
            "messages": [{
                "role": "assistant",
                "content": [{"type": "tool_use", "id": "t", "name": "f", "input": {}}]
            }]
        }));
        // Conversion keeps parts so the vision proxy can inspect them
        let messages = adapter.convert_messages(&req).unwrap();
        assert_eq!(messages[0]["content"], "sys");
        assert!(messages[1]["content"].is_array());

        // The assembled body is plain strings
        let body = adapter.build_payload(&req, messages, json!([]));
        assert_eq!(body["messages"][0]["content"], "sys");
        assert!(body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .starts_with("[Tool Call: f"));
    }

    #[test]
    fn test_ollama_images_survive_conversion_then_drop_at_flatten() {
        let adapter = LocalAdapter::new("llama3.2", LocalBodyShape::Ollama, false, false);
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AA=="}},
                    {"type": "text", "text": "what is this"}
                ]
            }]
        }));
        let messages = adapter.convert_messages(&req).unwrap();
        // The image_url part is visible to the vision proxy...
        assert_eq!(messages[0]["content"][0]["type"], "image_url");

        // ...and a leftover (un-replaced) image is stripped at assembly
        let body = adapter.build_payload(&req, messages, json!([]));
        assert_eq!(body["messages"][0]["content"], "what is this");
    }

    #[test]
    fn test_no_tools_when_unsupported() {
        let adapter = LocalAdapter::new("llama3.2", LocalBodyShape::Ollama, false, false);
        let req = request(json!({
            "model": "m", "messages": [],
            "tools": [{"name": "t", "input_schema": {}}]
        }));
        assert_eq!(adapter.convert_tools(&req), json!([]));
    }

    #[test]
    fn test_qwen_no_think_directive() {
        let adapter = LocalAdapter::new("qwen3", LocalBodyShape::OpenAiCompat, true, true);
        let req = request(json!({"model": "m", "system": "Be brief.", "messages": []}));
        let messages = adapter.convert_messages(&req).unwrap();
        assert_eq!(messages[0]["content"], "Be brief. /no_think");

        // Non-qwen families are untouched
        let adapter = LocalAdapter::new("llama3.2", LocalBodyShape::OpenAiCompat, true, true);
        let messages = adapter.convert_messages(&req).unwrap();
        assert_eq!(messages[0]["content"], "Be brief.");
    }

    #[test]
    fn test_prepare_strips_thinking_keys() {
        let adapter = LocalAdapter::new("llama3.2", LocalBodyShape::OpenAiCompat, true, false);
        let mut body = json!({"model": "m", "thinking": {"budget_tokens": 1}, "reasoning_effort": "low"});
        adapter.prepare_request(&mut body);
        assert!(body.get("thinking").is_none());
        assert!(body.get("reasoning_effort").is_none());
    }
}
