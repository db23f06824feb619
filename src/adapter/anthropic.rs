//! Anthropic passthrough adapter
//!
//! The target already speaks the Messages API (native Anthropic, or the
//! MiniMax/Kimi/Z.AI compat endpoints), so translation is identity: the
//! canonical request is re-serialized with the remapped model name and
//! streaming forced on.

use serde_json::{json, Value};

use crate::claude::ClaudeRequest;
use crate::error::ProxyError;

use super::Adapter;

pub struct AnthropicPassthroughAdapter {
    target_model: String,
}

impl AnthropicPassthroughAdapter {
    pub fn new(target_model: impl Into<String>) -> Self {
        Self {
            target_model: target_model.into(),
        }
    }
}

impl Adapter for AnthropicPassthroughAdapter {
    fn name(&self) -> &'static str {
        "anthropic-passthrough"
    }

    fn reset(&self) {}

    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError> {
        serde_json::to_value(&req.messages)
            .map_err(|e| ProxyError::Internal(format!("message serialization failed: {}", e)))
    }

    fn convert_tools(&self, req: &ClaudeRequest) -> Value {
        serde_json::to_value(&req.tools).unwrap_or(Value::Null)
    }

    fn build_payload(&self, req: &ClaudeRequest, messages: Value, tools: Value) -> Value {
        let mut body = json!({
            "model": self.target_model,
            "messages": messages,
            "stream": true,
        });
        let obj = body.as_object_mut().unwrap();

        if let Some(system) = &req.system {
            obj.insert("system".to_string(), serde_json::to_value(system).unwrap_or(Value::Null));
        }
        if let Some(max_tokens) = req.max_tokens {
            obj.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = req.temperature {
            obj.insert("temperature".to_string(), json!(temperature));
        }
        if !tools.is_null() {
            if let Some(array) = tools.as_array() {
                if !array.is_empty() {
                    obj.insert("tools".to_string(), tools);
                    if let Some(choice) = &req.tool_choice {
                        obj.insert(
                            "tool_choice".to_string(),
                            serde_json::to_value(choice).unwrap_or(Value::Null),
                        );
                    }
                }
            }
        }
        if let Some(thinking) = &req.thinking {
            obj.insert(
                "thinking".to_string(),
                serde_json::to_value(thinking).unwrap_or(Value::Null),
            );
        }
        if let Some(metadata) = &req.metadata {
            obj.insert("metadata".to_string(), metadata.clone());
        }

        body
    }

    fn supports_vision(&self, _model: &str) -> bool {
        true
    }
}
