//! OpenAI Responses SSE → Anthropic SSE (Codex models)
//!
//! The Responses API streams typed events rather than chat deltas:
//!
//! | Responses event                          | Anthropic event              |
//! |------------------------------------------|------------------------------|
//! | `response.output_text.delta`             | text_delta                   |
//! | `response.reasoning_summary_text.delta`  | text_delta (visible text)    |
//! | `response.output_item.added` (fn call)   | content_block_start tool_use |
//! | `response.function_call_arguments.delta` | input_json_delta             |
//! | `response.output_item.done` (fn call)    | content_block_stop           |
//! | `response.completed/done/incomplete`     | usage + finalize             |
//! | `error` / `response.failed`              | inline error + clean stop    |
//!
//! Argument deltas are keyed by `call_id` or `item_id`; both are mapped to
//! the same block at item-added time.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;

use super::state::{claude_tool_id, StreamState};
use super::{LineBuffer, StreamContext};

pub struct ResponsesSseTranslator {
    lines: LineBuffer,
    /// call_id and item_id both alias the canonical block key
    key_aliases: HashMap<String, String>,
}

impl ResponsesSseTranslator {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
            key_aliases: HashMap::new(),
        }
    }

    fn block_key(&self, data: &Value) -> Option<String> {
        for field in ["call_id", "item_id"] {
            if let Some(id) = data.get(field).and_then(|v| v.as_str()) {
                if let Some(key) = self.key_aliases.get(id) {
                    return Some(key.clone());
                }
            }
        }
        None
    }

    pub fn feed(
        &mut self,
        ctx: &StreamContext,
        state: &mut StreamState,
        out: &mut Vec<Bytes>,
        chunk: &[u8],
    ) {
        for line in self.lines.push(chunk) {
            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
            else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let parsed: Value = match serde_json::from_str(data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::debug!("skipping malformed responses chunk: {}", e);
                    continue;
                }
            };
            self.handle_event(ctx, state, out, &parsed);
        }
    }

    fn handle_event(
        &mut self,
        ctx: &StreamContext,
        state: &mut StreamState,
        out: &mut Vec<Bytes>,
        data: &Value,
    ) {
        let event_type = data.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "response.output_text.delta" | "response.reasoning_summary_text.delta" => {
                // Reasoning summaries are visible text in this API
                if let Some(delta) = data.get("delta").and_then(|d| d.as_str()) {
                    let processed =
                        ctx.adapter.process_text_content(delta, &state.accumulated_text);
                    state.text_delta(out, &processed.cleaned);
                }
            }
            "response.output_item.added" => {
                let Some(item) = data.get("item") else {
                    return;
                };
                if item.get("type").and_then(|t| t.as_str()) != Some("function_call") {
                    return;
                }
                let call_id = item
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let item_id = item.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                let raw_name = item.get("name").and_then(|v| v.as_str()).unwrap_or("");
                let name = ctx.adapter.resolve_tool_name(raw_name);

                let key = if call_id.is_empty() {
                    item_id.to_string()
                } else {
                    call_id.clone()
                };
                if !call_id.is_empty() {
                    self.key_aliases.insert(call_id.clone(), key.clone());
                }
                if !item_id.is_empty() {
                    self.key_aliases.insert(item_id.to_string(), key.clone());
                }

                state.open_tool(out, &key, &claude_tool_id(&key), &name);
            }
            "response.function_call_arguments.delta" => {
                let Some(key) = self.block_key(data) else {
                    return;
                };
                if let Some(delta) = data.get("delta").and_then(|d| d.as_str()) {
                    state.tool_args_delta(out, &key, delta);
                }
            }
            "response.output_item.done" => {
                let Some(item) = data.get("item") else {
                    return;
                };
                if item.get("type").and_then(|t| t.as_str()) != Some("function_call") {
                    return;
                }
                for field in ["call_id", "id"] {
                    if let Some(id) = item.get(field).and_then(|v| v.as_str()) {
                        if let Some(key) = self.key_aliases.get(id).cloned() {
                            state.close_tool(out, &key);
                            return;
                        }
                    }
                }
            }
            "response.completed" | "response.done" | "response.incomplete" => {
                if let Some(usage) = data.pointer("/response/usage") {
                    let input = usage
                        .get("input_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    let output = usage
                        .get("output_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    state.input_tokens = input;
                    state.output_tokens = output;
                    ctx.report_usage(input, output, None);
                }
                let stop = if event_type == "response.incomplete" {
                    "max_tokens"
                } else if state.saw_tool_use() {
                    "tool_use"
                } else {
                    "end_turn"
                };
                state.finalize(out, stop);
            }
            "error" | "response.failed" => {
                let message = data
                    .pointer("/error/message")
                    .or_else(|| data.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream reported a failure");
                state.finalize_with_error(out, message);
            }
            _ => {}
        }
    }

    pub fn finish(&mut self, _ctx: &StreamContext, state: &mut StreamState, out: &mut Vec<Bytes>) {
        if !state.is_finalized() {
            let stop = if state.saw_tool_use() {
                "tool_use"
            } else {
                "end_turn"
            };
            state.finalize(out, stop);
        }
    }
}
