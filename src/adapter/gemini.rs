//! Anthropic → Gemini adapter
//!
//! Gemini's `contents/parts` format differs from every other provider in two
//! ways that shape this module:
//!
//! - **Thought signatures.** Gemini 2.5/3 attach an opaque `thoughtSignature`
//!   to streamed function calls and require it echoed back on the next
//!   request that references the same call. The signature map lives for the
//!   whole handler and is NOT cleared between requests - turn N+1 needs what
//!   turn N recorded. When no signature is known a sentinel value is sent;
//!   set CLAUDISH_NO_SIGNATURE_SENTINEL=1 to omit the field instead, since
//!   not every Gemini deployment accepts the sentinel.
//!
//! - **Leaked reasoning.** Gemini models narrate planning monologue into the
//!   visible text stream. `process_text_content` suppresses it line by line,
//!   with a latch that swallows continuation lines until real prose resumes.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use serde_json::{json, Value};

use crate::claude::{ClaudeRequest, ContentBlock, MessageContent, Role};
use crate::error::ProxyError;

use super::{Adapter, ProcessedText, ToolNameMap};

/// Sent in place of a recorded signature; accepted by current deployments
pub const SIGNATURE_SENTINEL: &str = "skip_thought_signature_validator";

/// Appended to every system instruction
const REASONING_SUPPRESSION: &str =
    "Respond with your answer directly. Do not narrate your reasoning, planning steps, \
     or internal deliberation in the reply.";

/// Budget threshold separating gemini-3's two thinking levels
const GEMINI3_LEVEL_THRESHOLD: u64 = 16_000;

/// Hard cap on gemini-2.5 thinking budgets
const GEMINI25_BUDGET_CAP: u64 = 24_576;

#[derive(Debug, Clone)]
struct SignatureEntry {
    name: String,
    signature: Option<String>,
}

#[derive(Debug, Default)]
struct FilterState {
    buffer: String,
    in_reasoning_block: bool,
    at_line_start: bool,
}

pub struct GeminiAdapter {
    target_model: String,
    tool_names: ToolNameMap,
    /// tool_use_id -> (function name, thought signature). Handler lifetime.
    signatures: Mutex<HashMap<String, SignatureEntry>>,
    use_sentinel: bool,
    filter: Mutex<FilterState>,
    reasoning_start: Regex,
    continuation: Regex,
}

impl GeminiAdapter {
    pub fn new(target_model: impl Into<String>, use_sentinel: bool) -> Self {
        Self {
            target_model: target_model.into(),
            tool_names: ToolNameMap::new(),
            signatures: Mutex::new(HashMap::new()),
            use_sentinel,
            filter: Mutex::new(FilterState {
                at_line_start: true,
                ..Default::default()
            }),
            reasoning_start: Regex::new(
                r"(?i)^\s*(wait[,.]|let me think|let me (see|check|figure)|hmm+[,.]?|okay[,:]? (so|let)|thinking[,:]|i need to (figure|think|work out)|i should (probably|first)|my plan[,:]?|first[,:] i('ll| will| need)|because |\d+\.\s)",
            )
            .expect("reasoning regex"),
            continuation: Regex::new(r"^\s*([a-z]|and |but |so |then |- |\* |\d+\.\s)")
                .expect("continuation regex"),
        }
    }

    fn lookup_function_name(&self, tool_use_id: &str) -> Option<String> {
        self.signatures
            .lock()
            .unwrap()
            .get(tool_use_id)
            .map(|entry| entry.name.clone())
    }

    fn lookup_signature(&self, tool_use_id: &str) -> Option<String> {
        self.signatures
            .lock()
            .unwrap()
            .get(tool_use_id)
            .and_then(|entry| entry.signature.clone())
    }

    fn convert_blocks(&self, blocks: &[ContentBlock]) -> Vec<Value> {
        let mut parts: Vec<Value> = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => parts.push(json!({"text": text})),
                ContentBlock::Image { source } => parts.push(json!({
                    "inlineData": {"mimeType": source.media_type, "data": source.data}
                })),
                ContentBlock::ToolUse { id, name, input } => {
                    let mut part = json!({"functionCall": {"name": name, "args": input}});
                    match self.lookup_signature(id) {
                        Some(signature) => {
                            part["thoughtSignature"] = json!(signature);
                        }
                        None if self.use_sentinel => {
                            part["thoughtSignature"] = json!(SIGNATURE_SENTINEL);
                        }
                        None => {}
                    }
                    parts.push(part);
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    let name = self.lookup_function_name(tool_use_id).unwrap_or_else(|| {
                        tracing::warn!(
                            "no recorded function name for tool_use_id {}, echoing the id",
                            tool_use_id
                        );
                        tool_use_id.clone()
                    });
                    let flattened = content.as_ref().map(|c| c.flatten()).unwrap_or_default();
                    parts.push(json!({
                        "functionResponse": {"name": name, "response": {"content": flattened}}
                    }));
                }
                // Gemini regenerates its own thoughts; echoed blocks are dropped
                ContentBlock::Thinking { .. } => {}
            }
        }
        parts
    }
}

/// Strip JSON Schema keywords Gemini's declaration parser rejects
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                if key == "$schema" || key == "additionalProperties" {
                    continue;
                }
                out.insert(key.clone(), sanitize_schema(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn is_gemini3(model: &str) -> bool {
    model.to_ascii_lowercase().starts_with("gemini-3")
}

impl Adapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn reset(&self) {
        self.tool_names.clear();
        // Signatures deliberately survive; the next request echoes them
        *self.filter.lock().unwrap() = FilterState {
            at_line_start: true,
            ..Default::default()
        };
    }

    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError> {
        let contents: Vec<Value> = req
            .messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                let parts = match &msg.content {
                    MessageContent::Text(text) => vec![json!({"text": text})],
                    MessageContent::Blocks(blocks) => self.convert_blocks(blocks),
                };
                json!({"role": role, "parts": parts})
            })
            .collect();
        Ok(Value::Array(contents))
    }

    fn convert_tools(&self, req: &ClaudeRequest) -> Value {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .flatten()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": sanitize_schema(&tool.input_schema),
                })
            })
            .collect();
        if declarations.is_empty() {
            json!([])
        } else {
            json!([{"functionDeclarations": declarations}])
        }
    }

    fn build_payload(&self, req: &ClaudeRequest, messages: Value, tools: Value) -> Value {
        let mut body = json!({"contents": messages});
        let obj = body.as_object_mut().unwrap();

        let system = match req.system_text() {
            Some(text) if !text.is_empty() => format!("{}\n\n{}", text, REASONING_SUPPRESSION),
            _ => REASONING_SUPPRESSION.to_string(),
        };
        obj.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );

        let mut generation = serde_json::Map::new();
        if let Some(temperature) = req.temperature {
            generation.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = req.max_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(budget) = req.thinking.as_ref().and_then(|t| t.budget_tokens) {
            if is_gemini3(&self.target_model) {
                let level = if budget >= GEMINI3_LEVEL_THRESHOLD {
                    "high"
                } else {
                    "low"
                };
                generation.insert("thinkingLevel".to_string(), json!(level));
            } else {
                generation.insert(
                    "thinkingConfig".to_string(),
                    json!({"thinkingBudget": budget.min(GEMINI25_BUDGET_CAP)}),
                );
            }
        }
        obj.insert("generationConfig".to_string(), Value::Object(generation));

        if tools.as_array().map(|t| !t.is_empty()).unwrap_or(false) {
            obj.insert("tools".to_string(), tools);
        }

        body
    }

    /// Line-based suppression of leaked reasoning monologue.
    ///
    /// Complete lines are classified; a partial trailing line is held in the
    /// buffer only while it could still turn into a reasoning opener.
    fn process_text_content(&self, chunk: &str, _accumulated: &str) -> ProcessedText {
        let mut state = self.filter.lock().unwrap();
        state.buffer.push_str(chunk);

        let mut cleaned = String::new();
        let mut transformed = false;

        while let Some(pos) = state.buffer.find('\n') {
            let line: String = state.buffer[..pos].to_string();
            state.buffer.drain(..=pos);
            let starts_line = state.at_line_start;
            state.at_line_start = true;

            if state.in_reasoning_block {
                let trimmed = line.trim();
                if trimmed.len() >= 20 && !self.continuation.is_match(trimmed) {
                    state.in_reasoning_block = false;
                    cleaned.push_str(&line);
                    cleaned.push('\n');
                } else {
                    transformed = true;
                }
            } else if starts_line && self.reasoning_start.is_match(&line) {
                state.in_reasoning_block = true;
                transformed = true;
            } else {
                cleaned.push_str(&line);
                cleaned.push('\n');
            }
        }

        // Flush the partial line unless it might still be a reasoning opener
        // (short, at line start) or we are mid-suppression
        if !state.in_reasoning_block && !state.buffer.is_empty() {
            let could_open = state.at_line_start && state.buffer.len() < 24;
            if !could_open {
                cleaned.push_str(&state.buffer);
                state.at_line_start = false;
                state.buffer.clear();
            }
        } else if state.in_reasoning_block && !state.buffer.is_empty() {
            transformed = true;
        }

        ProcessedText {
            cleaned,
            was_transformed: transformed,
            tool_calls: Vec::new(),
        }
    }

    fn register_tool_call(&self, id: &str, name: &str, signature: Option<&str>) {
        self.signatures.lock().unwrap().insert(
            id.to_string(),
            SignatureEntry {
                name: name.to_string(),
                signature: signature.map(String::from),
            },
        );
    }

    fn resolve_tool_name(&self, name: &str) -> String {
        self.tool_names.resolve(name)
    }

    fn supports_vision(&self, _model: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> ClaudeRequest {
        ClaudeRequest::normalize(&body).unwrap().0
    }

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new("gemini-2.5-pro", true)
    }

    #[test]
    fn test_roles_and_text_parts() {
        let req = request(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        }));
        let contents = adapter().convert_messages(&req).unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "hi");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn test_image_becomes_inline_data() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AA=="}}]
            }]
        }));
        let contents = adapter().convert_messages(&req).unwrap();
        let part = &contents[0]["parts"][0];
        assert_eq!(part["inlineData"]["mimeType"], "image/png");
        assert_eq!(part["inlineData"]["data"], "AA==");
    }

    #[test]
    fn test_signature_echo_round_trip() {
        let adapter = adapter();
        // Turn 1: the stream translator records the signature
        adapter.register_tool_call("toolu_k1", "search", Some("ABC"));
        // reset() between requests must not lose it
        adapter.reset();

        let req = request(json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_k1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_k1", "content": "result text"}
                ]}
            ]
        }));
        let contents = adapter.convert_messages(&req).unwrap();

        let call = &contents[0]["parts"][0];
        assert_eq!(call["functionCall"]["name"], "search");
        assert_eq!(call["thoughtSignature"], "ABC");

        let response = &contents[1]["parts"][0];
        assert_eq!(response["functionResponse"]["name"], "search");
        assert_eq!(response["functionResponse"]["response"]["content"], "result text");
    }

    #[test]
    fn test_sentinel_when_signature_unknown() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [{"type": "tool_use", "id": "toolu_x", "name": "f", "input": {}}]
            }]
        }));
        let contents = adapter().convert_messages(&req).unwrap();
        assert_eq!(
            contents[0]["parts"][0]["thoughtSignature"],
            SIGNATURE_SENTINEL
        );

        // Opt-out omits the field entirely
        let no_sentinel = GeminiAdapter::new("gemini-2.5-pro", false);
        let contents = no_sentinel.convert_messages(&req).unwrap();
        assert!(contents[0]["parts"][0].get("thoughtSignature").is_none());
    }

    #[test]
    fn test_system_instruction_has_suppression() {
        let req = request(json!({"model": "m", "messages": [], "system": "Be terse."}));
        let body = adapter().build_payload(&req, json!([]), json!([]));
        let text = body["systemInstruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("Be terse."));
        assert!(text.contains("Do not narrate"));
    }

    #[test]
    fn test_thinking_budget_mapping() {
        let req = |budget: u64| {
            request(json!({"model": "m", "messages": [], "thinking": {"budget_tokens": budget}}))
        };

        // gemini-3 uses levels at the 16k threshold
        let g3 = GeminiAdapter::new("gemini-3-pro", true);
        let body = g3.build_payload(&req(10_000), json!([]), json!([]));
        assert_eq!(body["generationConfig"]["thinkingLevel"], "low");
        let body = g3.build_payload(&req(20_000), json!([]), json!([]));
        assert_eq!(body["generationConfig"]["thinkingLevel"], "high");

        // gemini-2.5 takes a capped budget
        let g25 = adapter();
        let body = g25.build_payload(&req(30_000), json!([]), json!([]));
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            24_576
        );
        let body = g25.build_payload(&req(1_000), json!([]), json!([]));
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            1_000
        );
    }

    #[test]
    fn test_tools_become_function_declarations() {
        let req = request(json!({
            "model": "m",
            "messages": [],
            "tools": [{
                "name": "search",
                "description": "find things",
                "input_schema": {"$schema": "x", "type": "object", "properties": {"q": {"type": "string"}}, "additionalProperties": false}
            }]
        }));
        let tools = adapter().convert_tools(&req);
        let decl = &tools[0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "search");
        assert!(decl["parameters"].get("$schema").is_none());
        assert!(decl["parameters"].get("additionalProperties").is_none());
        assert_eq!(decl["parameters"]["properties"]["q"]["type"], "string");
    }

    #[test]
    fn test_reasoning_filter_swallows_monologue() {
        let adapter = adapter();
        let out = adapter.process_text_content(
            "Wait, I'm not sure about this.\nso let me check again\nThe answer is forty-two, as computed above.\n",
            "",
        );
        assert!(out.was_transformed);
        assert_eq!(out.cleaned, "The answer is forty-two, as computed above.\n");
    }

    #[test]
    fn test_reasoning_filter_passes_prose() {
        let adapter = adapter();
        let out = adapter.process_text_content(
            "Here is a plain answer that should pass through.\n",
            "",
        );
        assert!(!out.was_transformed);
        assert_eq!(
            out.cleaned,
            "Here is a plain answer that should pass through.\n"
        );
    }

    #[test]
    fn test_reasoning_filter_numbered_plan() {
        let adapter = adapter();
        let out = adapter.process_text_content(
            "1. first figure out the shape\n2. then compute\nFinal result: the shape is a square.\n",
            "",
        );
        assert!(out.was_transformed);
        assert_eq!(out.cleaned, "Final result: the shape is a square.\n");
    }

    #[test]
    fn test_filter_handles_split_chunks() {
        let adapter = adapter();
        // A long partial line with no newline flushes straight through
        let first = adapter.process_text_content("This is the start of a long answer ", "");
        assert_eq!(first.cleaned, "This is the start of a long answer ");
        let second = adapter.process_text_content("and here is the rest.\n", "");
        assert_eq!(second.cleaned, "and here is the rest.\n");
    }
}
