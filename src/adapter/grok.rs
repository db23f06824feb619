//! Grok adapter
//!
//! Grok is OpenAI-chat compatible, but under some routings it emits tool
//! calls as inline XML in the text stream instead of structured
//! `tool_calls` deltas:
//!
//! ```text
//! <xai:function_call name="search">
//!   <xai:parameter name="q">rust streams</xai:parameter>
//! </xai:function_call>
//! ```
//!
//! `process_text_content` suppresses that XML from the visible text and
//! hands the parsed calls back to the stream translator as structured
//! `ExtractedToolCall`s. Everything else delegates to the chat adapter.

use std::sync::Mutex;

use regex::Regex;
use serde_json::Value;

use crate::claude::ClaudeRequest;
use crate::error::ProxyError;

use super::openai::{OpenAiChatAdapter, VisionRule};
use super::{Adapter, ExtractedToolCall, ProcessedText};

const CALL_OPEN: &str = "<xai:function_call";

#[derive(Debug, Default)]
struct NormalizerState {
    buffer: String,
}

pub struct GrokAdapter {
    chat: OpenAiChatAdapter,
    state: Mutex<NormalizerState>,
    call_re: Regex,
    param_re: Regex,
}

impl GrokAdapter {
    pub fn new(target_model: impl Into<String>) -> Self {
        Self {
            chat: OpenAiChatAdapter::new(target_model, VisionRule::GrokFamily),
            state: Mutex::new(NormalizerState::default()),
            call_re: Regex::new(
                r#"(?s)<xai:function_call\s+name="([^"]+)"\s*>(.*?)</xai:function_call>"#,
            )
            .expect("call regex"),
            param_re: Regex::new(r#"(?s)<xai:parameter\s+name="([^"]+)"\s*>(.*?)</xai:parameter>"#)
                .expect("param regex"),
        }
    }

    fn parse_call(&self, name: &str, body: &str) -> ExtractedToolCall {
        let mut args = serde_json::Map::new();
        for capture in self.param_re.captures_iter(body) {
            let key = capture[1].to_string();
            let raw = capture[2].trim();
            // Values that parse as JSON keep their type; everything else is a string
            let value = serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.to_string()));
            args.insert(key, value);
        }
        ExtractedToolCall {
            name: name.to_string(),
            arguments: serde_json::to_string(&Value::Object(args)).unwrap_or_default(),
        }
    }

    /// Index where a trailing partial `<xai:function_call` opener begins,
    /// if the buffer ends mid-tag
    fn partial_open_at(buffer: &str) -> Option<usize> {
        let mut start = buffer.len().saturating_sub(CALL_OPEN.len().max(32));
        while start > 0 && !buffer.is_char_boundary(start) {
            start -= 1;
        }
        buffer[start..]
            .rfind('<')
            .map(|offset| start + offset)
            .filter(|&pos| {
                let tail = &buffer[pos..];
                CALL_OPEN.starts_with(tail) || tail.starts_with(CALL_OPEN)
            })
    }
}

impl Adapter for GrokAdapter {
    fn name(&self) -> &'static str {
        "grok"
    }

    fn reset(&self) {
        self.chat.reset();
        self.state.lock().unwrap().buffer.clear();
    }

    fn convert_messages(&self, req: &ClaudeRequest) -> Result<Value, ProxyError> {
        self.chat.convert_messages(req)
    }

    fn convert_tools(&self, req: &ClaudeRequest) -> Value {
        self.chat.convert_tools(req)
    }

    fn build_payload(&self, req: &ClaudeRequest, messages: Value, tools: Value) -> Value {
        self.chat.build_payload(req, messages, tools)
    }

    fn prepare_request(&self, body: &mut Value) {
        self.chat.prepare_request(body);
    }

    fn process_text_content(&self, chunk: &str, _accumulated: &str) -> ProcessedText {
        let mut state = self.state.lock().unwrap();
        state.buffer.push_str(chunk);

        let mut cleaned = String::new();
        let mut tool_calls: Vec<ExtractedToolCall> = Vec::new();
        let mut transformed = false;

        // Extract every complete call currently in the buffer
        loop {
            let Some(capture) = self.call_re.captures(&state.buffer) else {
                break;
            };
            let full = capture.get(0).unwrap();
            cleaned.push_str(&state.buffer[..full.start()]);
            tool_calls.push(self.parse_call(&capture[1], &capture[2]));
            transformed = true;
            let end = full.end();
            state.buffer.drain(..end);
        }

        // Hold anything that might be the start of the next call
        if let Some(open) = state.buffer.find(CALL_OPEN) {
            cleaned.push_str(&state.buffer[..open]);
            state.buffer.drain(..open);
            transformed = true;
        } else if let Some(partial) = Self::partial_open_at(&state.buffer) {
            cleaned.push_str(&state.buffer[..partial]);
            state.buffer.drain(..partial);
        } else {
            cleaned.push_str(&state.buffer);
            state.buffer.clear();
        }

        ProcessedText {
            cleaned,
            was_transformed: transformed,
            tool_calls,
        }
    }

    fn resolve_tool_name(&self, name: &str) -> String {
        self.chat.resolve_tool_name(name)
    }

    fn supports_vision(&self, model: &str) -> bool {
        self.chat.supports_vision(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> GrokAdapter {
        GrokAdapter::new("grok-4")
    }

    #[test]
    fn test_xml_call_extracted() {
        let adapter = adapter();
        let out = adapter.process_text_content(
            "Let me search.<xai:function_call name=\"search\"><xai:parameter name=\"q\">rust</xai:parameter></xai:function_call>",
            "",
        );
        assert!(out.was_transformed);
        assert_eq!(out.cleaned, "Let me search.");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "search");
        assert_eq!(out.tool_calls[0].arguments, "{\"q\":\"rust\"}");
    }

    #[test]
    fn test_call_split_across_chunks() {
        let adapter = adapter();
        let first = adapter.process_text_content("text before <xai:function_c", "");
        assert_eq!(first.cleaned, "text before ");
        assert!(first.tool_calls.is_empty());

        let second = adapter.process_text_content(
            "all name=\"f\"><xai:parameter name=\"a\">1</xai:parameter></xai:function_call> after",
            "",
        );
        assert_eq!(second.tool_calls.len(), 1);
        assert_eq!(second.tool_calls[0].name, "f");
        assert_eq!(second.tool_calls[0].arguments, "{\"a\":1}");
        assert_eq!(second.cleaned, " after");
    }

    #[test]
    fn test_plain_text_passes_through() {
        let adapter = adapter();
        let out = adapter.process_text_content("just a normal answer", "");
        assert!(!out.was_transformed);
        assert_eq!(out.cleaned, "just a normal answer");
        assert!(out.tool_calls.is_empty());
    }

    #[test]
    fn test_typed_parameter_values() {
        let adapter = adapter();
        let out = adapter.process_text_content(
            "<xai:function_call name=\"calc\"><xai:parameter name=\"n\">42</xai:parameter><xai:parameter name=\"label\">sum of parts</xai:parameter></xai:function_call>",
            "",
        );
        let args: Value = serde_json::from_str(&out.tool_calls[0].arguments).unwrap();
        assert_eq!(args["n"], 42);
        assert_eq!(args["label"], "sum of parts");
    }
}
