//! Gemini SSE → Anthropic SSE
//!
//! Consumes `data: {"candidates":[{"content":{"parts":[...]}}]}` lines,
//! optionally unwrapping the Code-Assist `{"response": ...}` envelope.
//!
//! Part handling:
//! - `thought: true` parts (or bare `thoughtText`) feed a thinking block
//! - plain `text` closes any open thinking block, runs through the
//!   adapter's reasoning filter, then feeds the text block
//! - `functionCall` closes thinking and text, opens a tool_use block, emits
//!   the full args as one `input_json_delta`, and closes the block; the
//!   accompanying `thoughtSignature` is recorded with the adapter so the
//!   next request can echo it
//! - `finishReason` STOP / MAX_TOKENS finalizes; usage comes from
//!   `usageMetadata` (cumulative per chunk, reported once at the end)

use bytes::Bytes;
use serde_json::Value;

use super::state::StreamState;
use super::{LineBuffer, StreamContext};

pub struct GeminiSseTranslator {
    lines: LineBuffer,
    tool_count: u32,
    last_input_tokens: u64,
    last_output_tokens: u64,
    usage_reported: bool,
}

impl GeminiSseTranslator {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
            tool_count: 0,
            last_input_tokens: 0,
            last_output_tokens: 0,
            usage_reported: false,
        }
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
            if data.is_empty() {
                continue;
            }
            let parsed: Value = match serde_json::from_str(data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::debug!("skipping malformed gemini chunk: {}", e);
                    continue;
                }
            };
            // Code-Assist wraps the generate response one level down
            let payload = parsed.get("response").unwrap_or(&parsed).clone();
            self.handle_chunk(ctx, state, out, &payload);
        }
    }

    fn handle_chunk(
        &mut self,
        ctx: &StreamContext,
        state: &mut StreamState,
        out: &mut Vec<Bytes>,
        chunk: &Value,
    ) {
        if let Some(usage) = chunk.get("usageMetadata") {
            let input = usage
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(self.last_input_tokens);
            let candidates = usage
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let thoughts = usage
                .get("thoughtsTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.last_input_tokens = input;
            self.last_output_tokens = candidates + thoughts;
        }

        let Some(candidate) = chunk
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return;
        };

        if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
            for part in parts {
                self.handle_part(ctx, state, out, part);
            }
        }

        if let Some(finish) = candidate.get("finishReason").and_then(|f| f.as_str()) {
            let stop = match finish {
                "MAX_TOKENS" => "max_tokens",
                _ if state.saw_tool_use() => "tool_use",
                _ => "end_turn",
            };
            self.report_usage_once(ctx, state);
            state.finalize(out, stop);
        }
    }

    fn handle_part(
        &mut self,
        ctx: &StreamContext,
        state: &mut StreamState,
        out: &mut Vec<Bytes>,
        part: &Value,
    ) {
        // Thinking: either a thought-flagged text part or a bare thoughtText
        if part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false) {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                state.thinking_delta(out, text);
            }
            return;
        }
        if let Some(thought) = part.get("thoughtText").and_then(|t| t.as_str()) {
            state.thinking_delta(out, thought);
            return;
        }

        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let args = call.get("args").cloned().unwrap_or_else(|| serde_json::json!({}));
            let signature = part.get("thoughtSignature").and_then(|s| s.as_str());

            self.tool_count += 1;
            let id = format!(
                "{}_{}",
                crate::util::generate_message_id().replace("msg_", "toolu_"),
                self.tool_count
            );
            ctx.adapter.register_tool_call(&id, name, signature);

            state.open_tool(out, &id, &id, name);
            state.tool_args_delta(
                out,
                &id,
                &serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string()),
            );
            state.close_tool(out, &id);
            return;
        }

        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            state.close_thinking(out);
            let processed = ctx.adapter.process_text_content(text, &state.accumulated_text);
            state.text_delta(out, &processed.cleaned);
        }
    }

    fn report_usage_once(&mut self, ctx: &StreamContext, state: &mut StreamState) {
        if self.usage_reported {
            return;
        }
        self.usage_reported = true;
        state.input_tokens = self.last_input_tokens;
        state.output_tokens = self.last_output_tokens;
        ctx.report_usage(self.last_input_tokens, self.last_output_tokens, None);
    }

    pub fn finish(&mut self, ctx: &StreamContext, state: &mut StreamState, out: &mut Vec<Bytes>) {
        if !state.is_finalized() {
            self.report_usage_once(ctx, state);
            let stop = if state.saw_tool_use() {
                "tool_use"
            } else {
                "end_turn"
            };
            state.finalize(out, stop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::gemini::GeminiAdapter;
    use crate::adapter::Adapter;
    use crate::tracker::{TokenStrategy, TokenTracker};
    use std::sync::Arc;

    fn ctx_with(adapter: Arc<GeminiAdapter>) -> StreamContext {
        StreamContext {
            adapter,
            tracker: Arc::new(TokenTracker::new(
                0,
                "gemini",
                "gemini-2.5-pro",
                1_000_000,
                TokenStrategy::AccumulateBoth,
            )),
            model: "claude-3-sonnet".to_string(),
        }
    }

    fn run_with(adapter: Arc<GeminiAdapter>, chunks: &[&str]) -> String {
        let ctx = ctx_with(adapter);
        let mut translator = GeminiSseTranslator::new();
        let mut state = StreamState::new(&ctx.model);
        let mut out = Vec::new();
        state.start_message(&mut out);
        for chunk in chunks {
            translator.feed(&ctx, &mut state, &mut out, chunk.as_bytes());
        }
        translator.finish(&ctx, &mut state, &mut out);
        out.iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect::<Vec<_>>()
            .join("")
    }

    #[test]
    fn test_thinking_then_text() {
        let adapter = Arc::new(GeminiAdapter::new("gemini-2.5-pro", true));
        let events = run_with(
            adapter,
            &[
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"mulling\",\"thought\":true}]}}]}\n\n",
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"The capital of France is Paris.\\n\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":5}}\n\n",
            ],
        );
        assert!(events.contains("\"thinking\":\"mulling\""));
        assert!(events.contains("The capital of France is Paris."));
        // Thinking stop precedes the text start
        let stop = events.find("content_block_stop").unwrap();
        let text = events.find("\"type\":\"text\"").unwrap();
        assert!(stop < text);
        assert!(events.contains("\"stop_reason\":\"end_turn\""));
    }

    #[test]
    fn test_function_call_records_signature() {
        let adapter = Arc::new(GeminiAdapter::new("gemini-2.5-pro", true));
        let events = run_with(
            adapter.clone(),
            &[
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"search\",\"args\":{\"q\":\"x\"}},\"thoughtSignature\":\"ABC\"}]},\"finishReason\":\"STOP\"}]}\n\n",
            ],
        );
        assert!(events.contains("\"name\":\"search\""));
        assert!(events.contains("\"partial_json\":\"{\\\"q\\\":\\\"x\\\"}\""));
        assert!(events.contains("\"stop_reason\":\"tool_use\""));

        // The signature is now available for the next request's conversion.
        // Extract the minted tool id from the emitted block start.
        let marker = "\"id\":\"";
        let start = events.find(marker).map(|i| i + marker.len()).unwrap();
        let id: String = events[start..].chars().take_while(|c| *c != '"').collect();
        assert!(id.starts_with("toolu_"));

        let raw = serde_json::json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [{"type": "tool_use", "id": id, "name": "search", "input": {"q": "x"}}]
            }]
        });
        let (req, _) = crate::claude::ClaudeRequest::normalize(&raw).unwrap();
        let contents = adapter.convert_messages(&req).unwrap();
        assert_eq!(contents[0]["parts"][0]["thoughtSignature"], "ABC");
    }

    #[test]
    fn test_code_assist_envelope_unwrapped() {
        let adapter = Arc::new(GeminiAdapter::new("gemini-2.5-pro", true));
        let events = run_with(
            adapter,
            &[
                "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello from the code assist path.\\n\"}]},\"finishReason\":\"STOP\"}]}}\n\n",
            ],
        );
        assert!(events.contains("Hello from the code assist path."));
    }

    #[test]
    fn test_max_tokens_finish() {
        let adapter = Arc::new(GeminiAdapter::new("gemini-2.5-pro", true));
        let events = run_with(
            adapter,
            &[
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"truncated answer that is plenty long\\n\"}]},\"finishReason\":\"MAX_TOKENS\"}]}\n\n",
            ],
        );
        assert!(events.contains("\"stop_reason\":\"max_tokens\""));
    }

    #[test]
    fn test_usage_reaches_tracker_once() {
        let adapter = Arc::new(GeminiAdapter::new("gemini-2.5-pro", true));
        let ctx = ctx_with(adapter);
        let mut translator = GeminiSseTranslator::new();
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        // Cumulative usage on every chunk; only the final numbers count
        translator.feed(&ctx, &mut state, &mut out, b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"The first part of the answer arrives here.\\n\"}]}}],\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":2}}\n\n");
        translator.feed(&ctx, &mut state, &mut out, b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"And the rest of the answer follows after.\\n\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":10,\"candidatesTokenCount\":7}}\n\n");
        translator.finish(&ctx, &mut state, &mut out);

        let (input, output, _) = ctx.tracker.snapshot();
        assert_eq!(input, 10);
        assert_eq!(output, 7);
    }

    #[test]
    fn test_reasoning_filter_applies_to_text_parts() {
        let adapter = Arc::new(GeminiAdapter::new("gemini-2.5-pro", true));
        let events = run_with(
            adapter,
            &[
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Wait, I'm going to think about this.\\nThe answer is definitely forty-two.\\n\"}]},\"finishReason\":\"STOP\"}]}\n\n",
            ],
        );
        assert!(!events.contains("Wait, I'm going to think"));
        assert!(events.contains("The answer is definitely forty-two."));
    }
}
