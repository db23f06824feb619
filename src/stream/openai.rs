//! OpenAI chat SSE → Anthropic SSE
//!
//! Consumes `data: {"choices":[{"delta":{...}}]}` lines. Mapping:
//!
//! | OpenAI delta                    | Anthropic event                      |
//! |---------------------------------|--------------------------------------|
//! | `delta.reasoning_content`       | thinking block deltas                |
//! | `delta.content`                 | text block deltas (post-processed)   |
//! | `delta.tool_calls[].id+name`    | `content_block_start` (tool_use)     |
//! | `delta.tool_calls[].arguments`  | `input_json_delta` (relayed verbatim)|
//! | `finish_reason`                 | recorded stop_reason                 |
//! | final `usage` chunk             | token accounting                     |
//! | `data: [DONE]`                  | message_delta + message_stop         |
//!
//! Tool-call deltas are keyed by `delta.tool_calls[].index`; the name often
//! arrives once and the JSON arguments stream as fragments that we relay
//! verbatim - no validation, the client reassembles them.

use bytes::Bytes;
use serde_json::Value;

use super::state::{claude_tool_id, stop_reason_from_finish, StreamState};
use super::{LineBuffer, StreamContext};

pub struct OpenAiSseTranslator {
    lines: LineBuffer,
    /// Synthetic ids for tool calls recovered from inline XML
    xml_tool_count: u32,
}

impl OpenAiSseTranslator {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
            xml_tool_count: 0,
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

            if data == "[DONE]" {
                let stop = state
                    .stop_reason
                    .clone()
                    .unwrap_or_else(|| "end_turn".to_string());
                state.finalize(out, &stop);
                continue;
            }

            let parsed: Value = match serde_json::from_str(data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::debug!("skipping malformed chunk: {}", e);
                    continue;
                }
            };

            self.handle_chunk(ctx, state, out, &parsed);
        }
    }

    fn handle_chunk(
        &mut self,
        ctx: &StreamContext,
        state: &mut StreamState,
        out: &mut Vec<Bytes>,
        chunk: &Value,
    ) {
        // The final usage chunk (stream_options.include_usage) usually has
        // an empty choices array
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            let input = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            let output = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            // OpenRouter includes a dollar figure when accounting is on
            let cost = usage.get("cost").and_then(|v| v.as_f64());
            state.input_tokens = input;
            state.output_tokens = output;
            ctx.report_usage(input, output, cost);
        }

        let Some(choices) = chunk.get("choices").and_then(|c| c.as_array()) else {
            return;
        };
        for choice in choices {
            let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

            if let Some(reasoning) = delta.get("reasoning_content").and_then(|r| r.as_str()) {
                state.thinking_delta(out, reasoning);
            }

            if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                if !content.is_empty() {
                    let processed =
                        ctx.adapter.process_text_content(content, &state.accumulated_text);
                    state.text_delta(out, &processed.cleaned);
                    for call in processed.tool_calls {
                        self.xml_tool_count += 1;
                        let key = format!("xml{}", self.xml_tool_count);
                        let id = format!("toolu_xml_{}", self.xml_tool_count);
                        state.open_tool(out, &key, &id, &call.name);
                        state.tool_args_delta(out, &key, &call.arguments);
                        state.close_tool(out, &key);
                    }
                }
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for tc in tool_calls {
                    let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                    let key = format!("tc{}", index);

                    let id = tc.get("id").and_then(|i| i.as_str());
                    let name = tc.pointer("/function/name").and_then(|n| n.as_str());
                    if id.is_some() || name.is_some() {
                        let upstream_id = id.map(String::from).unwrap_or_else(|| key.clone());
                        let resolved = ctx
                            .adapter
                            .resolve_tool_name(name.unwrap_or(""));
                        state.open_tool(out, &key, &claude_tool_id(&upstream_id), &resolved);
                    }

                    if let Some(args) = tc.pointer("/function/arguments").and_then(|a| a.as_str())
                    {
                        state.tool_args_delta(out, &key, args);
                    }
                }
            }

            if let Some(finish) = choice.get("finish_reason").and_then(|f| f.as_str()) {
                state.stop_reason = Some(stop_reason_from_finish(finish).to_string());
            }
        }
    }

    /// Upstream closed without [DONE]: end the stream cleanly anyway
    pub fn finish(&mut self, _ctx: &StreamContext, state: &mut StreamState, out: &mut Vec<Bytes>) {
        if !state.is_finalized() {
            let stop = state
                .stop_reason
                .clone()
                .unwrap_or_else(|| "end_turn".to_string());
            state.finalize(out, &stop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::openai::{OpenAiChatAdapter, VisionRule};
    use crate::tracker::{TokenStrategy, TokenTracker};
    use std::sync::Arc;

    fn ctx() -> StreamContext {
        StreamContext {
            adapter: Arc::new(OpenAiChatAdapter::new("gpt-4o", VisionRule::OpenAiFamily)),
            tracker: Arc::new(TokenTracker::new(
                0,
                "openai",
                "gpt-4o",
                128_000,
                TokenStrategy::Standard,
            )),
            model: "claude-3-sonnet".to_string(),
        }
    }

    fn run(chunks: &[&str]) -> String {
        let ctx = ctx();
        let mut translator = OpenAiSseTranslator::new();
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
    fn test_text_only_stream() {
        let events = run(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"hello\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        assert!(events.contains("event: message_start"));
        assert!(events.contains("event: ping"));
        assert!(events.contains("\"type\":\"text_delta\",\"text\":\"hello\""));
        assert!(events.contains("\"stop_reason\":\"end_turn\""));
        assert!(events.contains("event: message_stop"));
    }

    #[test]
    fn test_tool_call_reassembly() {
        // The literal scenario: name arrives once, JSON streams as fragments
        let events = run(&[
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"search\"}}]},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"q\\\":\"}}]},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"x\\\"}\"}}]},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        assert!(events.contains("\"id\":\"toolu_call_1\""));
        assert!(events.contains("\"name\":\"search\""));
        assert!(events.contains("\"partial_json\":\"{\\\"q\\\":\""));
        assert!(events.contains("\"partial_json\":\"\\\"x\\\"}\""));
        assert!(events.contains("\"stop_reason\":\"tool_use\""));
    }

    #[test]
    fn test_reasoning_content_becomes_thinking() {
        let events = run(&[
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"pondering\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"answer\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        assert!(events.contains("\"type\":\"thinking_delta\",\"thinking\":\"pondering\""));
        // The thinking block closes before the text block opens
        let thinking_stop = events.find("content_block_stop").unwrap();
        let text_start = events.find("\"type\":\"text\"").unwrap();
        assert!(thinking_stop < text_start);
    }

    #[test]
    fn test_usage_chunk_reaches_tracker() {
        let ctx = ctx();
        let mut translator = OpenAiSseTranslator::new();
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        translator.feed(
            &ctx,
            &mut state,
            &mut out,
            b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":42,\"completion_tokens\":7}}\n\n",
        );
        let (input, output, _) = ctx.tracker.snapshot();
        assert_eq!(input, 42);
        assert_eq!(output, 7);
        assert_eq!(state.output_tokens, 7);
    }

    #[test]
    fn test_length_maps_to_max_tokens() {
        let events = run(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"},\"finish_reason\":\"length\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        assert!(events.contains("\"stop_reason\":\"max_tokens\""));
    }

    #[test]
    fn test_malformed_chunk_skipped() {
        let events = run(&[
            "data: {not json}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        assert!(events.contains("\"text\":\"ok\""));
        assert!(events.contains("message_stop"));
    }

    #[test]
    fn test_stream_without_done_still_ends_cleanly() {
        let events = run(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"},\"finish_reason\":null}]}\n\n",
        ]);
        assert!(events.contains("message_delta"));
        assert!(events.contains("message_stop"));
    }
}
