//! Ollama JSONL → Anthropic SSE
//!
//! Ollama's native chat API streams newline-delimited JSON objects:
//!
//! ```text
//! {"message":{"content":"hel"},"done":false}
//! {"message":{"content":"lo"},"done":false}
//! {"message":{"content":""},"done":true,"prompt_eval_count":12,"eval_count":3}
//! ```
//!
//! One text block, no tool support. The `done` record carries usage and the
//! stop reason.

use bytes::Bytes;
use serde_json::Value;

use super::state::StreamState;
use super::{LineBuffer, StreamContext};

pub struct OllamaJsonlTranslator {
    lines: LineBuffer,
}

impl OllamaJsonlTranslator {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
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
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: Value = match serde_json::from_str(line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::debug!("skipping malformed ollama record: {}", e);
                    continue;
                }
            };

            if let Some(content) = parsed.pointer("/message/content").and_then(|c| c.as_str()) {
                state.text_delta(out, content);
            }

            if parsed.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                let input = parsed
                    .get("prompt_eval_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let output = parsed
                    .get("eval_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                state.input_tokens = input;
                state.output_tokens = output;
                ctx.report_usage(input, output, None);

                let stop = match parsed.get("done_reason").and_then(|r| r.as_str()) {
                    Some("length") => "max_tokens",
                    _ => "end_turn",
                };
                state.finalize(out, stop);
            }
        }
    }

    pub fn finish(&mut self, _ctx: &StreamContext, state: &mut StreamState, out: &mut Vec<Bytes>) {
        if !state.is_finalized() {
            state.finalize(out, "end_turn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::local::{LocalAdapter, LocalBodyShape};
    use crate::tracker::{TokenStrategy, TokenTracker};
    use std::sync::Arc;

    fn ctx() -> StreamContext {
        StreamContext {
            adapter: Arc::new(LocalAdapter::new(
                "llama3.2",
                LocalBodyShape::Ollama,
                false,
                false,
            )),
            tracker: Arc::new(TokenTracker::new(
                0,
                "ollama",
                "llama3.2",
                32_768,
                TokenStrategy::Local,
            )),
            model: "claude-3-sonnet".to_string(),
        }
    }

    #[test]
    fn test_single_text_block_and_usage() {
        let ctx = ctx();
        let mut translator = OllamaJsonlTranslator::new();
        let mut state = StreamState::new(&ctx.model);
        let mut out = Vec::new();
        state.start_message(&mut out);

        translator.feed(&ctx, &mut state, &mut out, b"{\"message\":{\"content\":\"hel\"},\"done\":false}\n");
        translator.feed(&ctx, &mut state, &mut out, b"{\"message\":{\"content\":\"lo\"},\"done\":false}\n");
        translator.feed(
            &ctx,
            &mut state,
            &mut out,
            b"{\"message\":{\"content\":\"\"},\"done\":true,\"prompt_eval_count\":12,\"eval_count\":3}\n",
        );

        let events = out
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect::<Vec<_>>()
            .join("");
        assert!(events.contains("\"text\":\"hel\""));
        assert!(events.contains("\"text\":\"lo\""));
        assert!(events.contains("\"stop_reason\":\"end_turn\""));
        assert!(events.contains("\"output_tokens\":3"));

        let (input, output, cost) = ctx.tracker.snapshot();
        assert_eq!(input, 12);
        assert_eq!(output, 3);
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn test_length_done_reason() {
        let ctx = ctx();
        let mut translator = OllamaJsonlTranslator::new();
        let mut state = StreamState::new(&ctx.model);
        let mut out = Vec::new();
        state.start_message(&mut out);
        translator.feed(
            &ctx,
            &mut state,
            &mut out,
            b"{\"message\":{\"content\":\"x\"},\"done\":true,\"done_reason\":\"length\",\"prompt_eval_count\":1,\"eval_count\":1}\n",
        );
        let events = out
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect::<Vec<_>>()
            .join("");
        assert!(events.contains("\"stop_reason\":\"max_tokens\""));
    }

    #[test]
    fn test_record_split_across_chunks() {
        let ctx = ctx();
        let mut translator = OllamaJsonlTranslator::new();
        let mut state = StreamState::new(&ctx.model);
        let mut out = Vec::new();
        state.start_message(&mut out);
        translator.feed(&ctx, &mut state, &mut out, b"{\"message\":{\"content\":");
        translator.feed(&ctx, &mut state, &mut out, b"\"whole\"},\"done\":false}\n");
        let events = out
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect::<Vec<_>>()
            .join("");
        assert!(events.contains("\"text\":\"whole\""));
    }
}
