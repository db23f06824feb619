//! Anthropic passthrough
//!
//! The upstream already speaks Anthropic SSE, so bytes are forwarded
//! untouched - no re-framing, no injected pings (an injected event could
//! land inside a chunk-split upstream event). The only work here is
//! sniffing complete lines for usage so the token tracker stays current:
//! `message_start` carries input_tokens, `message_delta` carries the
//! cumulative output count, and the pair is reported when the stream ends.

use bytes::Bytes;

use super::{LineBuffer, StreamContext};

pub struct PassthroughTranslator {
    lines: LineBuffer,
    input_tokens: u64,
    output_tokens: u64,
    reported: bool,
}

impl PassthroughTranslator {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
            input_tokens: 0,
            output_tokens: 0,
            reported: false,
        }
    }

    pub fn feed(&mut self, ctx: &StreamContext, out: &mut Vec<Bytes>, chunk: &[u8]) {
        // Forward verbatim first; the sniffer below never alters the stream
        out.push(Bytes::copy_from_slice(chunk));

        for line in self.lines.push(chunk) {
            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
            else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data.trim()) else {
                continue;
            };
            match parsed.get("type").and_then(|t| t.as_str()) {
                Some("message_start") => {
                    if let Some(input) = parsed
                        .pointer("/message/usage/input_tokens")
                        .and_then(|v| v.as_u64())
                    {
                        self.input_tokens = input;
                    }
                }
                Some("message_delta") => {
                    if let Some(output) =
                        parsed.pointer("/usage/output_tokens").and_then(|v| v.as_u64())
                    {
                        self.output_tokens = output;
                    }
                }
                Some("message_stop") => {
                    self.report(ctx);
                }
                _ => {}
            }
        }
    }

    fn report(&mut self, ctx: &StreamContext) {
        if self.reported {
            return;
        }
        self.reported = true;
        ctx.report_usage(self.input_tokens, self.output_tokens, None);
    }

    pub fn finish(&mut self, ctx: &StreamContext, _out: &mut Vec<Bytes>) {
        self.report(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::anthropic::AnthropicPassthroughAdapter;
    use crate::tracker::{TokenStrategy, TokenTracker};
    use std::sync::Arc;

    fn ctx() -> StreamContext {
        StreamContext {
            adapter: Arc::new(AnthropicPassthroughAdapter::new("claude-sonnet-4")),
            tracker: Arc::new(TokenTracker::new(
                0,
                "anthropic",
                "claude-sonnet-4",
                200_000,
                TokenStrategy::Standard,
            )),
            model: "claude-sonnet-4".to_string(),
        }
    }

    #[test]
    fn test_bytes_forwarded_verbatim() {
        let ctx = ctx();
        let mut translator = PassthroughTranslator::new();
        let mut out = Vec::new();
        let chunk = b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\"}\n\n";
        translator.feed(&ctx, &mut out, chunk);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], Bytes::copy_from_slice(chunk));
    }

    #[test]
    fn test_usage_sniffed_from_stream() {
        let ctx = ctx();
        let mut translator = PassthroughTranslator::new();
        let mut out = Vec::new();
        translator.feed(
            &ctx,
            &mut out,
            b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":50,\"output_tokens\":1}}}\n\n",
        );
        translator.feed(
            &ctx,
            &mut out,
            b"event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":9}}\n\n",
        );
        translator.feed(
            &ctx,
            &mut out,
            b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );

        let (input, output, _) = ctx.tracker.snapshot();
        assert_eq!(input, 50);
        assert_eq!(output, 9);
    }

    #[test]
    fn test_report_once_even_with_finish() {
        let ctx = ctx();
        let mut translator = PassthroughTranslator::new();
        let mut out = Vec::new();
        translator.feed(
            &ctx,
            &mut out,
            b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":4}}\n\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        translator.finish(&ctx, &mut out);
        let (_, output, _) = ctx.tracker.snapshot();
        // Standard strategy accumulates output; double-reporting would give 8
        assert_eq!(output, 4);
    }
}
