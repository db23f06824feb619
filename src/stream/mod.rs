//! Stream translation - upstream wire formats to Anthropic SSE
//!
//! One translator exists per upstream stream format; the dispatch is a dense
//! match on the closed `StreamFormat` enum, decided at handler construction.
//! Each translator is a consumer-producer: upstream bytes in, Anthropic SSE
//! events out, with `StreamState` enforcing the block-ordering invariants.
//!
//! The pump task owns the whole connection lifecycle:
//! - emits `message_start` + the initial `ping` before the first upstream read
//! - relays translated events as upstream chunks arrive
//! - emits keepalive pings when the upstream has been quiet for >= 1 s
//! - on upstream failure after message_start, ends the stream cleanly with
//!   an inline error block (the client always sees a well-formed stream end)
//! - on client disconnect the channel closes, the task returns, and the
//!   in-flight upstream read is dropped with it
//!
//! The Anthropic passthrough forwards bytes verbatim and never injects
//! pings: an injected event could land inside a chunk-split upstream event.

pub mod anthropic;
pub mod events;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod responses;
pub mod state;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::adapter::Adapter;
use crate::tracker::TokenTracker;
use crate::transport::StreamFormat;
use state::StreamState;

/// Everything a translator needs beyond the raw bytes
pub struct StreamContext {
    pub adapter: Arc<dyn Adapter>,
    pub tracker: Arc<TokenTracker>,
    /// Model name echoed in message_start (the client's original request)
    pub model: String,
}

impl StreamContext {
    pub fn report_usage(&self, input: u64, output: u64, cost: Option<f64>) {
        self.tracker.update(input, output, cost);
    }
}

/// Per-format translators, routed by dense match
enum FormatTranslator {
    OpenAi(openai::OpenAiSseTranslator),
    Responses(responses::ResponsesSseTranslator),
    Gemini(gemini::GeminiSseTranslator),
    Ollama(ollama::OllamaJsonlTranslator),
    Anthropic(anthropic::PassthroughTranslator),
}

impl FormatTranslator {
    fn new(format: StreamFormat) -> Self {
        match format {
            StreamFormat::OpenAiSse => Self::OpenAi(openai::OpenAiSseTranslator::new()),
            StreamFormat::OpenAiResponsesSse => {
                Self::Responses(responses::ResponsesSseTranslator::new())
            }
            StreamFormat::GeminiSse => Self::Gemini(gemini::GeminiSseTranslator::new()),
            StreamFormat::OllamaJsonl => Self::Ollama(ollama::OllamaJsonlTranslator::new()),
            StreamFormat::AnthropicSse => {
                Self::Anthropic(anthropic::PassthroughTranslator::new())
            }
        }
    }

    fn feed(
        &mut self,
        ctx: &StreamContext,
        state: &mut StreamState,
        out: &mut Vec<Bytes>,
        chunk: &[u8],
    ) {
        match self {
            Self::OpenAi(t) => t.feed(ctx, state, out, chunk),
            Self::Responses(t) => t.feed(ctx, state, out, chunk),
            Self::Gemini(t) => t.feed(ctx, state, out, chunk),
            Self::Ollama(t) => t.feed(ctx, state, out, chunk),
            Self::Anthropic(t) => t.feed(ctx, out, chunk),
        }
    }

    fn finish(&mut self, ctx: &StreamContext, state: &mut StreamState, out: &mut Vec<Bytes>) {
        match self {
            Self::OpenAi(t) => t.finish(ctx, state, out),
            Self::Responses(t) => t.finish(ctx, state, out),
            Self::Gemini(t) => t.finish(ctx, state, out),
            Self::Ollama(t) => t.finish(ctx, state, out),
            Self::Anthropic(t) => t.finish(ctx, out),
        }
    }
}

/// Turn an upstream response into an Anthropic SSE body. The translation
/// runs in a spawned task; dropping the returned body cancels it.
pub fn stream_response(
    format: StreamFormat,
    response: reqwest::Response,
    ctx: StreamContext,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);
    tokio::spawn(pump(format, response, ctx, tx));
    Body::from_stream(ReceiverStream::new(rx))
}

async fn send_all(
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
    out: &mut Vec<Bytes>,
) -> Result<(), ()> {
    for event in out.drain(..) {
        if tx.send(Ok(event)).await.is_err() {
            // Client went away; abandon the stream
            return Err(());
        }
    }
    Ok(())
}

async fn pump(
    format: StreamFormat,
    response: reqwest::Response,
    ctx: StreamContext,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let passthrough = format == StreamFormat::AnthropicSse;
    let mut translator = FormatTranslator::new(format);
    let mut state = StreamState::new(&ctx.model);
    let mut out: Vec<Bytes> = Vec::new();

    if !passthrough {
        state.start_message(&mut out);
        if send_all(&tx, &mut out).await.is_err() {
            return;
        }
    }

    let mut bytes_stream = response.bytes_stream();
    let mut ping = tokio::time::interval(Duration::from_secs(1));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            chunk = bytes_stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        last_activity = Instant::now();
                        translator.feed(&ctx, &mut state, &mut out, &bytes);
                        if send_all(&tx, &mut out).await.is_err() {
                            return;
                        }
                        if state.is_finalized() && !passthrough {
                            // A graceful end already went out; drain and stop
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("upstream stream error: {}", e);
                        if !passthrough {
                            state.finalize_with_error(&mut out, &e.to_string());
                            let _ = send_all(&tx, &mut out).await;
                        }
                        return;
                    }
                    None => {
                        translator.finish(&ctx, &mut state, &mut out);
                        if !passthrough && !state.is_finalized() {
                            state.finalize(&mut out, "end_turn");
                        }
                        let _ = send_all(&tx, &mut out).await;
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                if !passthrough && last_activity.elapsed() >= Duration::from_secs(1) {
                    if tx.send(Ok(events::ping_event())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Byte-level SSE/JSONL line splitter shared by the translators. Splitting
/// on b'\n' is UTF-8 safe: continuation bytes never equal 0x0A.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk and drain every complete line (without the newline)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_reassembles_split_lines() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"data: {\"par").is_empty());
        let lines = buffer.push(b"tial\":1}\ndata: next\n");
        assert_eq!(lines, vec!["data: {\"partial\":1}", "data: next"]);
    }

    #[test]
    fn test_line_buffer_strips_carriage_returns() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"event: ping\r\n");
        assert_eq!(lines, vec!["event: ping"]);
    }

    #[test]
    fn test_line_buffer_handles_split_utf8() {
        let mut buffer = LineBuffer::new();
        let text = "data: 日本語\n".as_bytes();
        // Split in the middle of a multibyte character
        assert!(buffer.push(&text[..8]).is_empty());
        let lines = buffer.push(&text[8..]);
        assert_eq!(lines, vec!["data: 日本語"]);
    }
}
