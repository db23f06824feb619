//! Per-connection streamer state
//!
//! `StreamState` owns the block bookkeeping for one client connection and is
//! the single place the ordering invariants are enforced:
//!
//! - block indices are strictly increasing and never reused
//! - a thinking block is stopped before the first text delta goes out
//! - text is stopped before any tool_use block opens
//! - every `content_block_start` is matched by a `content_block_stop`
//!
//! Translators call the ensure/open/close methods and never touch indices
//! directly, so a translator bug cannot produce an out-of-order stream.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::json;

use super::events::*;

/// Placeholder usage sent in message_start; real numbers arrive in
/// message_delta once the upstream reports them
const PLACEHOLDER_INPUT: u64 = 100;
const PLACEHOLDER_OUTPUT: u64 = 1;

#[derive(Debug)]
pub struct ToolBlock {
    pub index: u32,
    pub closed: bool,
}

#[derive(Debug)]
pub struct StreamState {
    msg_id: String,
    model: String,
    next_index: u32,
    text_index: Option<u32>,
    thinking_index: Option<u32>,
    /// Open tool blocks keyed by the upstream's call identifier
    tools: HashMap<String, ToolBlock>,
    pub accumulated_text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub stop_reason: Option<String>,
    message_started: bool,
    finalized: bool,
}

impl StreamState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            msg_id: crate::util::generate_message_id(),
            model: model.into(),
            next_index: 0,
            text_index: None,
            thinking_index: None,
            tools: HashMap::new(),
            accumulated_text: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
            message_started: false,
            finalized: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn saw_tool_use(&self) -> bool {
        !self.tools.is_empty()
    }

    fn take_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// message_start followed by the initial ping
    pub fn start_message(&mut self, out: &mut Vec<Bytes>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        let event = MessageStartEvent {
            event_type: "message_start",
            message: MessageStartPayload {
                id: self.msg_id.clone(),
                msg_type: "message",
                role: "assistant",
                content: vec![],
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: UsagePayload {
                    input_tokens: PLACEHOLDER_INPUT,
                    output_tokens: PLACEHOLDER_OUTPUT,
                },
            },
        };
        out.push(format_sse_event("message_start", &event));
        out.push(ping_event());
    }

    // ------------------------------------------------------------------
    // Thinking blocks
    // ------------------------------------------------------------------

    pub fn thinking_delta(&mut self, out: &mut Vec<Bytes>, thinking: &str) {
        if thinking.is_empty() {
            return;
        }
        if self.thinking_index.is_none() {
            let index = self.take_index();
            self.thinking_index = Some(index);
            out.push(format_sse_event(
                "content_block_start",
                &ContentBlockStartEvent {
                    event_type: "content_block_start",
                    index,
                    content_block: ContentBlockPayload::Thinking {
                        thinking: String::new(),
                    },
                },
            ));
        }
        let index = self.thinking_index.unwrap();
        out.push(format_sse_event(
            "content_block_delta",
            &ContentBlockDeltaEvent {
                event_type: "content_block_delta",
                index,
                delta: ContentDelta::ThinkingDelta {
                    thinking: thinking.to_string(),
                },
            },
        ));
    }

    pub fn close_thinking(&mut self, out: &mut Vec<Bytes>) {
        if let Some(index) = self.thinking_index.take() {
            out.push(format_sse_event(
                "content_block_stop",
                &ContentBlockStopEvent {
                    event_type: "content_block_stop",
                    index,
                },
            ));
        }
    }

    // ------------------------------------------------------------------
    // Text blocks
    // ------------------------------------------------------------------

    pub fn text_delta(&mut self, out: &mut Vec<Bytes>, text: &str) {
        if text.is_empty() {
            return;
        }
        // Thinking stops before the first text delta
        self.close_thinking(out);
        if self.text_index.is_none() {
            let index = self.take_index();
            self.text_index = Some(index);
            out.push(format_sse_event(
                "content_block_start",
                &ContentBlockStartEvent {
                    event_type: "content_block_start",
                    index,
                    content_block: ContentBlockPayload::Text {
                        text: String::new(),
                    },
                },
            ));
        }
        let index = self.text_index.unwrap();
        self.accumulated_text.push_str(text);
        out.push(format_sse_event(
            "content_block_delta",
            &ContentBlockDeltaEvent {
                event_type: "content_block_delta",
                index,
                delta: ContentDelta::TextDelta {
                    text: text.to_string(),
                },
            },
        ));
    }

    pub fn close_text(&mut self, out: &mut Vec<Bytes>) {
        if let Some(index) = self.text_index.take() {
            out.push(format_sse_event(
                "content_block_stop",
                &ContentBlockStopEvent {
                    event_type: "content_block_stop",
                    index,
                },
            ));
        }
    }

    // ------------------------------------------------------------------
    // Tool use blocks
    // ------------------------------------------------------------------

    /// Open a tool_use block. Thinking and text stop first; indices keep
    /// strictly increasing even when text resumes after a call.
    pub fn open_tool(&mut self, out: &mut Vec<Bytes>, key: &str, id: &str, name: &str) {
        self.close_thinking(out);
        self.close_text(out);
        if self.tools.contains_key(key) {
            return;
        }
        let index = self.take_index();
        self.tools.insert(
            key.to_string(),
            ToolBlock {
                index,
                closed: false,
            },
        );
        out.push(format_sse_event(
            "content_block_start",
            &ContentBlockStartEvent {
                event_type: "content_block_start",
                index,
                content_block: ContentBlockPayload::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: json!({}),
                },
            },
        ));
    }

    pub fn tool_args_delta(&mut self, out: &mut Vec<Bytes>, key: &str, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        let Some(block) = self.tools.get(key) else {
            return;
        };
        if block.closed {
            return;
        }
        out.push(format_sse_event(
            "content_block_delta",
            &ContentBlockDeltaEvent {
                event_type: "content_block_delta",
                index: block.index,
                delta: ContentDelta::InputJsonDelta {
                    partial_json: fragment.to_string(),
                },
            },
        ));
    }

    pub fn close_tool(&mut self, out: &mut Vec<Bytes>, key: &str) {
        let Some(block) = self.tools.get_mut(key) else {
            return;
        };
        if block.closed {
            return;
        }
        block.closed = true;
        out.push(format_sse_event(
            "content_block_stop",
            &ContentBlockStopEvent {
                event_type: "content_block_stop",
                index: block.index,
            },
        ));
    }

    /// Stop every block that is still open
    pub fn close_all_blocks(&mut self, out: &mut Vec<Bytes>) {
        self.close_thinking(out);
        self.close_text(out);
        let open_keys: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, b)| !b.closed)
            .map(|(k, _)| k.clone())
            .collect();
        for key in open_keys {
            self.close_tool(out, &key);
        }
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    /// Close open blocks and emit message_delta + message_stop exactly once
    pub fn finalize(&mut self, out: &mut Vec<Bytes>, stop_reason: &str) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.close_all_blocks(out);
        self.stop_reason = Some(stop_reason.to_string());
        out.push(format_sse_event(
            "message_delta",
            &MessageDeltaEvent {
                event_type: "message_delta",
                delta: MessageDelta {
                    stop_reason: stop_reason.to_string(),
                    stop_sequence: None,
                },
                usage: DeltaUsage {
                    output_tokens: self.output_tokens,
                },
            },
        ));
        out.push(format_sse_event(
            "message_stop",
            &MessageStopEvent {
                event_type: "message_stop",
            },
        ));
    }

    /// A failure after message_start: surface it inline, then end cleanly
    pub fn finalize_with_error(&mut self, out: &mut Vec<Bytes>, message: &str) {
        if self.finalized {
            return;
        }
        self.close_all_blocks(out);
        self.text_delta(out, &format!("[Stream error: {}]", message));
        self.close_text(out);
        self.finalize(out, "end_turn");
    }
}

/// Shared stop_reason mapping for OpenAI-style finish reasons
pub fn stop_reason_from_finish(finish_reason: &str) -> &'static str {
    match finish_reason {
        "tool_calls" | "function_call" => "tool_use",
        "length" => "max_tokens",
        _ => "end_turn",
    }
}

/// Mint a client-facing Claude tool id from an upstream call id
pub fn claude_tool_id(upstream_id: &str) -> String {
    if upstream_id.starts_with("toolu_") {
        upstream_id.to_string()
    } else if let Some(rest) = upstream_id.strip_prefix("fc_") {
        format!("toolu_{}", rest)
    } else {
        format!("toolu_{}", upstream_id)
    }
}
