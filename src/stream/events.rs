//! Anthropic SSE event types and framing
//!
//! Every translator emits exactly this event family to the client:
//!
//! ```text
//! event: message_start
//! data: {"type":"message_start","message":{...}}
//! ```
//!
//! The structs serialize to the wire shapes of the Messages API streaming
//! protocol; `format_sse_event` does the `event:`/`data:` framing.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct MessageStartEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub message: MessageStartPayload,
}

#[derive(Debug, Serialize)]
pub struct MessageStartPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub role: &'static str,
    pub content: Vec<Value>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: UsagePayload,
}

#[derive(Debug, Serialize)]
pub struct UsagePayload {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct ContentBlockStartEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub index: u32,
    pub content_block: ContentBlockPayload,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ContentBlockPayload {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Serialize)]
pub struct ContentBlockDeltaEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub index: u32,
    pub delta: ContentDelta,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Serialize)]
pub struct ContentBlockStopEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub index: u32,
}

#[derive(Debug, Serialize)]
pub struct MessageDeltaEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub delta: MessageDelta,
    pub usage: DeltaUsage,
}

#[derive(Debug, Serialize)]
pub struct MessageDelta {
    pub stop_reason: String,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeltaUsage {
    pub output_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct MessageStopEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
}

/// Frame a payload as one SSE event
pub fn format_sse_event<T: Serialize>(event_type: &str, data: &T) -> Bytes {
    let json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {}\ndata: {}\n\n", event_type, json))
}

/// Keepalive ping event
pub fn ping_event() -> Bytes {
    Bytes::from_static(b"event: ping\ndata: {\"type\": \"ping\"}\n\n")
}
