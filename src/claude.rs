//! Canonical Anthropic Messages API request model
//!
//! Every adapter consumes this normalized form. The incoming JSON body is
//! parsed once into `ClaudeRequest`; parameters the proxy does not forward
//! are collected so the handler can report them in an `X-Dropped-Params`
//! response header.
//!
//! Invariants maintained by construction:
//! - every `tool_result.tool_use_id` was seen earlier as a `tool_use.id`
//!   (the client's responsibility; the proxy preserves order end-to-end)
//! - block order within a message is preserved through every adapter
//! - image blocks only appear in user messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level request fields the proxy understands and forwards.
const KNOWN_PARAMS: &[&str] = &[
    "model",
    "messages",
    "system",
    "tools",
    "tool_choice",
    "max_tokens",
    "temperature",
    "thinking",
    "stream",
    "metadata",
];

/// Normalized Anthropic Messages request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// System prompt: a bare string or an array of text blocks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

impl SystemPrompt {
    /// Flatten to a single string, joining block texts with double newlines
    pub fn flatten(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Message content: a bare string or an array of typed blocks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// View the content as a block slice, wrapping bare strings on the fly
    pub fn as_blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    /// Thinking blocks echoed back by clients on multi-turn conversations.
    /// Adapters that cannot express them drop them silently.
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

/// Tool result content: a bare string or nested blocks (text/image)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl ToolResultContent {
    /// Flatten a tool result to plain text. Nested image blocks are elided
    /// with a marker since no upstream tool-result format carries images.
    pub fn flatten(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b.get("type").and_then(|t| t.as_str()) {
                    Some("text") => b.get("text").and_then(|t| t.as_str()).map(String::from),
                    Some("image") => Some("[image omitted]".to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    None,
    Any,
    Tool { name: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Thinking {
    #[serde(default)]
    pub budget_tokens: Option<u64>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub thinking_type: Option<String>,
}

impl ClaudeRequest {
    /// Parse a raw request body, returning the normalized request plus the
    /// list of top-level parameters that were present but are not forwarded.
    pub fn normalize(raw: &Value) -> anyhow::Result<(Self, Vec<String>)> {
        let request: ClaudeRequest = serde_json::from_value(raw.clone())?;

        let dropped = raw
            .as_object()
            .map(|obj| {
                obj.keys()
                    .filter(|k| !KNOWN_PARAMS.contains(&k.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok((request, dropped))
    }

    /// Flattened system prompt, if any
    pub fn system_text(&self) -> Option<String> {
        self.system.as_ref().map(|s| s.flatten())
    }

    /// Whether any message carries an image block
    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|m| {
            matches!(&m.content, MessageContent::Blocks(blocks)
                if blocks.iter().any(|b| matches!(b, ContentBlock::Image { .. })))
        })
    }
}
