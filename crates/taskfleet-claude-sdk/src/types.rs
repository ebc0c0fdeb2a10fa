//! Type definitions for Claude Code stream-json messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level message from Claude Code CLI stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeMessage {
    /// System initialization message.
    System {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },

    /// Assistant response message.
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// User message (echo, usually tool results).
    User {
        message: UserMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Streaming event.
    StreamEvent {
        event: StreamEvent,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Terminal result of a turn.
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default, alias = "isError")]
        is_error: Option<bool>,
        #[serde(default, alias = "durationMs")]
        duration_ms: Option<u64>,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default, alias = "sessionId")]
        session_id: Option<String>,
    },

    /// Unknown message type (fallback).
    #[serde(untagged)]
    Unknown(Value),
}

impl ClaudeMessage {
    /// Extract session ID from any message type.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. } => session_id.as_deref(),
            Self::Assistant { session_id, .. } => session_id.as_deref(),
            Self::User { session_id, .. } => session_id.as_deref(),
            Self::StreamEvent { session_id, .. } => session_id.as_deref(),
            Self::Result { session_id, .. } => session_id.as_deref(),
            Self::Unknown(_) => None,
        }
    }

    /// Short name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System { .. } => "System",
            Self::Assistant { .. } => "Assistant",
            Self::User { .. } => "User",
            Self::StreamEvent { .. } => "StreamEvent",
            Self::Result { .. } => "Result",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// The human-readable payload of this message, without envelope fields.
    ///
    /// Text blocks are returned as-is, tool invocations as `[tool] <name>`.
    /// Messages with nothing to show return an empty vector.
    pub fn content_text(&self) -> Vec<String> {
        match self {
            Self::Assistant { message, .. } => message
                .content
                .iter()
                .filter_map(|item| match item {
                    ContentItem::Text { text } if !text.trim().is_empty() => Some(text.clone()),
                    ContentItem::ToolUse { name, .. } => Some(format!("[tool] {}", name)),
                    _ => None,
                })
                .collect(),
            Self::StreamEvent {
                event:
                    StreamEvent::ContentBlockDelta {
                        delta: ContentDelta::TextDelta { text },
                        ..
                    },
                ..
            } if !text.is_empty() => vec![text.clone()],
            _ => Vec::new(),
        }
    }
}

/// Assistant message content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// User message content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentItem>,
}

/// Content item in a message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    /// Text content.
    Text { text: String },

    /// Thinking/reasoning content.
    Thinking { thinking: String },

    /// Tool use request.
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },

    /// Tool result.
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },

    /// Any other block type (images, redacted thinking, ...).
    #[serde(other)]
    Other,
}

/// Streaming event types.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Content block delta (streaming text).
    ContentBlockDelta { index: usize, delta: ContentDelta },

    /// Message delta.
    MessageDelta {
        #[serde(default)]
        delta: Option<MessageDelta>,
    },

    /// Message stop.
    MessageStop,

    /// Unknown event.
    #[serde(other)]
    Unknown,
}

/// Content delta for streaming.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    /// Text delta.
    TextDelta { text: String },

    /// Thinking delta.
    ThinkingDelta { thinking: String },

    /// Unknown delta.
    #[serde(other)]
    Unknown,
}

/// Message delta for streaming.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// A user turn written to Claude's stdin in stream-json input mode.
#[derive(Debug, Clone, Serialize)]
pub struct SdkUserMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub message: OutgoingUserMessage,
    /// Conversation to continue; omitted on the first turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Body of an outgoing user turn.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingUserMessage {
    pub role: String,
    pub content: String,
}

impl SdkUserMessage {
    pub fn new(prompt: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            message_type: "user".to_string(),
            message: OutgoingUserMessage {
                role: "user".to_string(),
                content: prompt.into(),
            },
            session_id,
        }
    }
}
