//! Display messages reconstructed from the envelope stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::pm::PmAction;

/// One entry of a session transcript.
///
/// Variants are matched exhaustively by the reducer; there is no runtime
/// field probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatMessage {
    User {
        timestamp: DateTime<Utc>,
        content: String,
    },
    Agent {
        timestamp: DateTime<Utc>,
        content: String,
        agent_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage_name: Option<String>,
        /// True while more fragments are expected for this logical message.
        is_streaming: bool,
    },
    Thinking {
        timestamp: DateTime<Utc>,
        content: String,
        agent_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage_name: Option<String>,
        is_streaming: bool,
        /// Display-only; flipped by an explicit toggle, never by envelopes.
        #[serde(default)]
        is_expanded: bool,
    },
    ToolCall {
        timestamp: DateTime<Utc>,
        tool_name: String,
        #[serde(default)]
        arguments: Map<String, Value>,
        #[serde(default)]
        agent_name: String,
    },
    ToolResult {
        timestamp: DateTime<Utc>,
        tool_name: String,
        result: String,
        success: bool,
        #[serde(default)]
        agent_name: String,
    },
    PmAgent {
        timestamp: DateTime<Utc>,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        actions: Vec<PmAction>,
    },
    Error {
        timestamp: DateTime<Utc>,
        content: String,
    },
    /// Protocol notice (e.g. "feedback submitted"), not authored by anyone.
    System {
        timestamp: DateTime<Utc>,
        content: String,
    },
}

impl ChatMessage {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ChatMessage::User { timestamp, .. }
            | ChatMessage::Agent { timestamp, .. }
            | ChatMessage::Thinking { timestamp, .. }
            | ChatMessage::ToolCall { timestamp, .. }
            | ChatMessage::ToolResult { timestamp, .. }
            | ChatMessage::PmAgent { timestamp, .. }
            | ChatMessage::Error { timestamp, .. }
            | ChatMessage::System { timestamp, .. } => *timestamp,
        }
    }

    /// Text body. Tool calls have no free text and yield their tool name.
    pub fn content(&self) -> &str {
        match self {
            ChatMessage::User { content, .. }
            | ChatMessage::Agent { content, .. }
            | ChatMessage::Thinking { content, .. }
            | ChatMessage::PmAgent { content, .. }
            | ChatMessage::Error { content, .. }
            | ChatMessage::System { content, .. } => content,
            ChatMessage::ToolCall { tool_name, .. } => tool_name,
            ChatMessage::ToolResult { result, .. } => result,
        }
    }

    /// Variant tag as serialized (`"agent"`, `"tool_call"`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            ChatMessage::User { .. } => "user",
            ChatMessage::Agent { .. } => "agent",
            ChatMessage::Thinking { .. } => "thinking",
            ChatMessage::ToolCall { .. } => "tool_call",
            ChatMessage::ToolResult { .. } => "tool_result",
            ChatMessage::PmAgent { .. } => "pm_agent",
            ChatMessage::Error { .. } => "error",
            ChatMessage::System { .. } => "system",
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            ChatMessage::Agent { is_streaming, .. } | ChatMessage::Thinking { is_streaming, .. } => {
                *is_streaming
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn serializes_with_snake_case_type_tag() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let message = ChatMessage::ToolResult {
            timestamp: at,
            tool_name: "write_file".to_string(),
            result: "ok".to_string(),
            success: true,
            agent_name: "coder".to_string(),
        };
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["success"], true);
    }

    #[test]
    fn content_falls_back_to_tool_fields() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let call = ChatMessage::ToolCall {
            timestamp: at,
            tool_name: "read_file".to_string(),
            arguments: Map::new(),
            agent_name: "coder".to_string(),
        };
        assert_eq!(call.content(), "read_file");
        assert_eq!(call.kind(), "tool_call");
        assert!(!call.is_streaming());
    }
}
