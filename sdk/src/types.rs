//! Conversation and client wire types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message typed by the end user
    User,

    /// Message produced by the system (answers, progress notes, error notices)
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::System => "system",
        }
    }

    /// Parse a stored role name. Anything that is not `user` is a system turn.
    pub fn from_stored(value: &str) -> Self {
        if value.eq_ignore_ascii_case("user") {
            Role::User
        } else {
            Role::System
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    /// Create a user turn
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create a system turn
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Status tag of a client message
///
/// The set of values and their spelling is part of the client contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// A turn has been accepted and is being processed
    Started,
    /// A visible text fragment of the answer being generated
    Streaming,
    /// An intermediate, non-final output
    Processing,
    /// The final answer of the turn
    Completed,
    /// The result of a specialist handler
    Tool,
    /// The turn failed
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Started => "started",
            MessageStatus::Streaming => "streaming",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Tool => "tool",
            MessageStatus::Error => "error",
        }
    }

    /// Whether this status closes a turn from the client's point of view
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Error)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message pushed to a live client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientMessage {
    pub conversation_id: String,
    pub status: MessageStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ClientMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        status: MessageStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            status,
            message: message.into(),
            tool_name: None,
        }
    }

    /// Create a `tool` message for the named handler
    pub fn tool(
        conversation_id: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            status: MessageStatus::Tool,
            message: message.into(),
            tool_name: Some(tool_name.into()),
        }
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
