//! Message and conversation identity types.
//!
//! A conversation is an append-only log of [`Message`]s. Each message carries
//! a store-assigned `sequence` and one of four typed bodies:
//! user input → model tool calls → tool results → model answer.

use crate::tool::{ToolCallRequest, ToolOutcome, ToolResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role column of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The end user
    User,
    /// A final answer from the model
    Assistant,
    /// A tool invocation requested by the model
    ToolCall,
    /// The recorded outcome of a tool invocation
    ToolResult,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The typed payload of a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum MessageBody {
    User {
        text: String,
    },
    Assistant {
        text: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        outcome: ToolOutcome,
    },
}

impl MessageBody {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant { text: text.into() }
    }

    pub fn tool_call(request: &ToolCallRequest) -> Self {
        Self::ToolCall {
            call_id: request.call_id.clone(),
            tool_name: request.tool_name.clone(),
            arguments: request.arguments.clone(),
        }
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self::ToolResult {
            call_id: result.call_id,
            tool_name: result.tool_name,
            outcome: result.outcome,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::ToolCall { .. } => Role::ToolCall,
            Self::ToolResult { .. } => Role::ToolResult,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { call_id, .. } | Self::ToolResult { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::ToolCall { tool_name, .. } | Self::ToolResult { tool_name, .. } => {
                Some(tool_name)
            }
            _ => None,
        }
    }

    /// Flatten into the persisted row shape `(role, content, tool_name, call_id)`.
    ///
    /// User and assistant content is stored as plain text; tool call arguments
    /// and tool outcomes are stored as JSON.
    pub fn encode(&self) -> Result<EncodedBody, serde_json::Error> {
        let content = match self {
            Self::User { text } | Self::Assistant { text } => text.clone(),
            Self::ToolCall { arguments, .. } => serde_json::to_string(arguments)?,
            Self::ToolResult { outcome, .. } => serde_json::to_string(outcome)?,
        };
        Ok(EncodedBody {
            role: self.role(),
            content,
            tool_name: self.tool_name().map(String::from),
            call_id: self.call_id().map(String::from),
        })
    }

    /// Rebuild a body from its persisted row shape.
    pub fn decode(encoded: EncodedBody) -> Result<Self, String> {
        let EncodedBody {
            role,
            content,
            tool_name,
            call_id,
        } = encoded;
        match role {
            Role::User => Ok(Self::User { text: content }),
            Role::Assistant => Ok(Self::Assistant { text: content }),
            Role::ToolCall => Ok(Self::ToolCall {
                call_id: call_id.ok_or("tool_call row without call_id")?,
                tool_name: tool_name.ok_or("tool_call row without tool_name")?,
                arguments: serde_json::from_str(&content)
                    .map_err(|e| format!("tool_call arguments: {e}"))?,
            }),
            Role::ToolResult => Ok(Self::ToolResult {
                call_id: call_id.ok_or("tool_result row without call_id")?,
                tool_name: tool_name.ok_or("tool_result row without tool_name")?,
                outcome: serde_json::from_str(&content)
                    .map_err(|e| format!("tool_result outcome: {e}"))?,
            }),
        }
    }
}

/// A message body flattened into persistence columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub role: Role,
    pub content: String,
    pub tool_name: Option<String>,
    pub call_id: Option<String>,
}

/// A single sequenced entry in a conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic position within the conversation, assigned by the store
    pub sequence: u64,

    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn new(sequence: u64, body: MessageBody) -> Self {
        Self { sequence, body }
    }

    pub fn role(&self) -> Role {
        self.body.role()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.body.call_id()
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.body.tool_name()
    }

    /// The text of a user or assistant message.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::User { text } | MessageBody::Assistant { text } => Some(text),
            _ => None,
        }
    }
}
