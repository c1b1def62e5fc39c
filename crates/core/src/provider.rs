//! Provider trait — the abstraction over model services.
//!
//! A Provider knows how to send the conversation log plus tool schemas to a
//! model service and turn the reply into either a final answer or an ordered
//! list of tool calls. Transport details stay inside the implementation.
//!
//! Implementations: Anthropic Messages API, OpenAI-compatible endpoints.

use crate::error::ModelError;
use crate::message::Message;
use crate::tool::ToolCallRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A request to the model service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The model to use (e.g., "claude-sonnet-4-20250514", "gpt-4o")
    pub model: String,

    /// Instructions sent ahead of the log; never persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// The full ordered conversation log
    pub messages: Vec<Message>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.3
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// What the model decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelReply {
    /// The turn is over; surface this text to the user.
    FinalAnswer { text: String },

    /// Invoke these tools, in this order, then ask again.
    ToolCalls {
        calls: Vec<ToolCallRequest>,

        /// Text the model emitted beside the calls. Shown to the user, never logged.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        narration: Option<String>,
    },
}

impl ModelReply {
    /// A tool-call reply; blank narration is dropped.
    pub fn tool_calls(calls: Vec<ToolCallRequest>, narration: impl Into<String>) -> Self {
        let narration = narration.into();
        Self::ToolCalls {
            calls,
            narration: (!narration.trim().is_empty()).then_some(narration),
        }
    }
}

/// A complete response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub reply: ModelReply,

    /// Token usage statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The core Provider trait.
///
/// The gateway calls `complete()` without knowing which service is behind
/// it. Only network failures and malformed responses are expected errors.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic", "openrouter").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Health check — can we reach the provider?
    async fn health_check(&self) -> Result<bool, ModelError> {
        Ok(true)
    }
}
