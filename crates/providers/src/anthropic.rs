//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly (not OpenAI-compatible proxy).
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks

use crate::http;
use async_trait::async_trait;
use ratchet_core::error::ModelError;
use ratchet_core::message::{Message, MessageBody};
use ratchet_core::provider::*;
use ratchet_core::tool::ToolCallRequest;
use serde::{Deserialize, Serialize};
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client: http::client(300),
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Convert the log to Anthropic API messages.
    ///
    /// Consecutive `tool_call` entries become one assistant message of
    /// `tool_use` blocks; consecutive `tool_result` entries become one user
    /// message of `tool_result` blocks. Adjacent messages with the same API
    /// role are merged, since the API expects alternating turns.
    fn to_api_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
        let mut result: Vec<AnthropicMessage> = Vec::new();

        for msg in messages {
            let (role, block) = match &msg.body {
                MessageBody::User { text } => ("user", ContentBlock::Text { text: text.clone() }),
                MessageBody::Assistant { text } => {
                    ("assistant", ContentBlock::Text { text: text.clone() })
                }
                MessageBody::ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                } => (
                    "assistant",
                    ContentBlock::ToolUse {
                        id: call_id.clone(),
                        name: tool_name.clone(),
                        input: arguments.clone(),
                    },
                ),
                MessageBody::ToolResult {
                    call_id, outcome, ..
                } => (
                    "user",
                    ContentBlock::ToolResult {
                        tool_use_id: call_id.clone(),
                        content: outcome.model_text(),
                        is_error: outcome.is_failure(),
                    },
                ),
            };

            match result.last_mut() {
                Some(last) if last.role == role => last.content.push(block),
                _ => result.push(AnthropicMessage {
                    role: role.into(),
                    content: vec![block],
                }),
            }
        }

        result
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    /// Convert an Anthropic API response to a typed reply.
    ///
    /// Any `tool_use` block makes the reply a tool-call list (text beside it
    /// rides along as narration); otherwise the joined text is the answer.
    fn parse_response(resp: AnthropicResponse) -> Result<ModelResponse, ModelError> {
        let mut text_content = String::new();
        let mut calls = Vec::new();

        for block in resp.content {
            match block {
                ResponseContentBlock::Text { text } => {
                    if !text_content.is_empty() {
                        text_content.push('\n');
                    }
                    text_content.push_str(&text);
                }
                ResponseContentBlock::ToolUse { id, name, input } => {
                    calls.push(ToolCallRequest::new(id, name, input));
                }
                ResponseContentBlock::Other => {}
            }
        }

        let reply = if !calls.is_empty() {
            ModelReply::tool_calls(calls, text_content)
        } else if !text_content.trim().is_empty() {
            ModelReply::FinalAnswer { text: text_content }
        } else {
            return Err(ModelError::Protocol(format!(
                "Anthropic response {} has neither text nor tool use (stop_reason: {})",
                resp.id,
                resp.stop_reason.as_deref().unwrap_or("none")
            )));
        };

        Ok(ModelResponse {
            reply,
            usage: Some(Usage {
                prompt_tokens: resp.usage.input_tokens,
                completion_tokens: resp.usage.output_tokens,
                total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
            }),
            model: resp.model,
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/v1/messages", self.base_url);
        let api_messages = Self::to_api_messages(&request.messages);
        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": api_messages,
            "max_tokens": max_tokens,
            "temperature": request.temperature,
        });

        if let Some(ref sys) = request.system_prompt {
            body["system"] = serde_json::json!(sys);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        debug!(provider = "anthropic", model = %request.model, messages = request.messages.len(), "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(http::send_error)?;

        let response = http::check_status("anthropic", response).await?;

        let api_resp: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Protocol(format!("Failed to parse Anthropic response: {e}")))?;

        Self::parse_response(api_resp)
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Thinking and any future block types
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
