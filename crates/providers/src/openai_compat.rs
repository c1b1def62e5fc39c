//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, and any endpoint that
//! exposes `/chat/completions` with function calling.

use crate::http;
use async_trait::async_trait;
use ratchet_core::error::ModelError;
use ratchet_core::message::{Message, MessageBody};
use ratchet_core::provider::*;
use ratchet_core::tool::ToolCallRequest;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An OpenAI-compatible model provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http::client(120),
        }
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    /// Convert the log to OpenAI API format.
    ///
    /// Consecutive `tool_call` entries share one assistant message; each
    /// `tool_result` becomes a `tool` message keyed by its call id.
    fn to_api_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<ApiMessage> {
        let mut result: Vec<ApiMessage> = Vec::new();

        if let Some(system) = system_prompt {
            result.push(ApiMessage::text("system", system));
        }

        for msg in messages {
            match &msg.body {
                MessageBody::User { text } => result.push(ApiMessage::text("user", text)),
                MessageBody::Assistant { text } => {
                    result.push(ApiMessage::text("assistant", text))
                }
                MessageBody::ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    let call = ApiToolCall {
                        id: call_id.clone(),
                        r#type: "function".into(),
                        function: ApiFunction {
                            name: tool_name.clone(),
                            arguments: arguments.to_string(),
                        },
                    };
                    match result.last_mut() {
                        Some(last) if last.role == "assistant" && last.tool_calls.is_some() => {
                            if let Some(calls) = last.tool_calls.as_mut() {
                                calls.push(call);
                            }
                        }
                        _ => result.push(ApiMessage {
                            role: "assistant".into(),
                            content: None,
                            tool_calls: Some(vec![call]),
                            tool_call_id: None,
                        }),
                    }
                }
                MessageBody::ToolResult {
                    call_id, outcome, ..
                } => result.push(ApiMessage {
                    role: "tool".into(),
                    content: Some(outcome.model_text()),
                    tool_calls: None,
                    tool_call_id: Some(call_id.clone()),
                }),
            }
        }

        result
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn parse_response(api_response: ApiResponse) -> Result<ModelResponse, ModelError> {
        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Protocol("No choices in response".into()))?;

        let calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let arguments = if tc.function.arguments.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&tc.function.arguments).map_err(|e| {
                        ModelError::Protocol(format!(
                            "Arguments of call '{}' are not JSON: {e}",
                            tc.id
                        ))
                    })?
                };
                Ok(ToolCallRequest::new(tc.id, tc.function.name, arguments))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;

        let text = choice.message.content.unwrap_or_default();
        let reply = if !calls.is_empty() {
            ModelReply::tool_calls(calls, text)
        } else if !text.trim().is_empty() {
            ModelReply::FinalAnswer { text }
        } else {
            return Err(ModelError::Protocol(
                "Response has neither content nor tool calls".into(),
            ));
        };

        let usage = api_response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ModelResponse {
            reply,
            usage,
            model: api_response.model,
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(request.system_prompt.as_deref(), &request.messages),
            "temperature": request.temperature,
            "stream": false,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        debug!(provider = %self.name, model = %request.model, messages = request.messages.len(), "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(http::send_error)?;

        let response = http::check_status(&self.name, response).await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Protocol(format!("Failed to parse response: {e}")))?;

        Self::parse_response(api_response)
    }

    async fn health_check(&self) -> Result<bool, ModelError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(http::send_error)?;

        Ok(response.status().is_success())
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_core::tool::{ToolOutput, ToolResult};

    #[test]
    fn openrouter_constructor() {
        let provider = OpenAiCompatProvider::openrouter("sk-test");
        assert_eq!(provider.name(), "openrouter");
        assert!(provider.base_url.contains("openrouter.ai"));
    }

    #[test]
    fn ollama_constructor() {
        let provider = OpenAiCompatProvider::ollama(None);
        assert_eq!(provider.name(), "ollama");
        assert!(provider.base_url.contains("localhost:11434"));
    }

    #[test]
    fn system_prompt_leads_conversation() {
        let messages = vec![Message::new(1, MessageBody::user("Hello"))];
        let api = OpenAiCompatProvider::to_api_messages(Some("You are helpful"), &messages);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
    }

    #[test]
    fn tool_round_conversion() {
        let a = ToolCallRequest::new("call_a", "list_dir", serde_json::json!({"path": "/tmp"}));
        let b = ToolCallRequest::new("call_b", "file_read", serde_json::json!({"path": "x"}));
        let messages = vec![
            Message::new(1, MessageBody::user("go")),
            Message::new(2, MessageBody::tool_call(&a)),
            Message::new(3, MessageBody::tool_call(&b)),
            Message::new(
                4,
                MessageBody::tool_result(ToolResult::success(&a, ToolOutput::text("[]"))),
            ),
        ];
        let api = OpenAiCompatProvider::to_api_messages(None, &messages);
        assert_eq!(api.len(), 3);
        let calls = api[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].function.name, "file_read");
        assert_eq!(api[2].role, "tool");
        assert_eq!(api[2].tool_call_id.as_deref(), Some("call_a"));
    }

    #[test]
    fn tool_definition_conversion() {
        let tools = vec![ToolDefinition {
            name: "run_unit_tests".into(),
            description: "Run the test suite".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let api_tools = OpenAiCompatProvider::to_api_tools(&tools);
        assert_eq!(api_tools.len(), 1);
        assert_eq!(api_tools[0].function.name, "run_unit_tests");
        assert_eq!(api_tools[0].r#type, "function");
    }

    #[test]
    fn parse_tool_call_response() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{
                "model": "gpt-4o",
                "choices": [{"message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "list_dir", "arguments": "{\"path\":\"/tmp\"}"}}]
                }}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
            }"#,
        )
        .unwrap();
        let parsed = OpenAiCompatProvider::parse_response(resp).unwrap();
        match parsed.reply {
            ModelReply::ToolCalls { calls, narration } => {
                assert_eq!(narration, None);
                assert_eq!(calls[0].call_id, "call_1");
                assert_eq!(calls[0].arguments["path"], "/tmp");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn malformed_arguments_are_protocol_error() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{
                "model": "gpt-4o",
                "choices": [{"message": {
                    "role": "assistant",
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "list_dir", "arguments": "{not json"}}]
                }}]
            }"#,
        )
        .unwrap();
        assert!(matches!(
            OpenAiCompatProvider::parse_response(resp),
            Err(ModelError::Protocol(_))
        ));
    }

    #[test]
    fn no_choices_is_protocol_error() {
        let resp: ApiResponse =
            serde_json::from_str(r#"{"model": "gpt-4o", "choices": []}"#).unwrap();
        assert!(matches!(
            OpenAiCompatProvider::parse_response(resp),
            Err(ModelError::Protocol(_))
        ));
    }
}
