//! Tool capabilities: what the model may ask the loop to do.
//!
//! A tool is either **local** (runs in-process, implements [`Tool`]) or
//! **remote** (proxied to an external tool-execution server, reached through
//! a [`ToolServer`]). Both are registered in the [`ToolRegistry`] under a
//! unique name together with the schema sent to the model.

use crate::error::{ToolError, ToolFailureKind};
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The model's request to invoke a named tool.
///
/// Ephemeral: it is persisted only as the `tool_call` message it generates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Correlation id chosen by the model service
    pub call_id: String,

    /// Name of the tool to execute
    pub tool_name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// What a successful tool invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Text shown to the model
    pub output: String,

    /// Optional structured payload for tool-specific data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Success payload or typed failure of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Failure {
        kind: ToolFailureKind,
        message: String,
    },
}

impl ToolOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// The text a model sees for this outcome.
    pub fn model_text(&self) -> String {
        match self {
            Self::Success { output, .. } => output.clone(),
            Self::Failure { kind, message } => format!("ERROR ({kind}): {message}"),
        }
    }
}

/// The dispatcher's structured outcome of one tool invocation.
///
/// Always recorded as a `tool_result` message, even on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(call: &ToolCallRequest, output: ToolOutput) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            outcome: ToolOutcome::Success {
                output: output.output,
                data: output.data,
            },
        }
    }

    pub fn failure(
        call: &ToolCallRequest,
        kind: ToolFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            outcome: ToolOutcome::Failure {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn from_error(call: &ToolCallRequest, error: &ToolError) -> Self {
        Self::failure(call, error.kind(), error.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }
}

/// An in-process tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "file_read", "list_dir").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// An external tool-execution server reachable over its own protocol.
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Server name, used in logs and `Unreachable` errors.
    fn name(&self) -> &str;

    /// Invoke `tool_name` on the server.
    ///
    /// Transport failures must be reported as [`ToolError::Unreachable`].
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, ToolError>;
}

/// How a registered tool is invoked.
#[derive(Clone)]
pub enum ToolHandle {
    Local(Arc<dyn Tool>),
    Remote {
        server: Arc<dyn ToolServer>,
        /// Name of the tool on the server (may differ from the registered name)
        remote_name: String,
    },
}

impl ToolHandle {
    pub async fn invoke(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        match self {
            Self::Local(tool) => tool.execute(arguments).await,
            Self::Remote {
                server,
                remote_name,
            } => server.call_tool(remote_name, arguments).await,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(tool) => f.debug_tuple("Local").field(&tool.name()).finish(),
            Self::Remote {
                server,
                remote_name,
            } => f
                .debug_struct("Remote")
                .field("server", &server.name())
                .field("remote_name", remote_name)
                .finish(),
        }
    }
}

/// A tool's schema plus its invocation handle.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub handle: ToolHandle,
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the model
/// 2. Look up the invocation handle when the model requests a call
///
/// Definitions are returned in name order so model requests are stable.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let definition = tool.to_definition();
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                handle: ToolHandle::Local(tool),
            },
        );
    }

    /// Register a tool proxied through a remote server.
    ///
    /// `definition.name` is the name the model sees; `remote_name` is the
    /// name the server knows it by.
    pub fn register_remote(
        &mut self,
        server: Arc<dyn ToolServer>,
        remote_name: impl Into<String>,
        definition: ToolDefinition,
    ) {
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                handle: ToolHandle::Remote {
                    server,
                    remote_name: remote_name.into(),
                },
            },
        );
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get all tool definitions (for sending to the model).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition.clone()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
            let text = arguments["text"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("Missing 'text'".into()))?;
            Ok(ToolOutput::text(text))
        }
    }

    struct UpperServer;

    #[async_trait]
    impl ToolServer for UpperServer {
        fn name(&self) -> &str {
            "upper"
        }
        async fn call_tool(
            &self,
            tool_name: &str,
            arguments: serde_json::Value,
        ) -> Result<ToolOutput, ToolError> {
            assert_eq!(tool_name, "shout");
            let text = arguments["text"].as_str().unwrap_or_default();
            Ok(ToolOutput::text(text.to_uppercase()))
        }
    }

    fn shout_definition() -> ToolDefinition {
        ToolDefinition {
            name: "upper__shout".into(),
            description: "Uppercases text".into(),
            parameters: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn definitions_are_name_ordered() {
        let mut registry = ToolRegistry::new();
        registry.register_remote(Arc::new(UpperServer), "shout", shout_definition());
        registry.register(Arc::new(EchoTool));
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo", "upper__shout"]);
    }

    #[tokio::test]
    async fn local_and_remote_handles_invoke() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register_remote(Arc::new(UpperServer), "shout", shout_definition());

        let local = registry.get("echo").unwrap();
        assert!(!local.handle.is_remote());
        let out = local
            .handle
            .invoke(serde_json::json!({"text": "hello"}))
            .await
            .unwrap();
        assert_eq!(out.output, "hello");

        let remote = registry.get("upper__shout").unwrap();
        assert!(remote.handle.is_remote());
        let out = remote
            .handle
            .invoke(serde_json::json!({"text": "hello"}))
            .await
            .unwrap();
        assert_eq!(out.output, "HELLO");
    }

    #[test]
    fn result_from_error_keeps_call_linkage() {
        let call = ToolCallRequest::new("call_7", "echo", serde_json::json!({}));
        let result = ToolResult::from_error(
            &call,
            &ToolError::Timeout {
                tool_name: "echo".into(),
                timeout: std::time::Duration::from_secs(2),
            },
        );
        assert_eq!(result.call_id, "call_7");
        assert!(!result.is_success());
        match result.outcome {
            ToolOutcome::Failure { kind, .. } => assert_eq!(kind, ToolFailureKind::Timeout),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn outcome_serialization_is_tagged() {
        let outcome = ToolOutcome::Success {
            output: "ok".into(),
            data: None,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains(r#""status":"success""#));
        assert!(!json.contains("data"));
    }
}
