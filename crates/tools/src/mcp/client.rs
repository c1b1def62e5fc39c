//! MCP client implementation
//!
//! Speaks the Model Context Protocol to one tool server and exposes it to the
//! loop as a [`ToolServer`].

use super::transport::{JsonRpcRequest, McpError, McpTransport};
use async_trait::async_trait;
use ratchet_core::error::ToolError;
use ratchet_core::provider::ToolDefinition;
use ratchet_core::tool::{ToolOutput, ToolServer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// MCP protocol version
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client info for initialization
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "ratchet".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server info returned during initialization
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Initialize result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub server_info: ServerInfo,
}

/// MCP Tool definition from server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Tool list result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<McpToolInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Tool call result content
#[derive(Debug, Clone, Deserialize)]
pub struct ToolResultContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Tool call result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolResultContent>,
    #[serde(default)]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text blocks joined by newlines; non-text blocks are summarised.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| match &c.text {
                Some(t) => t.clone(),
                None => format!("[{} content]", c.content_type),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Name under which a server's tool is registered: `<server>__<tool>`.
pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{server}__{tool}")
}

/// MCP Client
pub struct McpClient {
    name: String,
    transport: Box<dyn McpTransport>,
    request_id: AtomicU64,
    server_info: Option<ServerInfo>,
}

impl McpClient {
    /// Create a new MCP client with the given transport
    pub fn new(name: impl Into<String>, transport: Box<dyn McpTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
            request_id: AtomicU64::new(1),
            server_info: None,
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let response = self.transport.send_request(request).await?;

        if let Some(error) = response.error {
            return Err(McpError::Rpc(error));
        }

        let result = response
            .result
            .ok_or_else(|| McpError::Protocol(format!("{method} response missing result")))?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse {method} result: {e}")))
    }

    /// Initialize the connection with the MCP server
    pub async fn initialize(&mut self) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": ClientInfo::default()
        });

        let result: InitializeResult = self.request("initialize", Some(params)).await?;
        self.transport
            .send_notification("notifications/initialized", None)
            .await?;

        info!(
            server = %self.name,
            remote = %result.server_info.name,
            protocol = %result.protocol_version,
            "MCP server initialized"
        );
        self.server_info = Some(result.server_info.clone());
        Ok(result)
    }

    pub fn is_initialized(&self) -> bool {
        self.server_info.is_some()
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// List available tools, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let result: ListToolsResult = self.request("tools/list", params).await?;
            tools.extend(result.tools);

            match result.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!(server = %self.name, count = tools.len(), "Listed MCP tools");
        Ok(tools)
    }

    /// Call a tool
    pub async fn call(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });
        self.request("tools/call", Some(params)).await
    }

    /// The definition the model sees for one of this server's tools.
    pub fn definition_for(&self, tool: &McpToolInfo) -> ToolDefinition {
        let parameters = if tool.input_schema.is_object() {
            tool.input_schema.clone()
        } else {
            serde_json::json!({"type": "object", "properties": {}})
        };
        ToolDefinition {
            name: qualified_name(&self.name, &tool.name),
            description: tool
                .description
                .clone()
                .unwrap_or_else(|| format!("{} (via {})", tool.name, self.name)),
            parameters,
        }
    }

    pub async fn close(&self) -> Result<(), McpError> {
        self.transport.close().await
    }
}

#[async_trait]
impl ToolServer for McpClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        let result = self.call(tool_name, arguments).await.map_err(|e| {
            if e.is_transport() {
                ToolError::Unreachable {
                    server: self.name.clone(),
                    reason: e.to_string(),
                }
            } else {
                ToolError::ExecutionFailed {
                    tool_name: qualified_name(&self.name, tool_name),
                    reason: e.to_string(),
                }
            }
        })?;

        if result.is_error {
            return Err(ToolError::ExecutionFailed {
                tool_name: qualified_name(&self.name, tool_name),
                reason: result.text(),
            });
        }

        let output = ToolOutput::text(result.text());
        Ok(match result.structured_content {
            Some(data) => output.with_data(data),
            None => output,
        })
    }
}
