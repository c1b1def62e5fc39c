//! Remote tool servers over the Model Context Protocol.
//!
//! Each configured server is launched as a child process, initialized, and
//! its tools are registered as remote capabilities named `<server>__<tool>`.

pub mod client;
pub mod transport;

pub use client::{McpClient, McpToolInfo, qualified_name};
pub use transport::{McpError, McpTransport, StdioTransport};

use ratchet_config::McpServerConfig;
use ratchet_core::tool::{ToolRegistry, ToolServer};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Initialize `client`, list its tools and register them.
///
/// Returns the number of tools registered.
pub async fn register_server(
    mut client: McpClient,
    registry: &mut ToolRegistry,
) -> Result<(Arc<McpClient>, usize), McpError> {
    client.initialize().await?;
    let tools = client.list_tools().await?;

    let definitions: Vec<_> = tools
        .iter()
        .map(|t| (t.name.clone(), client.definition_for(t)))
        .collect();
    let client = Arc::new(client);

    for (remote_name, definition) in definitions {
        if registry.contains(&definition.name) {
            warn!(tool = %definition.name, "Remote tool shadows an existing tool");
        }
        registry.register_remote(client.clone(), remote_name, definition);
    }

    Ok((client, tools.len()))
}

/// Launch every enabled server and register its tools.
///
/// Servers that fail to start, or do not finish `initialize` and `tools/list`
/// within `startup_timeout`, are logged and skipped.
pub async fn connect_servers(
    servers: &BTreeMap<String, McpServerConfig>,
    working_dir: &Path,
    startup_timeout: Duration,
    registry: &mut ToolRegistry,
) -> Vec<Arc<McpClient>> {
    let mut connected = Vec::new();

    for (name, config) in servers.iter().filter(|(_, c)| c.enabled) {
        let transport =
            match StdioTransport::spawn(&config.command, &config.args, &config.env, Some(working_dir)) {
                Ok(t) => t,
                Err(e) => {
                    warn!(server = %name, command = %config.command, error = %e, "Failed to start MCP server");
                    continue;
                }
            };

        let client = McpClient::new(name.clone(), Box::new(transport));
        if let Some(client) = connect_one(client, startup_timeout, registry).await {
            connected.push(client);
        }
    }

    connected
}

/// Register one server, giving up after `startup_timeout`.
///
/// On timeout the client is dropped, which kills its child process.
async fn connect_one(
    client: McpClient,
    startup_timeout: Duration,
    registry: &mut ToolRegistry,
) -> Option<Arc<McpClient>> {
    let name = client.name().to_string();
    match tokio::time::timeout(startup_timeout, register_server(client, registry)).await {
        Ok(Ok((client, count))) => {
            info!(server = %name, tools = count, "MCP server connected");
            Some(client)
        }
        Ok(Err(e)) => {
            warn!(server = %name, error = %e, "Failed to initialize MCP server");
            None
        }
        Err(_) => {
            warn!(
                server = %name,
                timeout = ?startup_timeout,
                "MCP server did not finish startup in time, skipping"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::tests::{echo_server, fake_server};

    #[tokio::test]
    async fn registers_all_pages_as_remote_tools() {
        let mut registry = ToolRegistry::new();
        let client = McpClient::new("echo", Box::new(fake_server(echo_server)));
        let (_client, count) = register_server(client, &mut registry).await.unwrap();

        assert_eq!(count, 2);
        let tool = registry.get("echo__echo").unwrap();
        assert!(tool.handle.is_remote());
        let out = tool
            .handle
            .invoke(serde_json::json!({"text": "ping"}))
            .await
            .unwrap();
        assert_eq!(out.output, "ping");
    }

    #[tokio::test]
    async fn missing_binary_is_skipped() {
        let mut servers = BTreeMap::new();
        servers.insert(
            "ghost".to_string(),
            McpServerConfig {
                command: "ratchet-no-such-mcp-server".into(),
                args: vec![],
                env: Default::default(),
                enabled: true,
            },
        );
        let mut registry = ToolRegistry::new();
        let connected =
            connect_servers(&servers, Path::new("."), Duration::from_secs(5), &mut registry).await;
        assert!(connected.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn silent_server_is_skipped_after_startup_timeout() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(client_io);
        let transport = StdioTransport::from_streams(tokio::io::BufReader::new(read), write);
        let client = McpClient::new("stuck", Box::new(transport));

        let mut registry = ToolRegistry::new();
        let connected = connect_one(client, Duration::from_millis(100), &mut registry).await;

        assert!(connected.is_none());
        assert!(registry.is_empty());
        drop(server_io);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hanging_process_does_not_block_startup() {
        let mut servers = BTreeMap::new();
        servers.insert(
            "pulling".to_string(),
            McpServerConfig {
                command: "sleep".into(),
                args: vec!["1000".into()],
                env: Default::default(),
                enabled: true,
            },
        );
        let mut registry = ToolRegistry::new();
        let connected = connect_servers(
            &servers,
            Path::new("."),
            Duration::from_millis(200),
            &mut registry,
        )
        .await;
        assert!(connected.is_empty());
        assert!(registry.is_empty());
    }
}
