//! MCP transport layer: newline-delimited JSON-RPC 2.0 over a child's stdio.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum McpError {
    /// The connection is gone; the server must be restarted.
    #[error("MCP server closed the connection")]
    Closed,

    #[error("MCP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    /// The server answered with a JSON-RPC error object.
    #[error("{0}")]
    Rpc(JsonRpcError),
}

impl McpError {
    /// Whether the failure is in the transport rather than the server's answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }
}

/// Transport trait for MCP communication
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for the response with the same id.
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected)
    async fn send_notification(&self, method: &str, params: Option<Value>)
    -> Result<(), McpError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), McpError>;
}

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Streams {
    reader: Reader,
    writer: Writer,
    /// Bytes of a line whose read was interrupted; the next read continues it.
    pending: Vec<u8>,
}

/// Stdio transport for MCP servers running as child processes
pub struct StdioTransport {
    streams: Mutex<Streams>,
    child: Mutex<Option<Child>>,
    connected: AtomicBool,
}

impl StdioTransport {
    /// Build a transport over arbitrary byte streams (no child process).
    pub fn from_streams(
        reader: impl AsyncBufRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            streams: Mutex::new(Streams {
                reader: Box::new(reader),
                writer: Box::new(writer),
                pending: Vec::new(),
            }),
            child: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    /// Spawn a new process and create transport
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("Failed to capture stdin of MCP server".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("Failed to capture stdout of MCP server".into()))?;

        debug!(command, pid = child.id(), "Spawned MCP server");

        let mut transport = Self::from_streams(BufReader::new(stdout), stdin);
        *transport.child.get_mut() = Some(child);
        Ok(transport)
    }

    fn disconnect<T>(&self, error: McpError) -> Result<T, McpError> {
        if error.is_transport() {
            self.connected.store(false, Ordering::SeqCst);
        }
        Err(error)
    }
}

async fn write_message(writer: &mut Writer, value: &Value) -> Result<(), McpError> {
    let mut json =
        serde_json::to_string(value).map_err(|e| McpError::Protocol(e.to_string()))?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-terminated message.
///
/// `read_until` keeps partially read bytes in `pending` when the future is
/// dropped, so a caller's timeout never splits a response across two reads.
async fn read_message(reader: &mut Reader, pending: &mut Vec<u8>) -> Result<Value, McpError> {
    loop {
        if reader.read_until(b'\n', pending).await? == 0 {
            return Err(McpError::Closed);
        }
        if !pending.ends_with(b"\n") {
            // EOF in the middle of a line
            pending.clear();
            return Err(McpError::Closed);
        }
        let line = std::mem::take(pending);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return serde_json::from_slice(&line)
            .map_err(|e| McpError::Protocol(format!("Invalid JSON from MCP server: {e}")));
    }
}

/// Marks the transport unusable if a write is abandoned half-way.
struct WriteGuard<'a> {
    connected: &'a AtomicBool,
    armed: bool,
}

impl WriteGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("MCP write interrupted, marking transport disconnected");
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        if !self.is_connected() {
            return Err(McpError::Closed);
        }

        let request_id = request.id;
        let value = serde_json::to_value(&request).map_err(|e| McpError::Protocol(e.to_string()))?;

        let mut streams = self.streams.lock().await;
        let Streams {
            reader,
            writer,
            pending,
        } = &mut *streams;

        let guard = WriteGuard {
            connected: &self.connected,
            armed: true,
        };
        let written = write_message(writer, &value).await;
        guard.disarm();
        if let Err(e) = written {
            return self.disconnect(e);
        }

        // Skip notifications and stale responses until ours arrives
        loop {
            let message = match read_message(reader, pending).await {
                Ok(m) => m,
                Err(e) => return self.disconnect(e),
            };

            if message.get("id").is_none_or(Value::is_null) {
                trace!(method = ?message.get("method"), "Ignoring MCP notification");
                continue;
            }

            let response: JsonRpcResponse = serde_json::from_value(message)
                .map_err(|e| McpError::Protocol(format!("Invalid JSON-RPC response: {e}")))?;

            if response.id == Some(request_id) {
                return Ok(response);
            }
            trace!(expected = request_id, got = ?response.id, "Skipping stale MCP response");
        }
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut streams = self.streams.lock().await;
        let guard = WriteGuard {
            connected: &self.connected,
            armed: true,
        };
        let written = write_message(&mut streams.writer, &notification).await;
        guard.disarm();
        match written {
            Ok(()) => Ok(()),
            Err(e) => self.disconnect(e),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), McpError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(7, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""id":7"#));
        assert!(!json.contains("params"));
    }

    #[tokio::test]
    async fn skips_notifications_and_stale_ids() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let transport = StdioTransport::from_streams(BufReader::new(client_read), client_write);

        let server = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server_io);
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["method"], "ping");
            let out = concat!(
                r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":2,"result":{"ok":true}}"#,
                "\n"
            );
            write.write_all(out.as_bytes()).await.unwrap();
        });

        let resp = transport
            .send_request(JsonRpcRequest::new(2, "ping", None))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn response_split_by_timeout_is_not_lost() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let transport = StdioTransport::from_streams(BufReader::new(client_read), client_write);

        let server = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server_io);
            let mut lines = BufReader::new(read).lines();

            lines.next_line().await.unwrap().unwrap();
            let first = r#"{"jsonrpc":"2.0","id":1,"result":{"n":1}}"#;
            let (head, tail) = first.split_at(first.len() / 2);
            write.write_all(head.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            write.write_all(format!("{tail}\n").as_bytes()).await.unwrap();

            lines.next_line().await.unwrap().unwrap();
            write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"n\":2}}\n")
                .await
                .unwrap();
        });

        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            transport.send_request(JsonRpcRequest::new(1, "tools/call", None)),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(transport.is_connected());

        let resp = transport
            .send_request(JsonRpcRequest::new(2, "tools/call", None))
            .await
            .unwrap();
        assert_eq!(resp.id, Some(2));
        assert_eq!(resp.result.unwrap()["n"], 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_disconnects() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let transport = StdioTransport::from_streams(BufReader::new(client_read), client_write);
        drop(server_io);

        let err = transport
            .send_request(JsonRpcRequest::new(1, "ping", None))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(!transport.is_connected());

        let again = transport
            .send_request(JsonRpcRequest::new(2, "ping", None))
            .await
            .unwrap_err();
        assert!(matches!(again, McpError::Closed));
    }
}
