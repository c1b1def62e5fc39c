//! Tool dispatcher — turns a requested call into a recorded outcome.
//!
//! `dispatch` never fails: unknown tools, bad arguments, timeouts and
//! unreachable servers all come back as a failed [`ToolResult`], so every
//! `tool_call` gets exactly one `tool_result`.

use ratchet_core::error::ToolError;
use ratchet_core::provider::ToolDefinition;
use ratchet_core::tool::{ToolCallRequest, ToolRegistry, ToolResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// The schemas sent to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute one call, local or remote, bounded by the timeout.
    pub async fn dispatch(&self, call: &ToolCallRequest) -> ToolResult {
        let Some(tool) = self.registry.get(&call.tool_name) else {
            warn!(tool = %call.tool_name, call_id = %call.call_id, "Model requested unknown tool");
            return ToolResult::from_error(call, &ToolError::NotFound(call.tool_name.clone()));
        };

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.timeout, tool.handle.invoke(call.arguments.clone())).await;

        let result = match outcome {
            Ok(Ok(output)) => ToolResult::success(call, output),
            Ok(Err(e)) => ToolResult::from_error(call, &e),
            Err(_) => ToolResult::from_error(
                call,
                &ToolError::Timeout {
                    tool_name: call.tool_name.clone(),
                    timeout: self.timeout,
                },
            ),
        };

        if result.is_success() {
            debug!(
                tool = %call.tool_name,
                call_id = %call.call_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Tool call succeeded"
            );
        } else {
            warn!(
                tool = %call.tool_name,
                call_id = %call.call_id,
                remote = tool.handle.is_remote(),
                outcome = %result.outcome.model_text(),
                "Tool call failed"
            );
        }
        result
    }
}
