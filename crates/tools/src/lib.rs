//! Tools for ratchet.
//!
//! Local tools read the project (`file_read`, `list_dir`) and run its tests
//! (`run_unit_tests`). Remote tools come from MCP servers. The
//! [`ToolDispatcher`] executes either kind and always yields a result.

pub mod dispatcher;
pub mod file_read;
pub mod list_dir;
pub mod mcp;

pub use dispatcher::ToolDispatcher;
pub use file_read::FileReadTool;
pub use list_dir::ListDirTool;
pub use mcp::{McpClient, connect_servers};
pub use run_tests::RunUnitTestsTool;

use ratchet_config::ToolsConfig;
use ratchet_core::tool::ToolRegistry;
use std::sync::Arc;

/// Create a registry with the built-in local tools, rooted at the configured
/// working directory.
pub fn default_registry(config: &ToolsConfig) -> ToolRegistry {
    let working_dir = config.resolved_working_dir();
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FileReadTool::new(&working_dir)));
    registry.register(Arc::new(ListDirTool::new(&working_dir)));
    registry.register(Arc::new(RunUnitTestsTool::new(
        config.test_command.clone(),
        &working_dir,
    )));
    registry
}
