//! File read tool — read a UTF-8 file relative to the working directory.

use async_trait::async_trait;
use ratchet_core::error::ToolError;
use ratchet_core::tool::{Tool, ToolOutput};
use std::path::{Path, PathBuf};

pub struct FileReadTool {
    /// Relative paths are resolved against this directory.
    working_dir: PathBuf,
}

impl FileReadTool {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub(crate) fn resolve(&self, path: &str) -> PathBuf {
        resolve_against(&self.working_dir, path)
    }
}

/// Join `path` onto `base` unless it is already absolute.
pub(crate) fn resolve_against(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file and return its content. \
         Relative paths are resolved against the working directory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute path, or a path relative to the working directory"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;

        let resolved = self.resolve(path);
        tokio::fs::read_to_string(&resolved)
            .await
            .map(ToolOutput::text)
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "file_read".into(),
                reason: format!("Failed to read {}: {e}", resolved.display()),
            })
    }
}
