//! Directory listing tool.

use crate::file_read::resolve_against;
use async_trait::async_trait;
use ratchet_core::error::ToolError;
use ratchet_core::tool::{Tool, ToolOutput};
use std::path::PathBuf;

/// Lists the entry names of a directory, sorted.
///
/// The output is a JSON array such as `["a.txt","b.txt"]`; the same array is
/// attached as structured data.
pub struct ListDirTool {
    working_dir: PathBuf,
}

impl ListDirTool {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the names of the entries in a directory, sorted alphabetically."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list; defaults to the working directory"
                }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = match arguments.get("path") {
            None | Some(serde_json::Value::Null) => ".",
            Some(v) => v
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("'path' must be a string".into()))?,
        };
        let dir = resolve_against(&self.working_dir, path);

        let failed = |e: std::io::Error| ToolError::ExecutionFailed {
            tool_name: "list_dir".into(),
            reason: format!("Failed to list {}: {e}", dir.display()),
        };

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(failed)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(failed)? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let data = serde_json::json!(names);
        Ok(ToolOutput::text(data.to_string()).with_data(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_sorted_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();

        let tool = ListDirTool::new("/");
        let out = tool
            .execute(serde_json::json!({"path": dir.path().to_str().unwrap()}))
            .await
            .unwrap();

        assert_eq!(out.output, r#"["a.txt","b.txt"]"#);
        assert_eq!(out.data, Some(serde_json::json!(["a.txt", "b.txt"])));
    }

    #[tokio::test]
    async fn defaults_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();

        let tool = ListDirTool::new(dir.path());
        let out = tool.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(out.output, r#"["Cargo.toml"]"#);
    }

    #[tokio::test]
    async fn missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ListDirTool::new(dir.path());
        let err = tool
            .execute(serde_json::json!({"path": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }
}
