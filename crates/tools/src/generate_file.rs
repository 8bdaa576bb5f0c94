//! File generator tool: writes UTF-8 files into one output directory.

use std::path::PathBuf;

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::Tool;
use serde_json::{Map, Value};
use tracing::debug;

pub struct GenerateFileTool {
    output_dir: PathBuf,
}

impl GenerateFileTool {
    /// Create a generator that writes into `output_dir`, creating it on first use.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &std::path::Path {
        &self.output_dir
    }
}

/// Accept plain file names only.
pub fn validate_file_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("file name is empty".into());
    }
    if name.contains('/') || name.contains('\\') {
        return Err(format!("'{name}' contains a path separator"));
    }
    if name.contains("..") {
        return Err(format!("'{name}' contains '..'"));
    }
    if name.chars().any(char::is_control) {
        return Err(format!("'{name}' contains control characters"));
    }
    Ok(())
}

#[async_trait]
impl Tool for GenerateFileTool {
    fn name(&self) -> &str {
        "generate_file"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 text file into the output directory. Overwrites an existing file with the same name."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_name": {
                    "type": "string",
                    "description": "Plain file name such as 'notes.md', without directories"
                },
                "content": {
                    "type": "string",
                    "description": "The file content"
                }
            },
            "required": ["file_name", "content"]
        })
    }

    async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        let file_name = arguments
            .get("file_name")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'file_name' argument".into()))?;

        let content = arguments
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;

        validate_file_name(file_name).map_err(ToolError::InvalidArguments)?;

        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "generate_file".into(),
            reason,
        };

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| failed(format!("Failed to create output directory: {e}")))?;

        let path = self.output_dir.join(file_name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| failed(format!("Failed to write file: {e}")))?;

        debug!(path = %path.display(), bytes = content.len(), "Generated file");
        Ok(serde_json::json!({
            "path": path.display().to_string(),
            "bytes": content.len(),
        }))
    }
}
