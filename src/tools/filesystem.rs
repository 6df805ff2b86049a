//! Sandboxed file tools: `read_file` and `list_directory`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mcp::handler::{get_optional_string_arg, ToolHandler};
use crate::mcp::protocol::Tool;
use crate::tools::sandbox::Sandbox;

/// Read a UTF-8 file under the sandbox root.
pub struct ReadFileTool {
    sandbox: Arc<Sandbox>,
}

impl ReadFileTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "read_file".to_string(),
            description: "Read the contents of a file from the filesystem".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path to the file, relative to the sandbox root"
                    }
                },
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, args: HashMap<String, Value>, _: CancellationToken) -> Result<Value> {
        let path = get_optional_string_arg(&args, "path").ok_or_else(|| {
            Error::InvalidToolArguments("path parameter is required and must be a string".to_string())
        })?;

        let resolved = self.sandbox.resolve(&path).await?;
        let is_dir = fs::metadata(&resolved).await.map(|m| m.is_dir()).unwrap_or(false);
        if is_dir {
            return Err(Error::InvalidPath(format!("{} is a directory", path)));
        }

        let content = fs::read_to_string(&resolved)
            .await
            .map_err(|e| Error::ToolExecutionFailed(format!("failed to read {}: {}", path, e)))?;
        Ok(Value::String(content))
    }
}

/// One `list_directory` entry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DirEntry {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    size: u64,
    mod_time: String,
}

/// List the entries of a directory under the sandbox root.
pub struct ListDirectoryTool {
    sandbox: Arc<Sandbox>,
}

impl ListDirectoryTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl ToolHandler for ListDirectoryTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "list_directory".to_string(),
            description: "List the contents of a directory".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory relative to the sandbox root (default: .)"
                    }
                }
            }),
        }
    }

    async fn execute(&self, args: HashMap<String, Value>, _: CancellationToken) -> Result<Value> {
        let path = get_optional_string_arg(&args, "path").unwrap_or_else(|| ".".to_string());
        let resolved = self.sandbox.resolve(&path).await?;

        let mut reader = fs::read_dir(&resolved)
            .await
            .map_err(|e| Error::ToolExecutionFailed(format!("failed to list {}: {}", path, e)))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Entry vanished between listing and stat.
                Err(_) => continue,
            };
            let mod_time = metadata
                .modified()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_default();

            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: if metadata.is_dir() { "directory" } else { "file" },
                size: metadata.len(),
                mod_time,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(serde_json::to_value(entries)?)
    }
}
