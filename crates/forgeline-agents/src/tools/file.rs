//! Workspace file tools.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use forgeline_core::config::ToolsConfig;
use forgeline_core::validation::{ValidationError, check_file_size};

use super::{Tool, ToolError, ToolExecutionContext, ToolResult, truncation_notice};

/// Read a UTF-8 file inside the workspace.
pub struct ReadFileTool {
    max_file_size: u64,
}

impl ReadFileTool {
    /// Create the tool with a size ceiling.
    #[must_use]
    pub const fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the repository workspace"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace root"}
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        _cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let path = ctx.resolve_path(ctx.require_str("path")?)?;
        if !path.is_file() {
            return Ok(ToolResult::error(format!(
                "Not a file: {}",
                ctx.display_path(&path)
            )));
        }
        // Size is checked from metadata so oversized files are never loaded.
        check_file_size(&path, self.max_file_size)?;

        let bytes = tokio::fs::read(&path).await?;
        match String::from_utf8(bytes) {
            Ok(content) => Ok(ToolResult::success(content)),
            Err(_) => Ok(ToolResult::error(format!(
                "Not a UTF-8 text file: {}",
                ctx.display_path(&path)
            ))),
        }
    }
}

/// Create or overwrite a file inside the workspace.
pub struct WriteFileTool {
    max_file_size: u64,
}

impl WriteFileTool {
    /// Create the tool with a size ceiling.
    #[must_use]
    pub const fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the repository workspace"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        _cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let requested = ctx.require_str("path")?;
        let content = ctx.require_str("content")?;
        let size = content.len() as u64;
        if size > self.max_file_size {
            return Err(ValidationError::FileTooLarge {
                path: requested.to_string(),
                size,
                max: self.max_file_size,
            }
            .into());
        }

        let path = ctx.resolve_path(requested)?;
        if path.is_dir() {
            return Ok(ToolResult::error(format!("Is a directory: {requested}")));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;

        tracing::debug!(path = %ctx.display_path(&path), bytes = size, "Wrote file");
        Ok(ToolResult::success(format!(
            "Wrote {size} bytes to {}",
            ctx.display_path(&path)
        )))
    }
}

/// List a directory, skipping excluded directories.
pub struct ListDirectoryTool {
    max_results: usize,
    excluded_dirs: Vec<String>,
}

impl ListDirectoryTool {
    /// Create the tool from sandbox configuration.
    #[must_use]
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            max_results: config.max_results,
            excluded_dirs: config.excluded_dirs.clone(),
        }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the entries of a directory in the repository workspace"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory relative to the workspace root; defaults to the root"}
            }
        })
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let requested = ctx.optional_str("path").unwrap_or(".");
        let dir = ctx.resolve_path(requested)?;
        if !dir.is_dir() {
            return Ok(ToolResult::error(format!("Not a directory: {requested}")));
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await?.is_dir();
            if is_dir && self.excluded_dirs.iter().any(|d| *d == name) {
                continue;
            }
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort_unstable();

        let truncated = entries.len() > self.max_results;
        entries.truncate(self.max_results);
        if truncated {
            entries.push(truncation_notice(self.max_results, "entries"));
        }
        Ok(ToolResult::success(entries.join("\n")).with_truncated(truncated))
    }
}
