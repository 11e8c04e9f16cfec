//! Read-only git inspection.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use forgeline_core::config::ToolsConfig;
use forgeline_core::validation::validate_command;

use super::{Tool, ToolError, ToolExecutionContext, ToolResult};
use crate::process::{ProcessSpec, run_process};

const OPERATIONS: &[&str] = &["status", "diff", "log", "show"];

/// Flags that make read-only subcommands write files or run external programs.
const FORBIDDEN_FLAGS: &[&str] = &["--output", "--ext-diff", "--textconv", "--exec"];

const DEFAULT_LOG_COUNT: &str = "--max-count=50";

/// `git status|diff|log|show` in the workspace.
pub struct GitTool {
    whitelist: Vec<String>,
}

impl GitTool {
    /// Create the tool from sandbox configuration.
    #[must_use]
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            whitelist: config.command_whitelist.clone(),
        }
    }
}

fn check_args(args: &[String]) -> Result<(), ToolError> {
    for arg in args {
        if FORBIDDEN_FLAGS
            .iter()
            .any(|flag| arg == flag || arg.starts_with(&format!("{flag}=")))
        {
            return Err(ToolError::SecurityViolation(format!(
                "git argument not allowed: {arg}"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl Tool for GitTool {
    fn name(&self) -> &str {
        "git"
    }

    fn description(&self) -> &str {
        "Inspect repository history and changes: status, diff, log or show"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {"type": "string", "enum": OPERATIONS},
                "args": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["operation"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let operation = ctx.require_str("operation")?;
        if !OPERATIONS.contains(&operation) {
            return Err(ToolError::InvalidParams(format!(
                "Unsupported git operation '{operation}', expected one of {OPERATIONS:?}"
            )));
        }
        let extra = ctx.string_list("args")?;
        check_args(&extra)?;

        let mut args = vec!["--no-pager".to_string(), operation.to_string()];
        if operation == "log" && !extra.iter().any(|a| a.starts_with("-n") || a.starts_with("--max-count")) {
            args.push(DEFAULT_LOG_COUNT.to_string());
        }
        args.extend(extra);
        validate_command("git", &args, &self.whitelist)?;

        let spec = ProcessSpec::new("git", "git", args)
            .with_working_dir(ctx.workspace_root.clone())
            .with_timeout(ctx.timeout);
        let output = run_process(&spec, cancel).await?;

        let result = if output.success() {
            ToolResult::success(output.stdout)
        } else {
            ToolResult::error(output.stderr.trim().to_string())
        };
        Ok(result.with_truncated(output.truncated))
    }
}
