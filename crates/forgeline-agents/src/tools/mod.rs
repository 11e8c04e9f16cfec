//! Tool sandbox: registry, per-agent scoping, and built-in tools.
//!
//! Agents only ever see a [`ScopedToolSet`]: the subset of registered tools
//! their configuration permits, each bound to the tenant's workspace root.
//! Every call is schema-checked and runs under a timeout.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use forgeline_core::config::{Config, ToolsConfig};
use forgeline_core::types::{TenantId, TicketId};
use forgeline_core::validation::{ValidationError, resolve_within_root, validate_tool_params};

use crate::error::StepError;
use crate::process::ProcessError;

mod command;
mod dependencies;
mod file;
mod git;
mod search;

pub use command::{RunBuildTool, RunShellTool, RunTestsTool, Toolchain};
pub use dependencies::{Dependency, DependencyMapTool};
pub use file::{ListDirectoryTool, ReadFileTool, WriteFileTool};
pub use git::GitTool;
pub use search::CodeSearchTool;

/// Extra time a tool gets past its own limit to kill and clean up.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Tool execution errors.
#[derive(Error, Debug)]
pub enum ToolError {
    /// Tool not found.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Tool exists but the agent may not use it.
    #[error("Tool {tool} is not permitted for agent {agent}")]
    NotPermitted {
        /// Tool name.
        tool: String,
        /// Agent ID.
        agent: String,
    },

    /// Invalid parameters.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Path escape, disallowed command, or tenant mismatch.
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Size ceiling exceeded.
    #[error("Resource limit: {0}")]
    ResourceLimit(String),

    /// Tool timed out.
    #[error("Tool {tool} timed out after {duration:?}")]
    Timeout {
        /// Tool name.
        tool: String,
        /// Configured limit.
        duration: Duration,
    },

    /// Call cancelled.
    #[error("Tool call cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl ToolError {
    /// Whether this is a security violation.
    #[must_use]
    pub const fn is_security_violation(&self) -> bool {
        matches!(self, Self::SecurityViolation(_) | Self::NotPermitted { .. })
    }
}

impl From<ValidationError> for ToolError {
    fn from(error: ValidationError) -> Self {
        match error {
            e if e.is_security_violation() => Self::SecurityViolation(e.to_string()),
            e @ (ValidationError::FileTooLarge { .. } | ValidationError::TooLong { .. }) => {
                Self::ResourceLimit(e.to_string())
            }
            ValidationError::Io(e) => Self::Io(e),
            e => Self::InvalidParams(e.to_string()),
        }
    }
}

impl From<ProcessError> for ToolError {
    fn from(error: ProcessError) -> Self {
        match error {
            ProcessError::Timeout { name, duration } => Self::Timeout {
                tool: name,
                duration,
            },
            ProcessError::Cancelled => Self::Cancelled,
            ProcessError::Io(e) => Self::Io(e),
            e @ ProcessError::Spawn { .. } => Self::ExecutionFailed(e.to_string()),
        }
    }
}

impl From<ToolError> for StepError {
    fn from(error: ToolError) -> Self {
        match error {
            ToolError::NotPermitted { .. } | ToolError::SecurityViolation(_) => {
                Self::SecurityViolation(error.to_string())
            }
            ToolError::Timeout { tool, duration } => Self::Timeout {
                operation: tool,
                duration,
            },
            ToolError::Cancelled => Self::Cancelled,
            ToolError::NotFound(_) | ToolError::InvalidParams(_) | ToolError::ResourceLimit(_) => {
                Self::Validation(error.to_string())
            }
            ToolError::Io(_) | ToolError::ExecutionFailed(_) => Self::Internal(error.to_string()),
        }
    }
}

/// Tool execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether execution succeeded.
    pub success: bool,
    /// Result content.
    pub content: String,
    /// Error message if failed.
    pub error: Option<String>,
    /// Whether the content was capped.
    #[serde(default)]
    pub truncated: bool,
}

impl ToolResult {
    /// Create a successful result.
    #[must_use]
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: None,
            truncated: false,
        }
    }

    /// Create an error result.
    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            error: Some(error.into()),
            truncated: false,
        }
    }

    /// Mark the content as capped.
    #[must_use]
    pub const fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }
}

/// Line appended to capped listings.
#[must_use]
pub fn truncation_notice(shown: usize, what: &str) -> String {
    format!("[truncated: showing first {shown} {what}]")
}

/// Tool description handed to providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON Schema of the parameters.
    pub input_schema: Value,
}

/// Everything a tool call may touch. Created per call, never persisted.
#[derive(Debug, Clone)]
pub struct ToolExecutionContext {
    /// Tenant the call runs for.
    pub tenant_id: TenantId,
    /// Ticket the call runs for.
    pub ticket_id: TicketId,
    /// Absolute, canonical workspace root.
    pub workspace_root: PathBuf,
    /// Call parameters.
    pub params: Value,
    /// Time limit for this call.
    pub timeout: Duration,
}

impl ToolExecutionContext {
    /// Required string parameter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` if missing or not a string.
    pub fn require_str(&self, key: &str) -> Result<&str, ToolError> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParams(format!("Missing '{key}' parameter")))
    }

    /// Optional string parameter.
    #[must_use]
    pub fn optional_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Optional unsigned integer parameter.
    #[must_use]
    pub fn optional_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }

    /// Optional boolean parameter.
    #[must_use]
    pub fn optional_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }

    /// Optional list of strings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` if present but not an array of strings.
    pub fn string_list(&self, key: &str) -> Result<Vec<String>, ToolError> {
        let Some(value) = self.params.get(key) else {
            return Ok(Vec::new());
        };
        value
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| ToolError::InvalidParams(format!("'{key}' must be an array of strings")))
    }

    /// Resolve a path parameter inside the workspace root.
    ///
    /// # Errors
    ///
    /// Returns `SecurityViolation` for traversal or escape attempts.
    pub fn resolve_path(&self, requested: &str) -> Result<PathBuf, ToolError> {
        Ok(resolve_within_root(&self.workspace_root, requested)?)
    }

    /// Path relative to the workspace root, for display.
    #[must_use]
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace_root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// A capability an agent can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable tool name.
    fn name(&self) -> &str;

    /// Tool description.
    fn description(&self) -> &str;

    /// Input schema (JSON Schema).
    fn input_schema(&self) -> Value;

    /// Tool-specific time limit; the configured default applies otherwise.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute the tool. Parameters are schema-checked before this is called.
    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError>;
}

/// Registry of available tools, keyed by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    default_timeout: Duration,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            default_timeout: ToolsConfig::default().default_timeout(),
        }
    }

    /// Registry with every built-in tool.
    #[must_use]
    pub fn with_builtins(config: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        registry.default_timeout = config.default_timeout();
        registry.register(Arc::new(ReadFileTool::new(config.max_file_size)));
        registry.register(Arc::new(WriteFileTool::new(config.max_file_size)));
        registry.register(Arc::new(ListDirectoryTool::new(config)));
        registry.register(Arc::new(CodeSearchTool::new(config)));
        registry.register(Arc::new(DependencyMapTool::new(config)));
        registry.register(Arc::new(RunBuildTool::new(config)));
        registry.register(Arc::new(RunTestsTool::new(config)));
        registry.register(Arc::new(RunShellTool::new(config)));
        registry.register(Arc::new(GitTool::new(config)));
        registry
    }

    /// Register a tool, replacing any with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Get a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// All tool names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Tools `agent_id` may use, bound to the tenant's workspace.
    ///
    /// Permitted names come from the agent's configuration; names with no
    /// registered tool are skipped. The workspace root is created if absent.
    ///
    /// # Errors
    ///
    /// Returns `SecurityViolation` for a malformed tenant ID, `Io` if the
    /// workspace root cannot be created.
    pub async fn for_agent(
        &self,
        tenant_id: &TenantId,
        ticket_id: &TicketId,
        agent_id: &str,
        config: &Config,
    ) -> Result<ScopedToolSet, ToolError> {
        tenant_id
            .validate()
            .map_err(|e| ToolError::SecurityViolation(format!("invalid tenant: {e}")))?;

        let root = config.workspace_root(tenant_id);
        tokio::fs::create_dir_all(&root).await?;
        let workspace_root = tokio::fs::canonicalize(&root).await?;

        let mut tools = BTreeMap::new();
        for name in &config.agent(agent_id).tools {
            match self.tools.get(name) {
                Some(tool) => {
                    tools.insert(name.clone(), Arc::clone(tool));
                }
                None => tracing::warn!(agent = agent_id, tool = %name, "Unknown tool in agent config"),
            }
        }

        tracing::debug!(
            agent = agent_id,
            tenant_id = %tenant_id,
            tools = ?tools.keys().collect::<Vec<_>>(),
            "Scoped tool set"
        );

        Ok(ScopedToolSet {
            tenant_id: tenant_id.clone(),
            ticket_id: ticket_id.clone(),
            agent_id: agent_id.to_string(),
            workspace_root,
            tools,
            default_timeout: self.default_timeout,
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The tools one agent may invoke for one tenant and ticket.
pub struct ScopedToolSet {
    tenant_id: TenantId,
    ticket_id: TicketId,
    agent_id: String,
    workspace_root: PathBuf,
    tools: BTreeMap<String, Arc<dyn Tool>>,
    default_timeout: Duration,
}

impl ScopedToolSet {
    /// Permitted tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Whether `name` is permitted.
    #[must_use]
    pub fn permits(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Workspace root every path is resolved against.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Definitions of the permitted tools.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    /// Invoke a permitted tool.
    ///
    /// # Errors
    ///
    /// Returns `NotPermitted` for tools outside the set, `InvalidParams` if
    /// the parameters fail the schema, `Timeout` if the call overruns, and
    /// whatever the tool itself raises.
    pub async fn invoke(
        &self,
        name: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!(tool = name, agent = %self.agent_id, tenant_id = %self.tenant_id, "Tool not permitted");
            return Err(ToolError::NotPermitted {
                tool: name.to_string(),
                agent: self.agent_id.clone(),
            });
        };
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        validate_tool_params(&params, &tool.input_schema()).map_err(|e| match e {
            ValidationError::SchemaViolation(msg) => ToolError::InvalidParams(msg),
            other => ToolError::from(other),
        })?;

        let limit = tool.timeout().unwrap_or(self.default_timeout);
        let ctx = ToolExecutionContext {
            tenant_id: self.tenant_id.clone(),
            ticket_id: self.ticket_id.clone(),
            workspace_root: self.workspace_root.clone(),
            params,
            timeout: limit,
        };

        let call_cancel = cancel.child_token();
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(limit + TIMEOUT_GRACE, tool.execute(&ctx, &call_cancel)).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = outcome.unwrap_or_else(|_| {
            call_cancel.cancel();
            Err(ToolError::Timeout {
                tool: name.to_string(),
                duration: limit,
            })
        });

        match &result {
            Ok(r) => tracing::info!(
                tool = name,
                tenant_id = %self.tenant_id,
                ticket_id = %self.ticket_id,
                success = r.success,
                truncated = r.truncated,
                duration_ms,
                "Tool call finished"
            ),
            Err(e) => tracing::warn!(
                tool = name,
                tenant_id = %self.tenant_id,
                ticket_id = %self.ticket_id,
                error = %e,
                duration_ms,
                "Tool call failed"
            ),
        }
        result
    }
}
