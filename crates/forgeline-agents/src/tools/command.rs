//! Whitelisted command execution: shell, build and test tools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use forgeline_core::config::ToolsConfig;
use forgeline_core::validation::validate_command;

use super::{Tool, ToolError, ToolExecutionContext, ToolResult};
use crate::process::{ProcessSpec, run_process};

/// Floor for build and test timeouts.
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Build system detected from the files in a project directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    /// `Cargo.toml`
    Cargo,
    /// `package.json`
    Npm,
    /// `go.mod`
    Go,
    /// `*.sln` or `*.csproj`
    Dotnet,
    /// `pom.xml`
    Maven,
    /// `build.gradle` or `build.gradle.kts`
    Gradle,
    /// `Makefile`
    Make,
    /// `pyproject.toml` or `setup.py`
    Python,
}

impl Toolchain {
    /// Detect the toolchain of `dir`, first match wins.
    #[must_use]
    pub fn detect(dir: &Path) -> Option<Self> {
        let has = |name: &str| dir.join(name).is_file();
        let has_extension = |ext: &str| {
            std::fs::read_dir(dir).is_ok_and(|entries| {
                entries
                    .flatten()
                    .any(|e| e.path().extension().is_some_and(|x| x == ext))
            })
        };

        if has("Cargo.toml") {
            Some(Self::Cargo)
        } else if has("package.json") {
            Some(Self::Npm)
        } else if has("go.mod") {
            Some(Self::Go)
        } else if has_extension("sln") || has_extension("csproj") {
            Some(Self::Dotnet)
        } else if has("pom.xml") {
            Some(Self::Maven)
        } else if has("build.gradle") || has("build.gradle.kts") {
            Some(Self::Gradle)
        } else if has("Makefile") {
            Some(Self::Make)
        } else if has("pyproject.toml") || has("setup.py") {
            Some(Self::Python)
        } else {
            None
        }
    }

    /// Executable and arguments that build the project.
    #[must_use]
    pub fn build_command(self) -> (&'static str, Vec<&'static str>) {
        match self {
            Self::Cargo => ("cargo", vec!["build"]),
            Self::Npm => ("npm", vec!["run", "build"]),
            Self::Go => ("go", vec!["build", "./..."]),
            Self::Dotnet => ("dotnet", vec!["build"]),
            Self::Maven => ("mvn", vec!["-q", "compile"]),
            Self::Gradle => ("gradle", vec!["build", "-x", "test"]),
            Self::Make => ("make", vec![]),
            Self::Python => ("pytest", vec!["--collect-only", "-q"]),
        }
    }

    /// Executable and arguments that run the test suite.
    #[must_use]
    pub fn test_command(self) -> (&'static str, Vec<&'static str>) {
        match self {
            Self::Cargo => ("cargo", vec!["test"]),
            Self::Npm => ("npm", vec!["test"]),
            Self::Go => ("go", vec!["test", "./..."]),
            Self::Dotnet => ("dotnet", vec!["test"]),
            Self::Maven => ("mvn", vec!["-q", "test"]),
            Self::Gradle => ("gradle", vec!["test"]),
            Self::Make => ("make", vec!["test"]),
            Self::Python => ("pytest", vec![]),
        }
    }
}

/// Validate, spawn, and turn the process outcome into a tool result.
async fn run_whitelisted(
    tool: &str,
    program: &str,
    args: Vec<String>,
    working_dir: PathBuf,
    whitelist: &[String],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ToolResult, ToolError> {
    validate_command(program, &args, whitelist)?;

    tracing::info!(tool, program, args = ?args, "Running command");
    let spec = ProcessSpec::new(tool, program, args)
        .with_working_dir(working_dir)
        .with_timeout(timeout);
    let output = run_process(&spec, cancel).await?;

    let result = if output.success() {
        ToolResult::success(output.combined())
    } else {
        let code = output
            .exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        ToolResult {
            success: false,
            content: output.combined(),
            error: Some(format!("{program} exited with {code}")),
            truncated: false,
        }
    };
    Ok(result.with_truncated(output.truncated))
}

fn project_dir(ctx: &ToolExecutionContext) -> Result<PathBuf, ToolError> {
    let dir = ctx.resolve_path(ctx.optional_str("path").unwrap_or("."))?;
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(ToolError::InvalidParams(format!(
            "Not a directory: {}",
            ctx.display_path(&dir)
        )))
    }
}

/// Run a whitelisted executable without a shell.
pub struct RunShellTool {
    whitelist: Vec<String>,
}

impl RunShellTool {
    /// Create the tool from sandbox configuration.
    #[must_use]
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            whitelist: config.command_whitelist.clone(),
        }
    }
}

#[async_trait]
impl Tool for RunShellTool {
    fn name(&self) -> &str {
        "run_shell"
    }

    fn description(&self) -> &str {
        "Run a whitelisted executable with arguments in the workspace (no shell expansion)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Executable name, e.g. cargo"},
                "args": {"type": "array", "items": {"type": "string"}},
                "path": {"type": "string", "description": "Working directory relative to the workspace root"}
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let program = ctx.require_str("command")?;
        let args = ctx.string_list("args")?;
        let dir = project_dir(ctx)?;
        run_whitelisted(
            self.name(),
            program,
            args,
            dir,
            &self.whitelist,
            ctx.timeout,
            cancel,
        )
        .await
    }
}

/// Build the project with its detected toolchain.
pub struct RunBuildTool {
    whitelist: Vec<String>,
    timeout: Duration,
}

impl RunBuildTool {
    /// Create the tool from sandbox configuration.
    #[must_use]
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            whitelist: config.command_whitelist.clone(),
            timeout: config.default_timeout().max(BUILD_TIMEOUT),
        }
    }
}

/// Run the project's test suite with its detected toolchain.
pub struct RunTestsTool {
    whitelist: Vec<String>,
    timeout: Duration,
}

impl RunTestsTool {
    /// Create the tool from sandbox configuration.
    #[must_use]
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            whitelist: config.command_whitelist.clone(),
            timeout: config.default_timeout().max(BUILD_TIMEOUT),
        }
    }
}

fn toolchain_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": {"type": "string", "description": "Project directory relative to the workspace root"},
            "args": {"type": "array", "items": {"type": "string"}, "description": "Extra arguments"}
        }
    })
}

async fn run_toolchain(
    tool: &str,
    ctx: &ToolExecutionContext,
    whitelist: &[String],
    cancel: &CancellationToken,
    select: fn(Toolchain) -> (&'static str, Vec<&'static str>),
) -> Result<ToolResult, ToolError> {
    let dir = project_dir(ctx)?;
    let Some(toolchain) = Toolchain::detect(&dir) else {
        return Ok(ToolResult::error(format!(
            "No supported build system found in {}",
            ctx.display_path(&dir)
        )));
    };

    let (program, base) = select(toolchain);
    let mut args: Vec<String> = base.into_iter().map(str::to_string).collect();
    args.extend(ctx.string_list("args")?);
    run_whitelisted(tool, program, args, dir, whitelist, ctx.timeout, cancel).await
}

#[async_trait]
impl Tool for RunBuildTool {
    fn name(&self) -> &str {
        "run_build"
    }

    fn description(&self) -> &str {
        "Build the project using its detected build system"
    }

    fn input_schema(&self) -> Value {
        toolchain_schema()
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        run_toolchain(self.name(), ctx, &self.whitelist, cancel, Toolchain::build_command).await
    }
}

#[async_trait]
impl Tool for RunTestsTool {
    fn name(&self) -> &str {
        "run_tests"
    }

    fn description(&self) -> &str {
        "Run the project's tests using its detected build system"
    }

    fn input_schema(&self) -> Value {
        toolchain_schema()
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        run_toolchain(self.name(), ctx, &self.whitelist, cancel, Toolchain::test_command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    #[test]
    fn test_detect_toolchain() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Toolchain::detect(dir.path()), None);

        std::fs::write(dir.path().join("App.csproj"), "<Project />").unwrap();
        assert_eq!(Toolchain::detect(dir.path()), Some(Toolchain::Dotnet));

        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(Toolchain::detect(dir.path()), Some(Toolchain::Cargo));
        assert_eq!(Toolchain::Cargo.test_command(), ("cargo", vec!["test"]));
    }

    #[tokio::test]
    async fn test_unwhitelisted_command_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunShellTool::new(&ToolsConfig::default());

        let result = tool
            .execute(
                &context(dir.path(), json!({"command": "touch", "args": ["pwned"]})),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ToolError::SecurityViolation(_))));
        assert!(!dir.path().join("pwned").exists());
    }

    #[tokio::test]
    async fn test_metacharacters_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunShellTool::new(&ToolsConfig::default());

        let result = tool
            .execute(
                &context(dir.path(), json!({"command": "git", "args": ["status; rm -rf /"]})),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ToolError::SecurityViolation(_))));
    }

    #[tokio::test]
    async fn test_inline_interpreter_code_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunShellTool::new(&ToolsConfig::default());
        let params = json!({
            "command": "python",
            "args": ["-c", "__import__('os').system('touch pwned')"]
        });

        let result = tool
            .execute(&context(dir.path(), params.clone()), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ToolError::SecurityViolation(_))));

        // Still refused when an operator whitelists the interpreter.
        let tool = RunShellTool::new(&ToolsConfig {
            command_whitelist: vec!["python".to_string()],
            ..ToolsConfig::default()
        });
        let result = tool
            .execute(&context(dir.path(), params), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ToolError::SecurityViolation(_))));
        assert!(!dir.path().join("pwned").exists());
    }

    #[tokio::test]
    async fn test_path_qualified_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunShellTool::new(&ToolsConfig::default());

        let result = tool
            .execute(
                &context(dir.path(), json!({"command": "./cargo", "args": ["build"]})),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ToolError::SecurityViolation(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_whitelisted_command_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let tool = RunShellTool::new(&ToolsConfig {
            command_whitelist: vec!["ls".to_string()],
            ..ToolsConfig::default()
        });

        let result = tool
            .execute(&context(dir.path(), json!({"command": "ls"})), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.content.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_build_without_toolchain() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RunBuildTool::new(&ToolsConfig::default());
        let result = tool
            .execute(&context(dir.path(), json!({})), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No supported build system"));
    }
}
