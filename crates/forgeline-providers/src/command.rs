//! Agents backed by a local coding CLI (Claude Code, Codex, Gemini).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::traits::{AgentResponse, CliAgent, ProviderError};
use forgeline_core::config::CliProviderConfig;

/// Known CLI flavours and how each expects to be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPreset {
    /// `claude -p --output-format json <prompt>`
    Claude,
    /// `codex exec <prompt>`
    Codex,
    /// `gemini -p <prompt>`
    Gemini,
}

impl CommandPreset {
    /// Parse a provider name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// Provider name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    fn prompt_args(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["-p", "--output-format", "json"],
            Self::Codex => &["exec"],
            Self::Gemini => &["-p"],
        }
    }
}

/// Runs one CLI invocation per prompt, passing the prompt as the final argument.
pub struct CommandAgent {
    name: String,
    binary: String,
    args: Vec<String>,
    model: Option<String>,
    timeout: Duration,
}

impl CommandAgent {
    /// Create an agent for an arbitrary binary.
    #[must_use]
    pub fn new(name: impl Into<String>, binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            args,
            model: None,
            timeout: Duration::from_secs(600),
        }
    }

    /// Create an agent for a known CLI using its configured binary.
    #[must_use]
    pub fn from_preset(preset: CommandPreset, config: &CliProviderConfig) -> Self {
        let mut args: Vec<String> = config.extra_args.clone();
        args.extend(preset.prompt_args().iter().map(|a| (*a).to_string()));
        Self::new(preset.name(), config.binary.clone(), args)
    }

    /// Pass `--model <model>` on every invocation.
    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Set the per-invocation timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the binary can be found on `PATH`.
    #[must_use]
    pub fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    async fn run(
        &self,
        prompt: &str,
        project_path: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, ProviderError> {
        let mut command = Command::new(&self.binary);
        if let Some(model) = &self.model {
            command.arg("--model").arg(model);
        }
        command
            .args(&self.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = project_path {
            command.current_dir(dir);
        }

        tracing::debug!(agent = %self.name, binary = %self.binary, "Launching agent CLI");

        let child = command.spawn().map_err(|source| ProviderError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!(agent = %self.name, "Agent CLI cancelled");
                return Err(ProviderError::Cancelled);
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(output) => output.map_err(|source| ProviderError::Spawn {
                    binary: self.binary.clone(),
                    source,
                })?,
                Err(_) => {
                    tracing::warn!(agent = %self.name, timeout = ?self.timeout, "Agent CLI timed out");
                    return Err(ProviderError::Timeout(self.timeout));
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output.status.code();
            let message = if stderr.trim().is_empty() {
                format!("{} exited with status {code:?}", self.binary)
            } else {
                stderr.trim().to_string()
            };
            return Ok(AgentResponse::failure(message)
                .with_metadata("exit_code", code.map_or(Value::Null, Value::from)));
        }

        Ok(parse_output(&stdout).with_metadata("provider", Value::String(self.name.clone())))
    }
}

/// Interpret CLI stdout.
///
/// Structured output (`{"result": …, "usage": …}`) is unpacked; anything else
/// is taken verbatim.
fn parse_output(stdout: &str) -> AgentResponse {
    let trimmed = stdout.trim();
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) else {
        return AgentResponse::ok(trimmed);
    };
    let Some(result) = object.get("result").and_then(Value::as_str) else {
        return AgentResponse::ok(trimmed);
    };

    let mut response = if object.get("is_error").and_then(Value::as_bool) == Some(true) {
        AgentResponse::failure(result)
    } else {
        AgentResponse::ok(result)
    };
    for key in ["usage", "total_cost_usd", "session_id", "num_turns"] {
        if let Some(value) = object.get(key) {
            response = response.with_metadata(key, value.clone());
        }
    }
    response
}

#[async_trait]
impl CliAgent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, ProviderError> {
        self.run(prompt, None, cancel).await
    }

    async fn execute_in_project(
        &self,
        prompt: &str,
        project_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, ProviderError> {
        self.run(prompt, Some(project_path), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::tokens_from_metadata;

    #[test]
    fn test_presets() {
        let config = CliProviderConfig::claude();
        let agent = CommandAgent::from_preset(CommandPreset::Claude, &config);
        assert_eq!(agent.name(), "claude");
        assert_eq!(agent.args, vec!["-p", "--output-format", "json"]);
        assert_eq!(CommandPreset::from_name("codex"), Some(CommandPreset::Codex));
        assert_eq!(CommandPreset::from_name("cursor"), None);
    }

    #[test]
    fn test_parse_structured_output() {
        let response = parse_output(
            r#"{"type":"result","is_error":false,"result":"Plan ready","usage":{"input_tokens":5,"output_tokens":7}}"#,
        );
        assert!(response.success);
        assert_eq!(response.content, "Plan ready");
        assert_eq!(tokens_from_metadata(&response.metadata), Some(12));

        let failed = parse_output(r#"{"is_error":true,"result":"quota exhausted"}"#);
        assert!(!failed.success);

        let plain = parse_output("  plain text answer\n");
        assert_eq!(plain.content, "plain text answer");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_in_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let agent = CommandAgent::new("lister", "ls", vec![]);

        let response = agent
            .execute_in_project(".", dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.success);
        assert!(response.content.contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let agent = CommandAgent::new("lister", "ls", vec![]);
        let response = agent
            .execute("/definitely/not/here", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let agent = CommandAgent::new("sleeper", "sleep", vec![]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = agent.execute("30", &cancel).await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let agent = CommandAgent::new("sleeper", "sleep", vec![])
            .with_timeout(Duration::from_millis(100));
        let result = agent.execute("30", &CancellationToken::new()).await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let agent = CommandAgent::new("ghost", "forgeline-no-such-binary", vec![]);
        assert!(!agent.is_available());
        let result = agent.execute("hi", &CancellationToken::new()).await;
        assert!(matches!(result, Err(ProviderError::Spawn { .. })));
    }
}
