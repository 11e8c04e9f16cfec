//! Provider traits.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Provider errors.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// API error.
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rate limited.
    #[error("Rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retry.
        retry_after_secs: u64,
    },

    /// The call did not finish in time.
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the call.
    #[error("Provider call cancelled")]
    Cancelled,

    /// The agent process could not be started.
    #[error("Failed to launch {binary}: {source}")]
    Spawn {
        /// Binary that failed to start.
        binary: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ProviderError {
    /// HTTP status associated with the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Result of one agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Whether the agent completed the prompt.
    pub success: bool,

    /// Agent output text.
    pub content: String,

    /// Error text when `success` is false.
    #[serde(default)]
    pub error: Option<String>,

    /// Provider-specific details (usage, model, exit code).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentResponse {
    /// Successful response with output text.
    #[must_use]
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            ..Self::default()
        }
    }

    /// Unsuccessful response with an error message.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A language-model agent that executes prompts.
///
/// Implementations must stop work promptly when `cancel` fires and return
/// `ProviderError::Cancelled`.
#[async_trait]
pub trait CliAgent: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Execute a prompt with no project context.
    async fn execute(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, ProviderError>;

    /// Execute a prompt with `project_path` as the working directory.
    ///
    /// Agents that cannot see the filesystem ignore the path.
    async fn execute_in_project(
        &self,
        prompt: &str,
        project_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, ProviderError> {
        let _ = project_path;
        self.execute(prompt, cancel).await
    }
}
