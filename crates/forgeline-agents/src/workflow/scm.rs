//! Source control collaborator for the implementation workflow.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::process::{ProcessError, ProcessSpec, run_process};

/// Source control errors.
#[derive(Error, Debug)]
pub enum ScmError {
    /// Operation not available in this environment.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Command ran and failed.
    #[error("{command} failed: {message}")]
    CommandFailed {
        /// Command that failed.
        command: String,
        /// Error output.
        message: String,
    },

    /// Process could not run to completion.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl From<ScmError> for StepError {
    fn from(error: ScmError) -> Self {
        match error {
            ScmError::Process(ProcessError::Timeout { name, duration }) => Self::Timeout {
                operation: name,
                duration,
            },
            ScmError::Process(ProcessError::Cancelled) => Self::Cancelled,
            e @ ScmError::Unsupported(_) => Self::Validation(e.to_string()),
            e => Self::Internal(e.to_string()),
        }
    }
}

/// Create (and switch to) a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRequest {
    /// Repository checkout.
    pub workspace: PathBuf,
    /// New branch name.
    pub name: String,
    /// Starting point; current `HEAD` if absent.
    pub base: Option<String>,
}

/// Commit every change in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Repository checkout.
    pub workspace: PathBuf,
    /// Commit message.
    pub message: String,
}

/// Created commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    /// Commit SHA.
    pub sha: String,
}

/// Diff of the workspace against a base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffRequest {
    /// Repository checkout.
    pub workspace: PathBuf,
    /// Revision to diff against; the index if absent.
    pub base: Option<String>,
}

/// Open a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRequest {
    /// Repository checkout.
    pub workspace: PathBuf,
    /// Title.
    pub title: String,
    /// Body.
    pub body: String,
    /// Source branch.
    pub head: String,
    /// Target branch.
    pub base: String,
}

/// Opened pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestResponse {
    /// Pull request URL.
    pub url: String,
    /// Pull request number, when the URL carries one.
    pub number: Option<u64>,
}

/// Branch, commit, diff and pull request operations.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Create and switch to a branch.
    async fn create_branch(&self, request: &BranchRequest, cancel: &CancellationToken) -> Result<(), ScmError>;

    /// Stage everything and commit.
    async fn commit(&self, request: &CommitRequest, cancel: &CancellationToken) -> Result<CommitResponse, ScmError>;

    /// Textual diff.
    async fn diff(&self, request: &DiffRequest, cancel: &CancellationToken) -> Result<String, ScmError>;

    /// Open a pull request.
    async fn open_pull_request(
        &self,
        request: &PullRequestRequest,
        cancel: &CancellationToken,
    ) -> Result<PullRequestResponse, ScmError>;
}

/// `git` and `gh` command-line implementation.
pub struct GitCliSourceControl {
    timeout: Duration,
    author_name: String,
    author_email: String,
}

impl GitCliSourceControl {
    /// Create with a per-command timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            author_name: "Forgeline".to_string(),
            author_email: "forgeline@localhost".to_string(),
        }
    }

    /// Commit author identity.
    #[must_use]
    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    async fn git(
        &self,
        workspace: &Path,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<String, ScmError> {
        let mut full = vec![
            "-c".to_string(),
            format!("user.name={}", self.author_name),
            "-c".to_string(),
            format!("user.email={}", self.author_email),
            "--no-pager".to_string(),
        ];
        full.extend(args.iter().map(|a| (*a).to_string()));

        let spec = ProcessSpec::new("git", "git", full)
            .with_working_dir(workspace)
            .with_timeout(self.timeout);
        let output = run_process(&spec, cancel).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(ScmError::CommandFailed {
                command: format!("git {}", args.first().copied().unwrap_or_default()),
                message: output.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl SourceControl for GitCliSourceControl {
    async fn create_branch(&self, request: &BranchRequest, cancel: &CancellationToken) -> Result<(), ScmError> {
        let mut args = vec!["checkout", "-b", request.name.as_str()];
        if let Some(base) = &request.base {
            args.push(base);
        }
        self.git(&request.workspace, &args, cancel).await?;
        tracing::info!(branch = %request.name, "Created branch");
        Ok(())
    }

    async fn commit(&self, request: &CommitRequest, cancel: &CancellationToken) -> Result<CommitResponse, ScmError> {
        self.git(&request.workspace, &["add", "-A"], cancel).await?;
        self.git(&request.workspace, &["commit", "-m", request.message.as_str()], cancel)
            .await?;
        let sha = self
            .git(&request.workspace, &["rev-parse", "HEAD"], cancel)
            .await?
            .trim()
            .to_string();
        tracing::info!(sha = %sha, "Committed changes");
        Ok(CommitResponse { sha })
    }

    async fn diff(&self, request: &DiffRequest, cancel: &CancellationToken) -> Result<String, ScmError> {
        let mut args = vec!["diff"];
        if let Some(base) = &request.base {
            args.push(base);
        }
        self.git(&request.workspace, &args, cancel).await
    }

    async fn open_pull_request(
        &self,
        request: &PullRequestRequest,
        cancel: &CancellationToken,
    ) -> Result<PullRequestResponse, ScmError> {
        let gh = which::which("gh")
            .map_err(|_| ScmError::Unsupported("GitHub CLI (gh) is not installed".to_string()))?;

        self.git(&request.workspace, &["push", "-u", "origin", request.head.as_str()], cancel)
            .await?;

        let args: Vec<String> = [
            "pr",
            "create",
            "--title",
            request.title.as_str(),
            "--body",
            request.body.as_str(),
            "--head",
            request.head.as_str(),
            "--base",
            request.base.as_str(),
        ]
        .iter()
        .map(|a| (*a).to_string())
        .collect();
        let mut allow: Vec<String> = crate::process::DEFAULT_ENV_ALLOWLIST
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        allow.extend(["GH_TOKEN".to_string(), "GITHUB_TOKEN".to_string()]);

        let spec = ProcessSpec::new("gh", gh.to_string_lossy(), args)
            .with_working_dir(request.workspace.clone())
            .with_timeout(self.timeout)
            .with_env_allowlist(allow);
        let output = run_process(&spec, cancel).await?;
        if !output.success() {
            return Err(ScmError::CommandFailed {
                command: "gh pr create".to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        let url = output
            .stdout
            .lines()
            .rev()
            .find(|l| l.starts_with("http"))
            .unwrap_or_default()
            .trim()
            .to_string();
        let number = url.rsplit('/').next().and_then(|n| n.parse().ok());
        tracing::info!(url = %url, "Opened pull request");
        Ok(PullRequestResponse { url, number })
    }
}
