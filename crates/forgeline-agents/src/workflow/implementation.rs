//! Implementation workflow: implement the approved plan, code review, pull request.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use forgeline_core::ticket::TicketStatus;

use super::planning::{PlanArtifact, REVIEW_DECISION_KEY, REVIEW_FEEDBACK_KEY, usage_output};
use super::scm::{BranchRequest, CommitRequest, DiffRequest, PullRequestRequest, SourceControl};
use super::{WorkflowGraph, WorkflowNode};
use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::StepError;
use crate::runtime::AgentRuntime;

/// Implementation workflow ID.
pub const IMPLEMENTATION_WORKFLOW: &str = "implementation";

const IMPLEMENTER: &str = "implementer";
const MAX_TEST_OUTPUT: usize = 8 * 1024;

/// Keep the tail of long output, where failures are reported.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Implement the approved plan in the tenant workspace.
///
/// Runs the test suite afterwards when the implementer may, and records the
/// resulting diff.
pub struct ImplementationNode {
    runtime: Arc<AgentRuntime>,
    scm: Arc<dyn SourceControl>,
}

impl ImplementationNode {
    /// Create the node.
    #[must_use]
    pub fn new(runtime: Arc<AgentRuntime>, scm: Arc<dyn SourceControl>) -> Self {
        Self { runtime, scm }
    }

    fn prompt(ctx: &ExecutionContext) -> String {
        let mut prompt = String::from(
            "Implement the following approved plan in the repository in the working directory.\n",
        );
        if let Some(ticket) = &ctx.ticket {
            prompt.push_str(&format!("\nTicket {}: {}\n{}\n", ticket.id, ticket.title, ticket.description));
        }
        for artifact in PlanArtifact::ALL {
            if let Some(body) = ctx.state.text(&artifact.state_key()) {
                prompt.push_str(&format!("\n## {}\n{body}\n", artifact.key()));
            }
        }
        if let Some(feedback) = ctx.state.text(REVIEW_FEEDBACK_KEY) {
            prompt.push_str("\n## Code review feedback to address\n");
            prompt.push_str(feedback);
            prompt.push('\n');
        }
        prompt
    }
}

#[async_trait]
impl WorkflowNode for ImplementationNode {
    fn id(&self) -> &str {
        "implement"
    }

    fn node_type(&self) -> &str {
        "agent"
    }

    fn phase(&self) -> Option<TicketStatus> {
        Some(TicketStatus::Implementing)
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StepError> {
        let output = self
            .runtime
            .run_prompt(ctx, IMPLEMENTER, &Self::prompt(ctx), cancel)
            .await?;
        ctx.state.remove(REVIEW_FEEDBACK_KEY);

        let mut state = usage_output(output.tokens());
        state.insert("implementation_summary", output.content);

        let tools = self.runtime.tools_for(ctx, IMPLEMENTER).await?;
        if tools.permits("run_tests") {
            let result = tools.invoke("run_tests", json!({}), cancel).await?;
            tracing::info!(ticket_id = %ctx.ticket_id, passed = result.success, "Test run finished");
            state.insert("tests_passed", result.success);
            state.insert("test_output", tail(&result.content, MAX_TEST_OUTPUT));
        }

        let diff = self
            .scm
            .diff(
                &DiffRequest {
                    workspace: tools.workspace_root().to_path_buf(),
                    base: None,
                },
                cancel,
            )
            .await;
        match diff {
            Ok(diff) => {
                state.insert("implementation_diff", diff);
            }
            Err(e) => tracing::warn!(ticket_id = %ctx.ticket_id, error = %e, "Could not compute diff"),
        }

        Ok(ExecutionResult::completed(state))
    }
}

/// Human code review gate.
///
/// `approved` continues to the pull request; `changes_requested` (or
/// `rejected`) sends the feedback back to implementation.
pub struct CodeReviewGate;

#[async_trait]
impl WorkflowNode for CodeReviewGate {
    fn id(&self) -> &str {
        "code_review"
    }

    fn node_type(&self) -> &str {
        "approval_gate"
    }

    fn phase(&self) -> Option<TicketStatus> {
        Some(TicketStatus::InReview)
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StepError> {
        let decision = ctx
            .state
            .remove(REVIEW_DECISION_KEY)
            .and_then(|v| v.as_text().map(str::to_ascii_lowercase));

        let output = usage_output(Some(0));
        match decision.as_deref() {
            None => {
                tracing::info!(ticket_id = %ctx.ticket_id, "Implementation awaiting review");
                Ok(ExecutionResult::pending(output))
            }
            Some("approved") => Ok(ExecutionResult::completed(output).with_next_step("approved")),
            Some("changes_requested" | "rejected") => {
                Ok(ExecutionResult::completed(output).with_next_step("changes_requested"))
            }
            Some(other) => Err(StepError::Validation(format!(
                "Unknown review decision '{other}'"
            ))),
        }
    }
}

/// Branch, commit and open a pull request for the reviewed change.
///
/// Completed sub-steps are recorded in state so a retry does not repeat them.
pub struct PullRequestNode {
    runtime: Arc<AgentRuntime>,
    scm: Arc<dyn SourceControl>,
    base_branch: String,
}

impl PullRequestNode {
    /// Create the node targeting `base_branch`.
    #[must_use]
    pub fn new(runtime: Arc<AgentRuntime>, scm: Arc<dyn SourceControl>, base_branch: impl Into<String>) -> Self {
        Self {
            runtime,
            scm,
            base_branch: base_branch.into(),
        }
    }
}

#[async_trait]
impl WorkflowNode for PullRequestNode {
    fn id(&self) -> &str {
        "pull_request"
    }

    fn node_type(&self) -> &str {
        "source_control"
    }

    fn phase(&self) -> Option<TicketStatus> {
        Some(TicketStatus::PrCreated)
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StepError> {
        let workspace = self.runtime.config().workspace_root(&ctx.tenant_id);
        let title = ctx
            .ticket
            .as_ref()
            .map_or_else(|| ctx.ticket_id.to_string(), |t| format!("{}: {}", t.id, t.title));

        let branch = format!("forgeline/{}", ctx.ticket_id);
        if ctx.state.text("pr_branch").is_none() {
            self.scm
                .create_branch(
                    &BranchRequest {
                        workspace: workspace.clone(),
                        name: branch.clone(),
                        base: None,
                    },
                    cancel,
                )
                .await?;
            ctx.state.insert("pr_branch", branch.clone());
        }

        if ctx.state.text("commit_sha").is_none() {
            let commit = self
                .scm
                .commit(
                    &CommitRequest {
                        workspace: workspace.clone(),
                        message: title.clone(),
                    },
                    cancel,
                )
                .await?;
            ctx.state.insert("commit_sha", commit.sha);
        }

        let body = ctx
            .state
            .text("implementation_summary")
            .unwrap_or("Automated change.")
            .to_string();
        let pr = self
            .scm
            .open_pull_request(
                &PullRequestRequest {
                    workspace,
                    title,
                    body,
                    head: branch,
                    base: self.base_branch.clone(),
                },
                cancel,
            )
            .await?;

        let mut state = usage_output(Some(0));
        state.insert("pr_url", pr.url);
        if let Some(number) = pr.number.and_then(|n| i64::try_from(n).ok()) {
            state.insert("pr_number", number);
        }
        Ok(ExecutionResult::completed(state))
    }
}

/// Implementation graph ending in `Completed`.
#[must_use]
pub fn implementation_graph(
    runtime: &Arc<AgentRuntime>,
    scm: &Arc<dyn SourceControl>,
    base_branch: &str,
) -> WorkflowGraph {
    WorkflowGraph::new(
        IMPLEMENTATION_WORKFLOW,
        "Implementation",
        "implement",
        TicketStatus::Completed,
    )
    .with_node(Arc::new(ImplementationNode::new(Arc::clone(runtime), Arc::clone(scm))))
    .with_node(Arc::new(CodeReviewGate))
    .with_node(Arc::new(PullRequestNode::new(
        Arc::clone(runtime),
        Arc::clone(scm),
        base_branch,
    )))
    .with_edge("implement", "code_review")
    .with_conditional_edge("code_review", "pull_request", "approved")
    .with_conditional_edge("code_review", "implement", "changes_requested")
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingScm;
    use super::*;
    use crate::middleware::test_support::context;
    use crate::runtime::test_support::{CannedAgent, config_with_root, runtime};
    use forgeline_core::config::{AgentConfig, Config};
    use forgeline_core::types::TenantId;
    use pretty_assertions::assert_eq;

    fn fixture(dir: &std::path::Path, tenant: &TenantId) -> (Arc<AgentRuntime>, Arc<RecordingScm>) {
        let mut config = config_with_root(dir, tenant);
        // No command tools: keep the unit test from spawning a build.
        config.agents.insert(IMPLEMENTER.to_string(), AgentConfig::default());
        let runtime = Arc::new(runtime(config, Arc::new(CannedAgent::always("done"))));
        (runtime, Arc::new(RecordingScm::default()))
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("0123456789", 4), "...6789");
    }

    #[tokio::test]
    async fn test_implementation_records_summary_and_diff() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = TenantId::generate();
        let (runtime, scm) = fixture(dir.path(), &tenant);
        let node = ImplementationNode::new(runtime, scm.clone());

        let mut ctx = context(&tenant);
        ctx.state.insert("plan.requirements", "Export CSV");
        ctx.state.insert(REVIEW_FEEDBACK_KEY, "rename the flag");
        let result = node.execute(&mut ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.output.text("implementation_summary"), Some("done"));
        assert_eq!(result.output.text("implementation_diff"), Some("+added"));
        assert!(!result.output.contains_key("tests_passed"));
        assert!(!ctx.state.contains_key(REVIEW_FEEDBACK_KEY));
        assert_eq!(scm.calls(), vec!["diff".to_string()]);
    }

    #[tokio::test]
    async fn test_code_review_routes() {
        let tenant = TenantId::generate();
        let cancel = CancellationToken::new();
        let mut ctx = context(&tenant);

        let result = CodeReviewGate.execute(&mut ctx, &cancel).await.unwrap();
        assert_eq!(result.status, crate::context::ResultStatus::Pending);

        ctx.state.insert(REVIEW_DECISION_KEY, "changes_requested");
        let result = CodeReviewGate.execute(&mut ctx, &cancel).await.unwrap();
        assert_eq!(result.next_step.as_deref(), Some("changes_requested"));

        ctx.state.insert(REVIEW_DECISION_KEY, "approved");
        let result = CodeReviewGate.execute(&mut ctx, &cancel).await.unwrap();
        assert_eq!(result.next_step.as_deref(), Some("approved"));
    }

    #[tokio::test]
    async fn test_pull_request_retry_skips_done_steps() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = TenantId::generate();
        let (runtime, scm) = fixture(dir.path(), &tenant);
        *scm.fail_pull_request.lock().unwrap() = true;
        let node = PullRequestNode::new(runtime, scm.clone(), "main");

        let mut ctx = context(&tenant);
        let cancel = CancellationToken::new();
        assert!(node.execute(&mut ctx, &cancel).await.is_err());
        let result = node.execute(&mut ctx, &cancel).await.unwrap();

        assert_eq!(result.output.text("pr_url"), Some("https://example.test/pr/7"));
        assert_eq!(result.output.integer("pr_number"), Some(7));
        assert_eq!(
            scm.calls(),
            vec![
                "branch forgeline/T-1".to_string(),
                "commit T-1".to_string(),
                "pr forgeline/T-1 -> main".to_string(),
                "pr forgeline/T-1 -> main".to_string(),
            ]
        );
    }

    #[test]
    fn test_graph_is_valid() {
        let runtime = Arc::new(AgentRuntime::new(Arc::new(Config::default())));
        let scm: Arc<dyn SourceControl> = Arc::new(RecordingScm::default());
        let graph = implementation_graph(&runtime, &scm, "main");
        graph.validate().unwrap();
        assert_eq!(graph.route("code_review", Some("changes_requested")).unwrap().as_deref(), Some("implement"));
        assert_eq!(graph.route("pull_request", None).unwrap(), None);
    }
}
