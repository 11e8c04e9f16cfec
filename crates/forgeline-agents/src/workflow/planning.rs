//! Planning workflow: analysis, plan artifacts, human review, revision.
//!
//! ```text
//! analyze -> requirements -> interface_design -> schema -> test_cases
//!   -> implementation_steps -> plan_review --approved--> (PlanApproved)
//!                                   ^    \--rejected--> feedback_analysis
//!                                   |                          |
//!                                   +------- revise_plan <-----+
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use forgeline_core::state::StateBag;
use forgeline_core::ticket::TicketStatus;
use forgeline_core::validation::{limits, validate_message_content};

use super::{WorkflowGraph, WorkflowNode};
use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::StepError;
use crate::runtime::AgentRuntime;

/// State key holding the ticket analysis.
pub const ANALYSIS_KEY: &str = "analysis";
/// State key a resume sets to `approved` or `rejected`.
pub const REVIEW_DECISION_KEY: &str = "review_decision";
/// State key holding reviewer feedback on rejection.
pub const REVIEW_FEEDBACK_KEY: &str = "review_feedback";
/// State key listing the artifacts the feedback affects.
pub const AFFECTED_KEY: &str = "affected_artifacts";
/// State key set when affected-artifact detection fell back to all artifacts.
pub const FALLBACK_KEY: &str = "feedback_fallback";
/// State key counting completed revisions.
pub const REVISION_COUNT_KEY: &str = "revision_count";
/// Output key the budget unit reads.
pub const TOKENS_USED_KEY: &str = "tokens_used";

const ANALYST: &str = "analyst";
const PLANNER: &str = "planner";

/// Planning workflow ID.
pub const PLANNING_WORKFLOW: &str = "planning";

/// One named part of an implementation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanArtifact {
    /// Functional and non-functional requirements.
    Requirements,
    /// Public interfaces and contracts.
    InterfaceDesign,
    /// Data model and storage changes.
    Schema,
    /// Test cases.
    TestCases,
    /// Ordered implementation steps.
    ImplementationSteps,
}

impl PlanArtifact {
    /// Every artifact, in generation order.
    pub const ALL: [Self; 5] = [
        Self::Requirements,
        Self::InterfaceDesign,
        Self::Schema,
        Self::TestCases,
        Self::ImplementationSteps,
    ];

    /// Stable key, also the node ID.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::InterfaceDesign => "interface_design",
            Self::Schema => "schema",
            Self::TestCases => "test_cases",
            Self::ImplementationSteps => "implementation_steps",
        }
    }

    /// State key holding the artifact body.
    #[must_use]
    pub fn state_key(self) -> String {
        format!("plan.{}", self.key())
    }

    /// Ticket status while the artifact is generated.
    #[must_use]
    pub const fn phase(self) -> TicketStatus {
        match self {
            Self::Requirements => TicketStatus::GeneratingRequirements,
            Self::InterfaceDesign => TicketStatus::DesigningInterface,
            Self::Schema => TicketStatus::DesigningSchema,
            Self::TestCases => TicketStatus::GeneratingTestCases,
            Self::ImplementationSteps => TicketStatus::PlanningImplementation,
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Requirements => "Requirements",
            Self::InterfaceDesign => "Interface design",
            Self::Schema => "Schema",
            Self::TestCases => "Test cases",
            Self::ImplementationSteps => "Implementation steps",
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            Self::Requirements => {
                "List the functional and non-functional requirements, each testable, with acceptance criteria."
            }
            Self::InterfaceDesign => {
                "Describe every public interface to add or change: signatures, inputs, outputs, errors."
            }
            Self::Schema => {
                "Describe data model and storage changes, including migrations. Say so if none are needed."
            }
            Self::TestCases => {
                "List test cases covering the requirements, including edge cases and failure paths."
            }
            Self::ImplementationSteps => {
                "Give ordered implementation steps naming the files to touch and the change in each."
            }
        }
    }

    /// Parse a label the way a model tends to write it.
    ///
    /// Case, spaces and hyphens are ignored; a few common synonyms are
    /// accepted.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        match normalized.as_str() {
            "requirements" | "requirement" => Some(Self::Requirements),
            "interface_design" | "interface" | "interfaces" | "api" | "api_design" => {
                Some(Self::InterfaceDesign)
            }
            "schema" | "database" | "data_model" | "database_schema" => Some(Self::Schema),
            "test_cases" | "tests" | "test_plan" => Some(Self::TestCases),
            "implementation_steps" | "implementation" | "implementation_plan" | "steps" => {
                Some(Self::ImplementationSteps)
            }
            _ => None,
        }
    }
}

fn ticket_summary(ctx: &ExecutionContext) -> String {
    ctx.ticket.as_ref().map_or_else(
        || format!("Ticket {}", ctx.ticket_id),
        |t| format!("Ticket {}: {}\n\n{}", t.id, t.title, t.description),
    )
}

pub(super) fn usage_output(tokens: Option<u64>) -> StateBag {
    let mut output = StateBag::new();
    if let Some(tokens) = tokens {
        output.insert(TOKENS_USED_KEY, i64::try_from(tokens).unwrap_or(i64::MAX));
    }
    output
}

fn add_tokens(total: &mut Option<u64>, more: Option<u64>) {
    if let Some(more) = more {
        *total = Some(total.unwrap_or(0) + more);
    }
}

/// Analyze the ticket against the repository.
pub struct AnalyzeTicketNode {
    runtime: Arc<AgentRuntime>,
}

impl AnalyzeTicketNode {
    /// Create the node.
    #[must_use]
    pub const fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    /// Declared dependencies, when the analyst may map them.
    async fn dependency_overview(&self, ctx: &ExecutionContext, cancel: &CancellationToken) -> Option<String> {
        let tools = match self.runtime.tools_for(ctx, ANALYST).await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::debug!(error = %e, "No tools for analysis");
                return None;
            }
        };
        if !tools.permits("dependency_map") {
            return None;
        }
        match tools.invoke("dependency_map", json!({}), cancel).await {
            Ok(result) if result.success => Some(result.content),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Dependency map unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl WorkflowNode for AnalyzeTicketNode {
    fn id(&self) -> &str {
        "analyze"
    }

    fn node_type(&self) -> &str {
        "agent"
    }

    fn phase(&self) -> Option<TicketStatus> {
        Some(TicketStatus::Analyzing)
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StepError> {
        let mut prompt = format!(
            "Analyze this ticket against the repository in the working directory. \
             Identify the affected components, risks and open questions.\n\n{}",
            ticket_summary(ctx)
        );
        if let Some(dependencies) = self.dependency_overview(ctx, cancel).await {
            prompt.push_str("\n\nDeclared dependencies:\n");
            prompt.push_str(&dependencies);
        }

        let output = self.runtime.run_prompt(ctx, ANALYST, &prompt, cancel).await?;
        let mut state = usage_output(output.tokens());
        state.insert(ANALYSIS_KEY, output.content);
        Ok(ExecutionResult::completed(state))
    }
}

fn artifact_prompt(
    artifact: PlanArtifact,
    ctx: &ExecutionContext,
    feedback: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Write the \"{}\" section of an implementation plan. {}\n\n{}",
        artifact.title(),
        artifact.instructions(),
        ticket_summary(ctx)
    );
    if let Some(analysis) = ctx.state.text(ANALYSIS_KEY) {
        prompt.push_str("\n\n## Analysis\n");
        prompt.push_str(analysis);
    }
    for other in PlanArtifact::ALL {
        if other == artifact {
            continue;
        }
        if let Some(body) = ctx.state.text(&other.state_key()) {
            prompt.push_str(&format!("\n\n## {}\n{body}", other.title()));
        }
    }
    if let Some(feedback) = feedback {
        if let Some(previous) = ctx.state.text(&artifact.state_key()) {
            prompt.push_str(&format!("\n\n## Previous {}\n{previous}", artifact.title()));
        }
        prompt.push_str("\n\n## Reviewer feedback\n");
        prompt.push_str(feedback);
        prompt.push_str("\n\nRevise the section to address the feedback.");
    }
    prompt
}

/// Generate one plan artifact.
pub struct PlanArtifactNode {
    artifact: PlanArtifact,
    runtime: Arc<AgentRuntime>,
}

impl PlanArtifactNode {
    /// Create the node for `artifact`.
    #[must_use]
    pub const fn new(artifact: PlanArtifact, runtime: Arc<AgentRuntime>) -> Self {
        Self { artifact, runtime }
    }
}

#[async_trait]
impl WorkflowNode for PlanArtifactNode {
    fn id(&self) -> &str {
        self.artifact.key()
    }

    fn node_type(&self) -> &str {
        "plan_artifact"
    }

    fn phase(&self) -> Option<TicketStatus> {
        Some(self.artifact.phase())
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StepError> {
        let prompt = artifact_prompt(self.artifact, ctx, None);
        let output = self.runtime.run_prompt(ctx, PLANNER, &prompt, cancel).await?;
        let mut state = usage_output(output.tokens());
        state.insert(self.artifact.state_key(), output.content);
        Ok(ExecutionResult::completed(state))
    }
}

/// Human approval gate for the plan.
///
/// Suspends until a resume supplies `review_decision`. The decision is
/// consumed so a later visit suspends again.
pub struct PlanReviewGate;

#[async_trait]
impl WorkflowNode for PlanReviewGate {
    fn id(&self) -> &str {
        "plan_review"
    }

    fn node_type(&self) -> &str {
        "approval_gate"
    }

    fn phase(&self) -> Option<TicketStatus> {
        Some(TicketStatus::PlanUnderReview)
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

        // Gates consume no model tokens.
        let output = usage_output(Some(0));
        match decision.as_deref() {
            None => {
                tracing::info!(ticket_id = %ctx.ticket_id, "Plan awaiting review");
                Ok(ExecutionResult::pending(output))
            }
            Some("approved") => Ok(ExecutionResult::completed(output)),
            Some("rejected") => Ok(ExecutionResult::completed(output).with_next_step("rejected")),
            Some(other) => Err(StepError::Validation(format!(
                "Unknown review decision '{other}'"
            ))),
        }
    }
}

/// Find the artifacts named in a model reply.
///
/// Tries a JSON array of strings at every `[` in `reply` and takes the first
/// one naming a known artifact, so citations such as `[1]` or nested
/// arrays ahead of the answer are skipped. Returns `None` when no array
/// names a known artifact.
#[must_use]
pub fn classify_affected(reply: &str) -> Option<Vec<PlanArtifact>> {
    reply
        .match_indices('[')
        .filter_map(|(start, _)| {
            serde_json::Deserializer::from_str(&reply[start..])
                .into_iter::<Vec<String>>()
                .next()?
                .ok()
        })
        .find_map(|labels| {
            let mut affected: Vec<PlanArtifact> = labels
                .iter()
                .filter_map(|label| PlanArtifact::from_label(label))
                .collect();
            affected.sort_unstable();
            affected.dedup();
            (!affected.is_empty()).then_some(affected)
        })
}

fn artifact_keys(artifacts: &[PlanArtifact]) -> Vec<String> {
    artifacts.iter().map(|a| a.key().to_string()).collect()
}

/// Work out which artifacts the reviewer's feedback affects.
///
/// Falls back to every artifact, with `feedback_fallback` set, when the
/// classification cannot be parsed or names nothing.
pub struct FeedbackAnalysisNode {
    runtime: Arc<AgentRuntime>,
}

impl FeedbackAnalysisNode {
    /// Create the node.
    #[must_use]
    pub const fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl WorkflowNode for FeedbackAnalysisNode {
    fn id(&self) -> &str {
        "feedback_analysis"
    }

    fn node_type(&self) -> &str {
        "agent"
    }

    fn phase(&self) -> Option<TicketStatus> {
        Some(TicketStatus::PlanRejected)
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StepError> {
        let raw = ctx.state.text(REVIEW_FEEDBACK_KEY).unwrap_or_default();
        let feedback = validate_message_content(raw, limits::MAX_MESSAGE_LENGTH)
            .map_err(|e| StepError::Validation(format!("review feedback rejected: {e}")))?;

        let mut tokens = None;
        let classified = if feedback.trim().is_empty() {
            None
        } else {
            let keys = artifact_keys(&PlanArtifact::ALL).join(", ");
            let prompt = format!(
                "A reviewer rejected an implementation plan with this feedback:\n\n{feedback}\n\n\
                 Which plan sections must change? Answer with a JSON array using only these \
                 names: {keys}. Example: [\"requirements\", \"test_cases\"]"
            );
            let output = self.runtime.run_prompt(ctx, PLANNER, &prompt, cancel).await?;
            add_tokens(&mut tokens, output.tokens());
            classify_affected(&output.content)
        };

        let fallback = classified.is_none();
        let affected = classified.unwrap_or_else(|| PlanArtifact::ALL.to_vec());
        if fallback {
            tracing::warn!(
                ticket_id = %ctx.ticket_id,
                "Feedback classification failed; regenerating every artifact"
            );
        } else {
            tracing::info!(ticket_id = %ctx.ticket_id, affected = ?artifact_keys(&affected), "Feedback classified");
        }

        let mut state = usage_output(tokens);
        state.insert(REVIEW_FEEDBACK_KEY, feedback);
        state.insert(AFFECTED_KEY, artifact_keys(&affected));
        state.insert(FALLBACK_KEY, fallback);
        Ok(ExecutionResult::completed(state))
    }
}

/// Regenerate the affected artifacts, then return to review.
pub struct PlanRevisionNode {
    runtime: Arc<AgentRuntime>,
}

impl PlanRevisionNode {
    /// Create the node.
    #[must_use]
    pub const fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl WorkflowNode for PlanRevisionNode {
    fn id(&self) -> &str {
        "revise_plan"
    }

    fn node_type(&self) -> &str {
        "agent"
    }

    fn phase(&self) -> Option<TicketStatus> {
        Some(TicketStatus::RevisingPlan)
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StepError> {
        let affected: Vec<PlanArtifact> = {
            let listed = ctx.state.text_list(AFFECTED_KEY);
            let parsed: Vec<PlanArtifact> = listed
                .iter()
                .filter_map(|k| PlanArtifact::from_label(k))
                .collect();
            if parsed.is_empty() {
                PlanArtifact::ALL.to_vec()
            } else {
                parsed
            }
        };
        let feedback = ctx
            .state
            .text(REVIEW_FEEDBACK_KEY)
            .unwrap_or_default()
            .to_string();

        let mut tokens = None;
        for artifact in PlanArtifact::ALL {
            if !affected.contains(&artifact) {
                continue;
            }
            let prompt = artifact_prompt(artifact, ctx, Some(&feedback));
            let output = self.runtime.run_prompt(ctx, PLANNER, &prompt, cancel).await?;
            add_tokens(&mut tokens, output.tokens());
            // Later artifacts see the revised version.
            ctx.state.insert(artifact.state_key(), output.content);
        }

        ctx.state.remove(REVIEW_FEEDBACK_KEY);
        let revisions = ctx.state.integer(REVISION_COUNT_KEY).unwrap_or(0) + 1;
        tracing::info!(ticket_id = %ctx.ticket_id, revision = revisions, "Plan revised");

        let mut state = usage_output(tokens);
        state.insert(REVISION_COUNT_KEY, revisions);
        Ok(ExecutionResult::completed(state))
    }
}

/// Planning graph ending in `PlanApproved`.
#[must_use]
pub fn planning_graph(runtime: &Arc<AgentRuntime>) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new(PLANNING_WORKFLOW, "Planning", "analyze", TicketStatus::PlanApproved)
        .with_node(Arc::new(AnalyzeTicketNode::new(Arc::clone(runtime))));

    let mut previous = "analyze";
    for artifact in PlanArtifact::ALL {
        graph = graph
            .with_node(Arc::new(PlanArtifactNode::new(artifact, Arc::clone(runtime))))
            .with_edge(previous, artifact.key());
        previous = artifact.key();
    }

    graph
        .with_node(Arc::new(PlanReviewGate))
        .with_node(Arc::new(FeedbackAnalysisNode::new(Arc::clone(runtime))))
        .with_node(Arc::new(PlanRevisionNode::new(Arc::clone(runtime))))
        .with_edge(previous, "plan_review")
        .with_conditional_edge("plan_review", "feedback_analysis", "rejected")
        .with_edge("feedback_analysis", "revise_plan")
        .with_edge("revise_plan", "plan_review")
}
