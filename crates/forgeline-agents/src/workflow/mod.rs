//! Checkpointed workflow graphs.
//!
//! A workflow is a directed graph of named nodes. The engine runs one node
//! at a time through the middleware pipeline and, when a node returns
//! `Pending`, persists a checkpoint and suspends until resumed.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use forgeline_core::checkpoint::CheckpointStoreError;
use forgeline_core::ticket::{TicketError, TicketStatus};

use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::StepError;

mod engine;
mod graph;
mod implementation;
mod planning;
mod scm;

pub use engine::{RunOutcome, WorkflowEngine};
pub use graph::{FINALIZE, WorkflowEdge, WorkflowGraph};
pub use implementation::{
    CodeReviewGate, IMPLEMENTATION_WORKFLOW, ImplementationNode, PullRequestNode,
    implementation_graph,
};
pub use planning::{
    AFFECTED_KEY, ANALYSIS_KEY, AnalyzeTicketNode, FALLBACK_KEY, FeedbackAnalysisNode,
    PLANNING_WORKFLOW, PlanArtifact, PlanArtifactNode, PlanReviewGate, PlanRevisionNode,
    REVIEW_DECISION_KEY, REVIEW_FEEDBACK_KEY, REVISION_COUNT_KEY, TOKENS_USED_KEY,
    classify_affected, planning_graph,
};
pub use scm::{
    BranchRequest, CommitRequest, CommitResponse, DiffRequest, GitCliSourceControl,
    PullRequestRequest, PullRequestResponse, ScmError, SourceControl,
};

/// Workflow execution errors.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Invalid workflow configuration.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Cycle detected in workflow.
    #[error("Cycle detected at node: {0}")]
    CycleDetected(String),

    /// Nothing to resume.
    #[error("No active checkpoint for ticket {ticket} in workflow {workflow}")]
    NoActiveCheckpoint {
        /// Ticket ID.
        ticket: String,
        /// Workflow ID.
        workflow: String,
    },

    /// Checkpoint belongs to a different tenant than the ticket.
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// A node raised an error the pipeline did not convert.
    #[error("Step {step} failed: {source}")]
    Step {
        /// Node ID.
        step: String,
        /// Underlying error.
        #[source]
        source: StepError,
    },

    /// Run cancelled.
    #[error("Workflow cancelled")]
    Cancelled,

    /// Ticket error.
    #[error(transparent)]
    Ticket(#[from] TicketError),

    /// Checkpoint store error.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointStoreError),
}

/// A named step in a workflow graph.
#[async_trait]
pub trait WorkflowNode: Send + Sync {
    /// Node identifier, unique within its graph.
    fn id(&self) -> &str;

    /// Node type name.
    fn node_type(&self) -> &str;

    /// Ticket status the engine moves to before running this node.
    fn phase(&self) -> Option<TicketStatus> {
        None
    }

    /// Execute the node.
    ///
    /// Outputs are returned in the result and merged into workflow state by
    /// the engine; nodes may also edit `ctx.state` directly.
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StepError>;
}
