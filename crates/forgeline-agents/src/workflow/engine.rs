//! Checkpointed workflow engine.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use forgeline_core::checkpoint::{Checkpoint, CheckpointStore};
use forgeline_core::state::StateBag;
use forgeline_core::ticket::{Ticket, TicketRepository, TicketStatus};
use forgeline_core::types::{CheckpointId, TicketId};

use super::{WorkflowError, WorkflowGraph};
use crate::context::{ExecutionContext, ResultStatus};
use crate::error::StepError;
use crate::middleware::Pipeline;

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The graph finalized; the ticket moved to the graph's completion status.
    Completed {
        /// Ticket status after finalizing.
        status: TicketStatus,
        /// Final workflow state.
        state: StateBag,
    },
    /// A node returned `Pending`; a checkpoint was persisted.
    Suspended {
        /// Persisted checkpoint.
        checkpoint_id: CheckpointId,
        /// Node the run resumes into.
        resume_step: String,
    },
    /// A node failed; the ticket moved to `Failed`.
    Failed {
        /// Node that failed.
        step: String,
        /// Short message.
        error: String,
        /// Diagnostic detail.
        detail: Option<String>,
    },
}

/// Drives workflow graphs one node at a time through the middleware pipeline.
///
/// Steps within one run execute strictly sequentially. Independent runs may
/// share one engine concurrently.
pub struct WorkflowEngine {
    pipeline: Pipeline,
    checkpoints: Arc<dyn CheckpointStore>,
    tickets: Arc<dyn TicketRepository>,
    max_iterations: usize,
}

impl WorkflowEngine {
    /// Create a new workflow engine.
    #[must_use]
    pub fn new(
        pipeline: Pipeline,
        checkpoints: Arc<dyn CheckpointStore>,
        tickets: Arc<dyn TicketRepository>,
    ) -> Self {
        Self {
            pipeline,
            checkpoints,
            tickets,
            max_iterations: 1000,
        }
    }

    /// Set maximum node executions per run (cycle protection).
    #[must_use]
    pub const fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Run `graph` for a ticket from its start node.
    ///
    /// # Errors
    ///
    /// Returns error if the graph is invalid, the ticket cannot be loaded or
    /// transitioned, a store fails, the run is cancelled, or a node raises
    /// an error the pipeline did not convert.
    pub async fn start(
        &self,
        ticket_id: &TicketId,
        graph: &WorkflowGraph,
        initial: StateBag,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, WorkflowError> {
        graph.validate()?;
        let ticket = self.tickets.load(ticket_id).await?;
        tracing::info!(
            ticket_id = %ticket.id,
            tenant_id = %ticket.tenant_id,
            workflow = %graph.id,
            "Starting workflow"
        );
        self.run(graph, ticket, graph.start_node.clone(), initial, cancel)
            .await
    }

    /// Resume `graph` for a ticket from its active checkpoint.
    ///
    /// `input` is merged over the restored state (e.g. a review decision).
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCheckpoint` if nothing is suspended, and
    /// `SecurityViolation` if the checkpoint's tenant differs from the
    /// ticket's; otherwise as [`WorkflowEngine::start`].
    pub async fn resume(
        &self,
        ticket_id: &TicketId,
        graph: &WorkflowGraph,
        input: StateBag,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, WorkflowError> {
        graph.validate()?;
        let ticket = self.tickets.load(ticket_id).await?;
        let checkpoint = self
            .checkpoints
            .latest_active(ticket_id, &graph.id)
            .await?
            .ok_or_else(|| WorkflowError::NoActiveCheckpoint {
                ticket: ticket_id.to_string(),
                workflow: graph.id.to_string(),
            })?;

        if checkpoint.tenant_id != ticket.tenant_id {
            tracing::error!(
                ticket_id = %ticket.id,
                checkpoint = %checkpoint.id,
                "Checkpoint tenant does not match ticket tenant"
            );
            return Err(WorkflowError::SecurityViolation(format!(
                "checkpoint {} belongs to another tenant",
                checkpoint.id
            )));
        }

        let mut state = checkpoint.restore_state()?;
        state.merge(input);
        tracing::info!(
            ticket_id = %ticket.id,
            tenant_id = %ticket.tenant_id,
            workflow = %graph.id,
            checkpoint = %checkpoint.id,
            resume_step = %checkpoint.resume_step,
            "Resuming workflow"
        );
        self.run(graph, ticket, checkpoint.resume_step, state, cancel)
            .await
    }

    /// Cancel a ticket's run: the ticket moves to `Cancelled` and its active
    /// checkpoint is consumed.
    ///
    /// # Errors
    ///
    /// Returns error if the ticket is already terminal or a store fails.
    pub async fn cancel(
        &self,
        ticket_id: &TicketId,
        graph: &WorkflowGraph,
    ) -> Result<(), WorkflowError> {
        let mut ticket = self.tickets.load(ticket_id).await?;
        ticket.transition_to(TicketStatus::Cancelled)?;
        self.tickets.update(&ticket).await?;
        self.checkpoints.consume(ticket_id, &graph.id).await?;
        tracing::info!(ticket_id = %ticket_id, workflow = %graph.id, "Workflow cancelled");
        Ok(())
    }

    async fn run(
        &self,
        graph: &WorkflowGraph,
        mut ticket: Ticket,
        start: String,
        mut state: StateBag,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, WorkflowError> {
        let mut current = start;

        for _ in 0..self.max_iterations {
            let node = graph
                .find_node(&current)
                .ok_or_else(|| WorkflowError::NodeNotFound(current.clone()))?;

            let mut ctx = ExecutionContext::for_ticket(&ticket, node.id(), state.clone())
                .with_tag("workflow", graph.id.to_string());
            if let Some(phase) = node.phase() {
                ticket.transition_to(phase)?;
                self.tickets.update(&ticket).await?;
                ctx.ticket = Some(ticket.clone());
                ctx = ctx.with_phase(phase.as_str());
            }

            let result = match self.pipeline.execute(node.as_ref(), &mut ctx, cancel).await {
                Ok(result) => result,
                Err(StepError::Cancelled) => {
                    tracing::info!(ticket_id = %ticket.id, step = %current, "Run cancelled");
                    return Err(WorkflowError::Cancelled);
                }
                Err(source) => {
                    self.record_failure(&mut ticket, &source.to_string()).await;
                    return Err(WorkflowError::Step {
                        step: current,
                        source,
                    });
                }
            };

            state = ctx.state;
            state.merge(result.output);

            match result.status {
                ResultStatus::Pending => {
                    let resume_step = result.next_step.unwrap_or_else(|| current.clone());
                    let checkpoint = Checkpoint::new(
                        ticket.tenant_id.clone(),
                        ticket.id.clone(),
                        graph.id.clone(),
                        &state,
                        resume_step.clone(),
                    )?;
                    self.checkpoints.save(&checkpoint).await?;
                    tracing::info!(
                        ticket_id = %ticket.id,
                        workflow = %graph.id,
                        checkpoint = %checkpoint.id,
                        resume_step = %resume_step,
                        "Workflow suspended"
                    );
                    return Ok(RunOutcome::Suspended {
                        checkpoint_id: checkpoint.id,
                        resume_step,
                    });
                }
                ResultStatus::Failed => {
                    let error = result.error.unwrap_or_else(|| "step failed".to_string());
                    self.record_failure(&mut ticket, &error).await;
                    return Ok(RunOutcome::Failed {
                        step: current,
                        error,
                        detail: result.error_detail,
                    });
                }
                ResultStatus::Completed => {
                    match graph.route(&current, result.next_step.as_deref())? {
                        Some(next) => {
                            tracing::debug!(ticket_id = %ticket.id, from = %current, to = %next, "Advancing");
                            current = next;
                        }
                        None => {
                            ticket.transition_to(graph.completion_status)?;
                            self.tickets.update(&ticket).await?;
                            self.checkpoints.consume(&ticket.id, &graph.id).await?;
                            tracing::info!(
                                ticket_id = %ticket.id,
                                workflow = %graph.id,
                                status = %graph.completion_status,
                                "Workflow finished"
                            );
                            return Ok(RunOutcome::Completed {
                                status: graph.completion_status,
                                state,
                            });
                        }
                    }
                }
            }
        }

        self.record_failure(&mut ticket, "workflow exceeded its iteration limit")
            .await;
        Err(WorkflowError::CycleDetected(current))
    }

    async fn record_failure(&self, ticket: &mut Ticket, reason: &str) {
        if let Err(e) = ticket.fail(reason) {
            tracing::warn!(ticket_id = %ticket.id, error = %e, "Could not mark ticket failed");
            return;
        }
        if let Err(e) = self.tickets.update(ticket).await {
            tracing::error!(ticket_id = %ticket.id, error = %e, "Could not persist ticket failure");
        }
        tracing::warn!(ticket_id = %ticket.id, reason, "Ticket failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionResult;
    use crate::workflow::WorkflowNode;
    use async_trait::async_trait;
    use forgeline_core::checkpoint::{CheckpointStatus, MemoryCheckpointStore};
    use forgeline_core::ticket::MemoryTicketRepository;
    use forgeline_core::types::{RepositoryId, TenantId};
    use pretty_assertions::assert_eq;

    /// Appends its id to the `trail` list.
    struct Trail {
        id: &'static str,
        phase: Option<TicketStatus>,
    }

    #[async_trait]
    impl WorkflowNode for Trail {
        fn id(&self) -> &str {
            self.id
        }

        fn node_type(&self) -> &str {
            "trail"
        }

        fn phase(&self) -> Option<TicketStatus> {
            self.phase
        }

        async fn execute(
            &self,
            ctx: &mut ExecutionContext,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionResult, StepError> {
            let mut trail = ctx.state.text_list("trail");
            trail.push(self.id.to_string());
            let mut output = StateBag::new();
            output.insert("trail", trail);
            Ok(ExecutionResult::completed(output))
        }
    }

    /// Suspends until `decision` is present.
    struct Gate;

    #[async_trait]
    impl WorkflowNode for Gate {
        fn id(&self) -> &str {
            "gate"
        }

        fn node_type(&self) -> &str {
            "gate"
        }

        fn phase(&self) -> Option<TicketStatus> {
            Some(TicketStatus::PlanUnderReview)
        }

        async fn execute(
            &self,
            ctx: &mut ExecutionContext,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionResult, StepError> {
            match ctx.state.remove("decision").and_then(|v| v.as_text().map(str::to_string)) {
                None => Ok(ExecutionResult::pending(StateBag::new())),
                Some(d) if d == "fail" => Ok(ExecutionResult::failed("reviewer aborted")),
                Some(_) => Ok(ExecutionResult::completed(StateBag::new())),
            }
        }
    }

    struct Fixture {
        engine: WorkflowEngine,
        checkpoints: Arc<MemoryCheckpointStore>,
        tickets: Arc<MemoryTicketRepository>,
        ticket: Ticket,
    }

    async fn fixture() -> Fixture {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let tickets = Arc::new(MemoryTicketRepository::new());
        let ticket = Ticket::new(
            TicketId::new("T-7"),
            TenantId::generate(),
            RepositoryId::new("repo"),
            "Export",
            "CSV export",
        );
        tickets.update(&ticket).await.unwrap();
        let engine = WorkflowEngine::new(Pipeline::default(), checkpoints.clone(), tickets.clone());
        Fixture {
            engine,
            checkpoints,
            tickets,
            ticket,
        }
    }

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new("planning", "Planning", "analyze", TicketStatus::PlanApproved)
            .with_node(Arc::new(Trail {
                id: "analyze",
                phase: Some(TicketStatus::Analyzing),
            }))
            .with_node(Arc::new(Trail {
                id: "requirements",
                phase: Some(TicketStatus::GeneratingRequirements),
            }))
            .with_node(Arc::new(Gate))
            .with_edge("analyze", "requirements")
            .with_edge("requirements", "gate")
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let f = fixture().await;
        let g = graph();
        let cancel = CancellationToken::new();

        let outcome = f
            .engine
            .start(&f.ticket.id, &g, StateBag::new(), &cancel)
            .await
            .unwrap();
        let RunOutcome::Suspended { checkpoint_id, resume_step } = outcome else {
            panic!("expected suspension, got {outcome:?}");
        };
        assert_eq!(resume_step, "gate");
        assert_eq!(
            f.tickets.load(&f.ticket.id).await.unwrap().status,
            TicketStatus::PlanUnderReview
        );

        let saved = f.checkpoints.get(&checkpoint_id).await.unwrap();
        assert_eq!(
            saved.restore_state().unwrap().text_list("trail"),
            vec!["analyze".to_string(), "requirements".to_string()]
        );

        let mut input = StateBag::new();
        input.insert("decision", "approved");
        let outcome = f.engine.resume(&f.ticket.id, &g, input, &cancel).await.unwrap();
        let RunOutcome::Completed { status, state } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(status, TicketStatus::PlanApproved);
        assert_eq!(state.text_list("trail").len(), 2);
        assert!(state.get("decision").is_none());

        let consumed = f.checkpoints.get(&checkpoint_id).await.unwrap();
        assert_eq!(consumed.status, CheckpointStatus::Consumed);
        assert!(f
            .checkpoints
            .latest_active(&f.ticket.id, &g.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint() {
        let f = fixture().await;
        let result = f
            .engine
            .resume(&f.ticket.id, &graph(), StateBag::new(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(WorkflowError::NoActiveCheckpoint { .. })));
    }

    #[tokio::test]
    async fn test_failure_keeps_checkpoint() {
        let f = fixture().await;
        let g = graph();
        let cancel = CancellationToken::new();
        f.engine
            .start(&f.ticket.id, &g, StateBag::new(), &cancel)
            .await
            .unwrap();

        let mut input = StateBag::new();
        input.insert("decision", "fail");
        let outcome = f.engine.resume(&f.ticket.id, &g, input, &cancel).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { ref step, .. } if step == "gate"));

        let ticket = f.tickets.load(&f.ticket.id).await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Failed);
        assert_eq!(ticket.failure_reason.as_deref(), Some("reviewer aborted"));
        assert!(f
            .checkpoints
            .latest_active(&f.ticket.id, &g.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_foreign_checkpoint_rejected() {
        let f = fixture().await;
        let g = graph();
        let foreign = Checkpoint::new(
            TenantId::generate(),
            f.ticket.id.clone(),
            g.id.clone(),
            &StateBag::new(),
            "gate",
        )
        .unwrap();
        f.checkpoints.save(&foreign).await.unwrap();

        let result = f
            .engine
            .resume(&f.ticket.id, &g, StateBag::new(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(WorkflowError::SecurityViolation(_))));
    }

    #[tokio::test]
    async fn test_cancel() {
        let f = fixture().await;
        let g = graph();
        f.engine
            .start(&f.ticket.id, &g, StateBag::new(), &CancellationToken::new())
            .await
            .unwrap();

        f.engine.cancel(&f.ticket.id, &g).await.unwrap();
        assert_eq!(
            f.tickets.load(&f.ticket.id).await.unwrap().status,
            TicketStatus::Cancelled
        );
        assert!(f
            .checkpoints
            .latest_active(&f.ticket.id, &g.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancellation_token_stops_run() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = f.engine.start(&f.ticket.id, &graph(), StateBag::new(), &cancel).await;
        assert!(matches!(result, Err(WorkflowError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cycle_protection() {
        let f = fixture().await;
        let g = WorkflowGraph::new("loop", "Loop", "a", TicketStatus::Completed)
            .with_node(Arc::new(Trail { id: "a", phase: None }))
            .with_node(Arc::new(Trail { id: "b", phase: None }))
            .with_edge("a", "b")
            .with_edge("b", "a");
        let engine = WorkflowEngine::new(Pipeline::default(), f.checkpoints.clone(), f.tickets.clone())
            .with_max_iterations(10);

        let result = engine
            .start(&f.ticket.id, &g, StateBag::new(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(WorkflowError::CycleDetected(_))));
        assert_eq!(
            f.tickets.load(&f.ticket.id).await.unwrap().status,
            TicketStatus::Failed
        );
    }
}
