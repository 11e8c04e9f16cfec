//! Execution context and result: the envelope every step and middleware
//! unit composes against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use forgeline_core::state::StateBag;
use forgeline_core::ticket::Ticket;
use forgeline_core::types::{ExecutionId, RepositoryId, TenantId, TicketId};

/// Per-invocation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Unique ID of this invocation.
    pub execution_id: ExecutionId,
    /// Node being executed.
    pub step: String,
    /// Ticket phase the node runs in, if any.
    pub phase: Option<String>,
    /// Free-form tags (workflow ID, provider, ...).
    pub tags: BTreeMap<String, String>,
    /// Retries performed so far within this invocation.
    pub retry_count: u32,
    /// Message of the last retried failure.
    pub last_error: Option<String>,
}

impl ExecutionMetadata {
    fn for_step(step: impl Into<String>) -> Self {
        Self {
            execution_id: ExecutionId::generate(),
            step: step.into(),
            phase: None,
            tags: BTreeMap::new(),
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Input envelope for one graph-node invocation.
///
/// Created fresh for every invocation and never shared between concurrent
/// executions.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Tenant the step runs for. Must not change during execution.
    pub tenant_id: TenantId,
    /// Ticket being worked.
    pub ticket_id: TicketId,
    /// Target repository.
    pub repository_id: RepositoryId,
    /// Workflow state carried between steps.
    pub state: StateBag,
    /// The ticket entity, when loaded.
    pub ticket: Option<Ticket>,
    /// Invocation metadata.
    pub metadata: ExecutionMetadata,
}

impl ExecutionContext {
    /// Create a context with empty state.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        ticket_id: TicketId,
        repository_id: RepositoryId,
        step: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            ticket_id,
            repository_id,
            state: StateBag::new(),
            ticket: None,
            metadata: ExecutionMetadata::for_step(step),
        }
    }

    /// Create a context bound to a ticket.
    #[must_use]
    pub fn for_ticket(ticket: &Ticket, step: impl Into<String>, state: StateBag) -> Self {
        Self {
            tenant_id: ticket.tenant_id.clone(),
            ticket_id: ticket.id.clone(),
            repository_id: ticket.repository_id.clone(),
            state,
            ticket: Some(ticket.clone()),
            metadata: ExecutionMetadata::for_step(step),
        }
    }

    /// Replace the state bag.
    #[must_use]
    pub fn with_state(mut self, state: StateBag) -> Self {
        self.state = state;
        self
    }

    /// Set the phase name.
    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.metadata.phase = Some(phase.into());
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.tags.insert(key.into(), value.into());
        self
    }

    /// Name of the step being executed.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.metadata.step
    }
}

/// Outcome class of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// Step finished.
    Completed,
    /// Step failed.
    Failed,
    /// Step awaits external (usually human) input.
    Pending,
}

impl ResultStatus {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }
}

/// Typed outcome of one step invocation. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Outcome class.
    pub status: ResultStatus,
    /// Values to merge into the workflow state.
    pub output: StateBag,
    /// Short human-readable error.
    pub error: Option<String>,
    /// Diagnostic detail for operators.
    pub error_detail: Option<String>,
    /// Whether the retry unit may try again.
    pub retryable: bool,
    /// Next node ID or outgoing edge label; for `Pending`, the step to resume into.
    pub next_step: Option<String>,
}

impl ExecutionResult {
    /// Completed, following the default edge.
    #[must_use]
    pub fn completed(output: StateBag) -> Self {
        Self {
            status: ResultStatus::Completed,
            output,
            error: None,
            error_detail: None,
            retryable: false,
            next_step: None,
        }
    }

    /// Pending, resuming into the same step.
    #[must_use]
    pub fn pending(output: StateBag) -> Self {
        Self {
            status: ResultStatus::Pending,
            output,
            error: None,
            error_detail: None,
            retryable: false,
            next_step: None,
        }
    }

    /// Non-retryable failure.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            output: StateBag::new(),
            error: Some(error.into()),
            error_detail: None,
            retryable: false,
            next_step: None,
        }
    }

    /// Retryable failure.
    #[must_use]
    pub fn retryable_failure(error: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::failed(error)
        }
    }

    /// Route to a node ID or edge label.
    #[must_use]
    pub fn with_next_step(mut self, next: impl Into<String>) -> Self {
        self.next_step = Some(next.into());
        self
    }

    /// Attach diagnostic detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    /// Whether the step completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == ResultStatus::Completed
    }

    /// Whether the step failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == ResultStatus::Failed
    }

    /// Reported token usage, from the `tokens_used` output key.
    #[must_use]
    pub fn tokens_used(&self) -> Option<u64> {
        self.output
            .integer("tokens_used")
            .and_then(|n| u64::try_from(n).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_for_ticket() {
        let ticket = Ticket::new(
            TicketId::new("T-1"),
            TenantId::generate(),
            RepositoryId::new("repo"),
            "Export",
            "CSV export",
        );
        let ctx = ExecutionContext::for_ticket(&ticket, "analyze", StateBag::new())
            .with_phase("analyzing")
            .with_tag("workflow", "planning");

        assert_eq!(ctx.tenant_id, ticket.tenant_id);
        assert_eq!(ctx.step(), "analyze");
        assert_eq!(ctx.metadata.tags["workflow"], "planning");
        assert_eq!(ctx.metadata.retry_count, 0);
    }

    #[test]
    fn test_result_builders() {
        let mut output = StateBag::new();
        output.insert("tokens_used", 320_i64);
        let result = ExecutionResult::completed(output).with_next_step("rejected");
        assert!(result.is_completed());
        assert_eq!(result.tokens_used(), Some(320));
        assert_eq!(result.next_step.as_deref(), Some("rejected"));

        let failed = ExecutionResult::retryable_failure("overloaded").with_detail("503");
        assert!(failed.is_failed());
        assert!(failed.retryable);
        assert_eq!(failed.error_detail.as_deref(), Some("503"));
    }
}
