//! Ticket entity and its lifecycle state machine.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{RepositoryId, TenantId, TicketId};

/// Ticket errors.
#[derive(Error, Debug)]
pub enum TicketError {
    /// Ticket not found.
    #[error("Ticket not found: {0}")]
    NotFound(TicketId),

    /// Transition not permitted by the lifecycle.
    #[error("Illegal ticket transition {from} -> {to}")]
    IllegalTransition {
        /// Current status.
        from: TicketStatus,
        /// Requested status.
        to: TicketStatus,
    },

    /// Storage error.
    #[error("Ticket storage error: {0}")]
    Storage(String),
}

/// Ticket lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Work item received, nothing run yet.
    Triggered,
    /// Analyzing the work item.
    Analyzing,
    /// Generating requirements.
    GeneratingRequirements,
    /// Designing interfaces.
    DesigningInterface,
    /// Designing the data schema.
    DesigningSchema,
    /// Generating test cases.
    GeneratingTestCases,
    /// Planning implementation steps.
    PlanningImplementation,
    /// Plan awaiting human review.
    PlanUnderReview,
    /// Plan approved.
    PlanApproved,
    /// Plan rejected with feedback.
    PlanRejected,
    /// Regenerating affected plan artifacts.
    RevisingPlan,
    /// Implementing the approved plan.
    Implementing,
    /// Implementation awaiting human review.
    InReview,
    /// Pull request opened.
    PrCreated,
    /// Done.
    Completed,
    /// Stopped after a non-retryable failure.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl TicketStatus {
    /// Get string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Analyzing => "analyzing",
            Self::GeneratingRequirements => "generating_requirements",
            Self::DesigningInterface => "designing_interface",
            Self::DesigningSchema => "designing_schema",
            Self::GeneratingTestCases => "generating_test_cases",
            Self::PlanningImplementation => "planning_implementation",
            Self::PlanUnderReview => "plan_under_review",
            Self::PlanApproved => "plan_approved",
            Self::PlanRejected => "plan_rejected",
            Self::RevisingPlan => "revising_plan",
            Self::Implementing => "implementing",
            Self::InReview => "in_review",
            Self::PrCreated => "pr_created",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use TicketStatus as S;

        if *self == next {
            return !self.is_terminal();
        }
        if self.is_terminal() {
            return false;
        }
        if matches!(next, S::Failed | S::Cancelled) {
            return true;
        }

        matches!(
            (*self, next),
            (S::Triggered, S::Analyzing)
                | (S::Analyzing, S::GeneratingRequirements)
                | (S::GeneratingRequirements, S::DesigningInterface)
                | (S::DesigningInterface, S::DesigningSchema)
                | (S::DesigningSchema, S::GeneratingTestCases)
                | (S::GeneratingTestCases, S::PlanningImplementation)
                | (S::PlanningImplementation, S::PlanUnderReview)
                | (S::PlanUnderReview, S::PlanApproved | S::PlanRejected)
                | (S::PlanRejected, S::RevisingPlan)
                | (S::RevisingPlan, S::PlanUnderReview)
                | (S::PlanApproved | S::InReview, S::Implementing)
                | (S::Implementing, S::InReview | S::PrCreated)
                | (S::InReview | S::PrCreated, S::Completed)
                | (S::InReview, S::PrCreated)
        )
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A work item driven through the planning and implementation workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket ID.
    pub id: TicketId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Repository the change targets.
    pub repository_id: RepositoryId,
    /// Short title.
    pub title: String,
    /// Full description.
    pub description: String,
    /// Current lifecycle status.
    pub status: TicketStatus,
    /// Failure reason, if the ticket failed.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Create a new ticket in the `Triggered` state.
    #[must_use]
    pub fn new(
        id: TicketId,
        tenant_id: TenantId,
        repository_id: RepositoryId,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            repository_id,
            title: title.into(),
            description: description.into(),
            status: TicketStatus::Triggered,
            failure_reason: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, enforcing the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::IllegalTransition` if the lifecycle forbids it.
    pub fn transition_to(&mut self, next: TicketStatus) -> Result<(), TicketError> {
        if !self.status.can_transition_to(next) {
            return Err(TicketError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        if self.status != next {
            tracing::debug!(ticket = %self.id, from = %self.status, to = %next, "Ticket transition");
            self.status = next;
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Mark the ticket failed with a reason.
    ///
    /// # Errors
    ///
    /// Returns error if the ticket is already terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TicketError> {
        self.transition_to(TicketStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}

/// Ticket persistence collaborator.
#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// Load a ticket by ID.
    async fn load(&self, id: &TicketId) -> Result<Ticket, TicketError>;

    /// Persist an updated ticket (insert if absent).
    async fn update(&self, ticket: &Ticket) -> Result<(), TicketError>;
}

/// In-memory ticket repository.
#[derive(Default)]
pub struct MemoryTicketRepository {
    tickets: RwLock<HashMap<TicketId, Ticket>>,
}

impl MemoryTicketRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketRepository for MemoryTicketRepository {
    async fn load(&self, id: &TicketId) -> Result<Ticket, TicketError> {
        self.tickets
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TicketError::NotFound(id.clone()))
    }

    async fn update(&self, ticket: &Ticket) -> Result<(), TicketError> {
        self.tickets
            .write()
            .await
            .insert(ticket.id.clone(), ticket.clone());
        Ok(())
    }
}
