//! Workflow checkpoints.
//!
//! A checkpoint is the durable snapshot of a suspended workflow run. At most
//! one checkpoint per (ticket, workflow) pair is `Active` at any time; saving
//! a new one supersedes the previous.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::state::StateBag;
use crate::types::{CheckpointId, TenantId, TicketId, WorkflowId};

/// Checkpoint store errors.
#[derive(Error, Debug)]
pub enum CheckpointStoreError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Checkpoint not found.
    #[error("Checkpoint not found: {0}")]
    NotFound(String),
}

/// Checkpoint lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    /// Latest resumable snapshot for its pair.
    Active,
    /// Replaced by a newer snapshot.
    Superseded,
    /// Resumed to a terminal state.
    Consumed,
}

/// A persisted workflow snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint ID.
    pub id: CheckpointId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Ticket the workflow runs for.
    pub ticket_id: TicketId,
    /// Workflow graph.
    pub workflow_id: WorkflowId,
    /// Serialized execution state.
    pub state: String,
    /// Step to resume into.
    pub resume_step: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: CheckpointStatus,
}

impl Checkpoint {
    /// Create a new active checkpoint from a state bag.
    ///
    /// # Errors
    ///
    /// Returns error if the state cannot be serialized.
    pub fn new(
        tenant_id: TenantId,
        ticket_id: TicketId,
        workflow_id: WorkflowId,
        state: &StateBag,
        resume_step: impl Into<String>,
    ) -> Result<Self, CheckpointStoreError> {
        Ok(Self {
            id: CheckpointId::generate(),
            tenant_id,
            ticket_id,
            workflow_id,
            state: state.to_json()?,
            resume_step: resume_step.into(),
            created_at: Utc::now(),
            status: CheckpointStatus::Active,
        })
    }

    /// Deserialize the stored state.
    ///
    /// # Errors
    ///
    /// Returns error if the stored blob is not a valid state bag.
    pub fn restore_state(&self) -> Result<StateBag, CheckpointStoreError> {
        Ok(StateBag::from_json(&self.state)?)
    }

    /// Key of the (ticket, workflow) pair this checkpoint belongs to.
    #[must_use]
    pub fn pair_key(&self) -> String {
        pair_key(&self.ticket_id, &self.workflow_id)
    }
}

/// Storage key for a (ticket, workflow) pair.
#[must_use]
pub fn pair_key(ticket_id: &TicketId, workflow_id: &WorkflowId) -> String {
    format!("{ticket_id}:{workflow_id}")
}

/// Checkpoint persistence collaborator.
///
/// Implementations must be safe under concurrent use from independent
/// workflow runs.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Get a checkpoint by ID.
    async fn get(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointStoreError>;

    /// Get the active checkpoint for a (ticket, workflow) pair.
    async fn latest_active(
        &self,
        ticket_id: &TicketId,
        workflow_id: &WorkflowId,
    ) -> Result<Option<Checkpoint>, CheckpointStoreError>;

    /// Save a new active checkpoint, superseding any prior active one for the pair.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError>;

    /// Mark the active checkpoint for a pair consumed. Returns whether one existed.
    async fn consume(
        &self,
        ticket_id: &TicketId,
        workflow_id: &WorkflowId,
    ) -> Result<bool, CheckpointStoreError>;

    /// List every checkpoint recorded for a ticket, oldest first.
    async fn list_for_ticket(
        &self,
        ticket_id: &TicketId,
    ) -> Result<Vec<Checkpoint>, CheckpointStoreError>;
}

#[derive(Default)]
struct MemoryCheckpoints {
    by_id: HashMap<CheckpointId, Checkpoint>,
    active: HashMap<String, CheckpointId>,
}

/// In-memory checkpoint store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryCheckpoints>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointStoreError> {
        self.inner
            .lock()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| CheckpointStoreError::NotFound(id.to_string()))
    }

    async fn latest_active(
        &self,
        ticket_id: &TicketId,
        workflow_id: &WorkflowId,
    ) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .active
            .get(&pair_key(ticket_id, workflow_id))
            .and_then(|id| inner.by_id.get(id))
            .filter(|c| c.status == CheckpointStatus::Active)
            .cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        let mut inner = self.inner.lock().await;
        let key = checkpoint.pair_key();

        if let Some(previous) = inner.active.get(&key).cloned() {
            if let Some(prev) = inner.by_id.get_mut(&previous) {
                prev.status = CheckpointStatus::Superseded;
            }
        }

        let mut stored = checkpoint.clone();
        stored.status = CheckpointStatus::Active;
        inner.active.insert(key, stored.id.clone());
        inner.by_id.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn consume(
        &self,
        ticket_id: &TicketId,
        workflow_id: &WorkflowId,
    ) -> Result<bool, CheckpointStoreError> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.active.remove(&pair_key(ticket_id, workflow_id)) else {
            return Ok(false);
        };
        if let Some(checkpoint) = inner.by_id.get_mut(&id) {
            checkpoint.status = CheckpointStatus::Consumed;
        }
        Ok(true)
    }

    async fn list_for_ticket(
        &self,
        ticket_id: &TicketId,
    ) -> Result<Vec<Checkpoint>, CheckpointStoreError> {
        let inner = self.inner.lock().await;
        let mut checkpoints: Vec<Checkpoint> = inner
            .by_id
            .values()
            .filter(|c| &c.ticket_id == ticket_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| c.created_at);
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn checkpoint(step: &str) -> Checkpoint {
        let mut state = StateBag::new();
        state.insert("requirements", "R1: export CSV");
        Checkpoint::new(
            TenantId::generate(),
            TicketId::new("T-7"),
            WorkflowId::new("planning"),
            &state,
            step,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let store = MemoryCheckpointStore::new();
        let saved = checkpoint("plan_review");
        store.save(&saved).await.unwrap();

        let loaded = store
            .latest_active(&saved.ticket_id, &saved.workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.resume_step, "plan_review");
        assert_eq!(loaded.restore_state().unwrap(), saved.restore_state().unwrap());
    }

    #[tokio::test]
    async fn test_save_supersedes_previous() {
        let store = MemoryCheckpointStore::new();
        let first = checkpoint("plan_review");
        let second = checkpoint("plan_review");
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        assert_eq!(
            store.get(&first.id).await.unwrap().status,
            CheckpointStatus::Superseded
        );
        let active = store
            .latest_active(&first.ticket_id, &first.workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second.id);

        let actives = store
            .list_for_ticket(&first.ticket_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.status == CheckpointStatus::Active)
            .count();
        assert_eq!(actives, 1);
    }

    #[tokio::test]
    async fn test_consume_clears_active() {
        let store = MemoryCheckpointStore::new();
        let saved = checkpoint("code_review");
        store.save(&saved).await.unwrap();

        assert!(store.consume(&saved.ticket_id, &saved.workflow_id).await.unwrap());
        assert!(
            store
                .latest_active(&saved.ticket_id, &saved.workflow_id)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store.get(&saved.id).await.unwrap().status,
            CheckpointStatus::Consumed
        );
        assert!(!store.consume(&saved.ticket_id, &saved.workflow_id).await.unwrap());
    }
}
