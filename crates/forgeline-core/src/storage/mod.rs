//! Durable storage backed by sled.
//!
//! One database holds every collaborator the orchestrator persists:
//! checkpoints (plus an index of the active checkpoint per pair), tickets,
//! tenant budgets and the usage ledger. Suspended workflows survive a
//! process restart through this store: every write is flushed to disk
//! before it returns.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use uuid::Uuid;

use crate::budget::{BudgetError, BudgetService, TokenBudget, UsageRecord};
use crate::checkpoint::{
    Checkpoint, CheckpointStatus, CheckpointStore, CheckpointStoreError, pair_key,
};
use crate::ticket::{Ticket, TicketError, TicketRepository};
use crate::types::{CheckpointId, TenantId, TicketId, WorkflowId};

/// Sled-backed store for checkpoints, tickets and budgets.
pub struct SledStore {
    db: sled::Db,
    checkpoints: sled::Tree,
    active: sled::Tree,
    tickets: sled::Tree,
    budgets: sled::Tree,
    usage: sled::Tree,
}

impl SledStore {
    /// Open or create a store.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, CheckpointStoreError> {
        let db = sled::open(path)?;
        let checkpoints = db.open_tree("checkpoints")?;
        let active = db.open_tree("active_checkpoints")?;
        let tickets = db.open_tree("tickets")?;
        let budgets = db.open_tree("budgets")?;
        let usage = db.open_tree("usage")?;

        Ok(Self {
            db,
            checkpoints,
            active,
            tickets,
            budgets,
            usage,
        })
    }

    /// Install or replace a tenant's budget.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub fn put_budget(&self, budget: &TokenBudget) -> Result<(), BudgetError> {
        let data = serde_json::to_vec(budget).map_err(|e| BudgetError::Storage(e.to_string()))?;
        self.budgets
            .insert(budget.tenant_id.as_ref().as_bytes(), data)
            .map_err(|e| BudgetError::Storage(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| BudgetError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Usage records for a tenant, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if storage read fails.
    pub fn usage_for(&self, tenant_id: &TenantId) -> Result<Vec<UsageRecord>, BudgetError> {
        let prefix = format!("{tenant_id}:");
        let mut records = Vec::new();
        for result in self.usage.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result.map_err(|e| BudgetError::Storage(e.to_string()))?;
            let record: UsageRecord =
                serde_json::from_slice(&value).map_err(|e| BudgetError::Storage(e.to_string()))?;
            records.push(record);
        }
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    /// Flush all pending writes to disk.
    ///
    /// # Errors
    ///
    /// Returns error if flush fails.
    pub fn flush(&self) -> Result<(), CheckpointStoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn decode_checkpoint(raw: &[u8]) -> Result<Checkpoint, CheckpointStoreError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

fn transaction_error(err: TransactionError<serde_json::Error>) -> CheckpointStoreError {
    match err {
        TransactionError::Abort(e) => CheckpointStoreError::Serialization(e),
        TransactionError::Storage(e) => CheckpointStoreError::Storage(e),
    }
}

#[async_trait]
impl CheckpointStore for SledStore {
    async fn get(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointStoreError> {
        match self.checkpoints.get(id.as_ref().as_bytes())? {
            Some(data) => Self::decode_checkpoint(&data),
            None => Err(CheckpointStoreError::NotFound(id.to_string())),
        }
    }

    async fn latest_active(
        &self,
        ticket_id: &TicketId,
        workflow_id: &WorkflowId,
    ) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        let key = pair_key(ticket_id, workflow_id);
        let Some(id) = self.active.get(key.as_bytes())? else {
            return Ok(None);
        };
        let Some(data) = self.checkpoints.get(&id)? else {
            return Ok(None);
        };
        let checkpoint = Self::decode_checkpoint(&data)?;
        Ok((checkpoint.status == CheckpointStatus::Active).then_some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointStoreError> {
        let mut stored = checkpoint.clone();
        stored.status = CheckpointStatus::Active;
        let data = serde_json::to_vec(&stored)?;
        let pair = stored.pair_key();
        let id = stored.id.0.clone();

        (&self.checkpoints, &self.active)
            .transaction(|(checkpoints, active)| {
                if let Some(previous_id) = active.get(pair.as_bytes())? {
                    if let Some(raw) = checkpoints.get(&previous_id)? {
                        let mut previous: Checkpoint = serde_json::from_slice(&raw)
                            .map_err(ConflictableTransactionError::Abort)?;
                        previous.status = CheckpointStatus::Superseded;
                        let encoded = serde_json::to_vec(&previous)
                            .map_err(ConflictableTransactionError::Abort)?;
                        checkpoints.insert(previous_id, encoded)?;
                    }
                }
                checkpoints.insert(id.as_bytes(), data.clone())?;
                active.insert(pair.as_bytes(), id.as_bytes())?;
                Ok(())
            })
            .map_err(transaction_error)?;
        self.db.flush_async().await?;

        tracing::debug!(checkpoint = %stored.id, pair = %pair, "Checkpoint saved");
        Ok(())
    }

    async fn consume(
        &self,
        ticket_id: &TicketId,
        workflow_id: &WorkflowId,
    ) -> Result<bool, CheckpointStoreError> {
        let pair = pair_key(ticket_id, workflow_id);

        let consumed = (&self.checkpoints, &self.active)
            .transaction(|(checkpoints, active)| {
                let Some(id) = active.remove(pair.as_bytes())? else {
                    return Ok(false);
                };
                if let Some(raw) = checkpoints.get(&id)? {
                    let mut checkpoint: Checkpoint = serde_json::from_slice(&raw)
                        .map_err(ConflictableTransactionError::Abort)?;
                    checkpoint.status = CheckpointStatus::Consumed;
                    let encoded = serde_json::to_vec(&checkpoint)
                        .map_err(ConflictableTransactionError::Abort)?;
                    checkpoints.insert(id, encoded)?;
                }
                Ok(true)
            })
            .map_err(transaction_error)?;
        if consumed {
            self.db.flush_async().await?;
        }
        Ok(consumed)
    }

    async fn list_for_ticket(
        &self,
        ticket_id: &TicketId,
    ) -> Result<Vec<Checkpoint>, CheckpointStoreError> {
        let mut found = Vec::new();
        for result in &self.checkpoints {
            let (_, value) = result?;
            let checkpoint = Self::decode_checkpoint(&value)?;
            if &checkpoint.ticket_id == ticket_id {
                found.push(checkpoint);
            }
        }
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }
}

#[async_trait]
impl TicketRepository for SledStore {
    async fn load(&self, id: &TicketId) -> Result<Ticket, TicketError> {
        let data = self
            .tickets
            .get(id.as_ref().as_bytes())
            .map_err(|e| TicketError::Storage(e.to_string()))?
            .ok_or_else(|| TicketError::NotFound(id.clone()))?;
        serde_json::from_slice(&data).map_err(|e| TicketError::Storage(e.to_string()))
    }

    async fn update(&self, ticket: &Ticket) -> Result<(), TicketError> {
        let data = serde_json::to_vec(ticket).map_err(|e| TicketError::Storage(e.to_string()))?;
        self.tickets
            .insert(ticket.id.as_ref().as_bytes(), data)
            .map_err(|e| TicketError::Storage(e.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| TicketError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BudgetService for SledStore {
    async fn get_budget(&self, tenant_id: &TenantId) -> Result<TokenBudget, BudgetError> {
        let data = self
            .budgets
            .get(tenant_id.as_ref().as_bytes())
            .map_err(|e| BudgetError::Storage(e.to_string()))?
            .ok_or_else(|| BudgetError::NotFound(tenant_id.clone()))?;
        serde_json::from_slice(&data).map_err(|e| BudgetError::Storage(e.to_string()))
    }

    async fn record_usage(
        &self,
        tenant_id: &TenantId,
        amount: u64,
        step_name: &str,
        ticket_id: &TicketId,
    ) -> Result<(), BudgetError> {
        let record = UsageRecord {
            tenant_id: tenant_id.clone(),
            amount,
            step_name: step_name.to_string(),
            ticket_id: ticket_id.clone(),
            recorded_at: Utc::now(),
        };
        let record_data =
            serde_json::to_vec(&record).map_err(|e| BudgetError::Storage(e.to_string()))?;
        let record_key = format!(
            "{tenant_id}:{}:{}",
            record.recorded_at.timestamp_micros(),
            Uuid::new_v4()
        );
        let tenant_key = tenant_id.as_ref().as_bytes();

        let outcome = (&self.budgets, &self.usage).transaction(|(budgets, usage)| {
            let Some(raw) = budgets.get(tenant_key)? else {
                return Ok(false);
            };
            let mut budget: TokenBudget =
                serde_json::from_slice(&raw).map_err(ConflictableTransactionError::Abort)?;
            budget.used = budget.used.saturating_add(amount);
            let encoded =
                serde_json::to_vec(&budget).map_err(ConflictableTransactionError::Abort)?;
            budgets.insert(tenant_key, encoded)?;
            usage.insert(record_key.as_bytes(), record_data.clone())?;
            Ok(true)
        });

        match outcome {
            Ok(true) => {
                self.db
                    .flush_async()
                    .await
                    .map_err(|e| BudgetError::Storage(e.to_string()))?;
                Ok(())
            }
            Ok(false) => Err(BudgetError::NotFound(tenant_id.clone())),
            Err(e) => Err(BudgetError::Storage(transaction_error(e).to_string())),
        }
    }
}
