//! Per-tenant token budgets.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{TenantId, TicketId};

/// Budget service errors.
#[derive(Error, Debug)]
pub enum BudgetError {
    /// No budget configured for the tenant.
    #[error("No budget for tenant {0}")]
    NotFound(TenantId),

    /// Storage error.
    #[error("Budget storage error: {0}")]
    Storage(String),

    /// Service unavailable.
    #[error("Budget service unavailable: {0}")]
    Unavailable(String),
}

/// A tenant's consumption quota for one billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Tenant the budget belongs to.
    pub tenant_id: TenantId,
    /// Total allotment for the period.
    pub total: u64,
    /// Tokens consumed so far.
    pub used: u64,
    /// Billing period start.
    pub period_start: DateTime<Utc>,
    /// Billing period end.
    pub period_end: DateTime<Utc>,
}

impl TokenBudget {
    /// Create a fresh budget for a 30-day period starting now.
    #[must_use]
    pub fn monthly(tenant_id: TenantId, total: u64) -> Self {
        let period_start = Utc::now();
        Self {
            tenant_id,
            total,
            used: 0,
            period_start,
            period_end: period_start + Duration::days(30),
        }
    }

    /// Tokens left in the period.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Whether `now` falls within the billing period.
    #[must_use]
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        now >= self.period_start && now < self.period_end
    }
}

/// A single usage record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Tenant charged.
    pub tenant_id: TenantId,
    /// Tokens consumed.
    pub amount: u64,
    /// Step that consumed them.
    pub step_name: String,
    /// Ticket the step ran for.
    pub ticket_id: TicketId,
    /// When the usage was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Token budget collaborator.
#[async_trait]
pub trait BudgetService: Send + Sync {
    /// Get the tenant's current budget.
    async fn get_budget(&self, tenant_id: &TenantId) -> Result<TokenBudget, BudgetError>;

    /// Record consumed tokens against the tenant's budget.
    async fn record_usage(
        &self,
        tenant_id: &TenantId,
        amount: u64,
        step_name: &str,
        ticket_id: &TicketId,
    ) -> Result<(), BudgetError>;
}

/// In-memory budget service with a usage ledger.
#[derive(Default)]
pub struct MemoryBudgetService {
    budgets: RwLock<HashMap<TenantId, TokenBudget>>,
    ledger: RwLock<Vec<UsageRecord>>,
}

impl MemoryBudgetService {
    /// Create an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a tenant's budget.
    pub async fn set_budget(&self, budget: TokenBudget) {
        self.budgets
            .write()
            .await
            .insert(budget.tenant_id.clone(), budget);
    }

    /// All usage records, oldest first.
    pub async fn ledger(&self) -> Vec<UsageRecord> {
        self.ledger.read().await.clone()
    }
}

#[async_trait]
impl BudgetService for MemoryBudgetService {
    async fn get_budget(&self, tenant_id: &TenantId) -> Result<TokenBudget, BudgetError> {
        self.budgets
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| BudgetError::NotFound(tenant_id.clone()))
    }

    async fn record_usage(
        &self,
        tenant_id: &TenantId,
        amount: u64,
        step_name: &str,
        ticket_id: &TicketId,
    ) -> Result<(), BudgetError> {
        {
            let mut budgets = self.budgets.write().await;
            let budget = budgets
                .get_mut(tenant_id)
                .ok_or_else(|| BudgetError::NotFound(tenant_id.clone()))?;
            budget.used = budget.used.saturating_add(amount);
        }

        self.ledger.write().await.push(UsageRecord {
            tenant_id: tenant_id.clone(),
            amount,
            step_name: step_name.to_string(),
            ticket_id: ticket_id.clone(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_saturates() {
        let mut budget = TokenBudget::monthly(TenantId::generate(), 100);
        budget.used = 150;
        assert_eq!(budget.remaining(), 0);
        assert!(budget.is_current(Utc::now()));
    }

    #[tokio::test]
    async fn test_record_usage_updates_budget_and_ledger() {
        let service = MemoryBudgetService::new();
        let tenant = TenantId::generate();
        service.set_budget(TokenBudget::monthly(tenant.clone(), 1_000)).await;

        service
            .record_usage(&tenant, 250, "analyze", &TicketId::new("T-1"))
            .await
            .unwrap();

        let budget = service.get_budget(&tenant).await.unwrap();
        assert_eq!(budget.used, 250);
        assert_eq!(budget.remaining(), 750);

        let ledger = service.ledger().await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].step_name, "analyze");
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        let service = MemoryBudgetService::new();
        let result = service.get_budget(&TenantId::generate()).await;
        assert!(matches!(result, Err(BudgetError::NotFound(_))));
    }
}
