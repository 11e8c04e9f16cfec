//! Token budget enforcement.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forgeline_core::budget::BudgetService;
use forgeline_core::config::{AccountingMode, BudgetConfig};
use forgeline_core::types::{TenantId, TicketId};

use super::{Middleware, Next};
use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::StepError;

/// Refuses steps whose estimate exceeds the tenant's remaining budget and
/// deducts consumption afterwards.
///
/// Budget service outages fail open: the step runs and a warning is logged.
pub struct TokenBudgetMiddleware {
    service: Arc<dyn BudgetService>,
    config: BudgetConfig,
}

impl TokenBudgetMiddleware {
    /// Create with a budget service and estimates.
    #[must_use]
    pub fn new(service: Arc<dyn BudgetService>, config: BudgetConfig) -> Self {
        Self { service, config }
    }

    async fn deduct(&self, tenant_id: TenantId, ticket_id: TicketId, step: String, amount: u64) {
        match self.config.accounting_mode {
            AccountingMode::Synchronous => {
                record(self.service.as_ref(), &tenant_id, amount, &step, &ticket_id).await;
            }
            AccountingMode::Background => {
                let service = Arc::clone(&self.service);
                tokio::spawn(async move {
                    record(service.as_ref(), &tenant_id, amount, &step, &ticket_id).await;
                });
            }
        }
    }
}

async fn record(
    service: &dyn BudgetService,
    tenant_id: &TenantId,
    amount: u64,
    step: &str,
    ticket_id: &TicketId,
) {
    if let Err(e) = service.record_usage(tenant_id, amount, step, ticket_id).await {
        tracing::warn!(tenant_id = %tenant_id, step, amount, error = %e, "Failed to record token usage");
    } else {
        tracing::debug!(tenant_id = %tenant_id, step, amount, "Recorded token usage");
    }
}

#[async_trait]
impl Middleware for TokenBudgetMiddleware {
    fn name(&self) -> &'static str {
        "token_budget"
    }

    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<ExecutionResult, StepError> {
        let estimate = self.config.estimate_for(ctx.step());

        match self.service.get_budget(&ctx.tenant_id).await {
            Ok(budget) if budget.remaining() < estimate => {
                tracing::warn!(
                    step = %ctx.step(),
                    tenant_id = %ctx.tenant_id,
                    remaining = budget.remaining(),
                    estimate,
                    "Token budget exhausted"
                );
                return Ok(ExecutionResult::failed(format!(
                    "Token budget exhausted: {} remaining, {} estimated for {}",
                    budget.remaining(),
                    estimate,
                    ctx.step()
                )));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    step = %ctx.step(),
                    tenant_id = %ctx.tenant_id,
                    error = %e,
                    "Budget check unavailable, allowing step"
                );
            }
        }

        let result = next.run(ctx, cancel).await?;

        if result.status != crate::context::ResultStatus::Failed {
            let consumed = result.tokens_used().unwrap_or(estimate);
            self.deduct(
                ctx.tenant_id.clone(),
                ctx.ticket_id.clone(),
                ctx.step().to_string(),
                consumed,
            )
            .await;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::middleware::test_support::{ScriptedStep, completed, context};
    use forgeline_core::budget::{BudgetError, MemoryBudgetService, TokenBudget};
    use forgeline_core::state::StateBag;

    fn sync_config() -> BudgetConfig {
        BudgetConfig {
            default_estimate: 1_000,
            accounting_mode: AccountingMode::Synchronous,
            ..BudgetConfig::default()
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_short_circuits() {
        let tenant = TenantId::generate();
        let service = Arc::new(MemoryBudgetService::new());
        service.set_budget(TokenBudget::monthly(tenant.clone(), 500)).await;

        let pipeline = Pipeline::builder()
            .with(TokenBudgetMiddleware::new(service.clone(), sync_config()))
            .build();
        let step = ScriptedStep::always(completed);
        let mut ctx = context(&tenant);

        let result = pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_failed());
        assert!(!result.retryable);
        assert!(result.error.unwrap().contains("budget"));
        assert_eq!(step.calls(), 0);
        assert!(service.ledger().await.is_empty());
    }

    #[tokio::test]
    async fn test_deducts_reported_tokens() {
        let tenant = TenantId::generate();
        let service = Arc::new(MemoryBudgetService::new());
        service.set_budget(TokenBudget::monthly(tenant.clone(), 10_000)).await;

        let pipeline = Pipeline::builder()
            .with(TokenBudgetMiddleware::new(service.clone(), sync_config()))
            .build();
        let step = ScriptedStep::always(|| {
            let mut output = StateBag::new();
            output.insert("tokens_used", 250_i64);
            Ok(ExecutionResult::completed(output))
        });
        let mut ctx = context(&tenant);

        pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();

        let budget = service.get_budget(&tenant).await.unwrap();
        assert_eq!(budget.used, 250);
        let ledger = service.ledger().await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].step_name, "scripted");
    }

    #[tokio::test]
    async fn test_falls_back_to_estimate() {
        let tenant = TenantId::generate();
        let service = Arc::new(MemoryBudgetService::new());
        service.set_budget(TokenBudget::monthly(tenant.clone(), 10_000)).await;

        let pipeline = Pipeline::builder()
            .with(TokenBudgetMiddleware::new(service.clone(), sync_config()))
            .build();
        let step = ScriptedStep::always(completed);
        let mut ctx = context(&tenant);
        pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(service.get_budget(&tenant).await.unwrap().used, 1_000);
    }

    struct DownService;

    #[async_trait]
    impl BudgetService for DownService {
        async fn get_budget(&self, _tenant_id: &TenantId) -> Result<TokenBudget, BudgetError> {
            Err(BudgetError::Unavailable("connection refused".into()))
        }

        async fn record_usage(
            &self,
            _tenant_id: &TenantId,
            _amount: u64,
            _step_name: &str,
            _ticket_id: &TicketId,
        ) -> Result<(), BudgetError> {
            Err(BudgetError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_service_outage_fails_open() {
        let pipeline = Pipeline::builder()
            .with(TokenBudgetMiddleware::new(Arc::new(DownService), sync_config()))
            .build();
        let step = ScriptedStep::always(completed);
        let mut ctx = context(&TenantId::generate());

        let result = pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_completed());
        assert_eq!(step.calls(), 1);
    }

    #[tokio::test]
    async fn test_background_deduction() {
        let tenant = TenantId::generate();
        let service = Arc::new(MemoryBudgetService::new());
        service.set_budget(TokenBudget::monthly(tenant.clone(), 10_000)).await;

        let config = BudgetConfig {
            accounting_mode: AccountingMode::Background,
            ..sync_config()
        };
        let pipeline = Pipeline::builder()
            .with(TokenBudgetMiddleware::new(service.clone(), config))
            .build();
        let step = ScriptedStep::always(completed);
        let mut ctx = context(&tenant);
        pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();

        for _ in 0..100 {
            if !service.ledger().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(service.get_budget(&tenant).await.unwrap().used, 1_000);
    }
}
