//! Tenant isolation checks around every step.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use forgeline_core::tenant::TenantResolver;

use super::{Middleware, Next};
use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::StepError;

/// Verifies the context's tenant against the ambient tenant before the step
/// runs, and that the step left it unchanged afterwards.
///
/// Any mismatch is a security violation; on a pre-check failure the step is
/// never invoked.
pub struct TenantIsolationMiddleware {
    resolver: Arc<dyn TenantResolver>,
}

impl TenantIsolationMiddleware {
    /// Create with the ambient tenant resolver.
    #[must_use]
    pub fn new(resolver: Arc<dyn TenantResolver>) -> Self {
        Self { resolver }
    }

    async fn verify(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        let requested = ctx
            .tenant_id
            .validate()
            .map_err(|e| StepError::SecurityViolation(format!("invalid tenant: {e}")))?;

        let ambient = self
            .resolver
            .current_tenant()
            .await
            .map_err(|e| StepError::SecurityViolation(format!("tenant resolution failed: {e}")))?;
        let ambient_id = ambient
            .validate()
            .map_err(|e| StepError::SecurityViolation(format!("invalid ambient tenant: {e}")))?;

        if requested != ambient_id {
            return Err(StepError::SecurityViolation(format!(
                "context tenant {} does not match ambient tenant {}",
                ctx.tenant_id, ambient
            )));
        }

        if let Some(ticket) = &ctx.ticket {
            if ticket.tenant_id.validate().ok() != Some(requested) {
                return Err(StepError::SecurityViolation(format!(
                    "ticket {} belongs to another tenant",
                    ticket.id
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Middleware for TenantIsolationMiddleware {
    fn name(&self) -> &'static str {
        "tenant_isolation"
    }

    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<ExecutionResult, StepError> {
        if let Err(e) = self.verify(ctx).await {
            tracing::warn!(step = %ctx.step(), tenant_id = %ctx.tenant_id, error = %e, "Tenant check failed");
            return Err(e);
        }

        let before = ctx.tenant_id.clone();
        let result = next.run(ctx, cancel).await;

        if ctx.tenant_id != before {
            tracing::error!(
                step = %ctx.step(),
                before = %before,
                after = %ctx.tenant_id,
                "Step changed tenant"
            );
            return Err(StepError::SecurityViolation(
                "tenant changed during step execution".to_string(),
            ));
        }
        result
    }
}
