//! Error classification: turns raised errors into typed failed results.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use forgeline_core::config::PipelineConfig;
use forgeline_core::secrets::scrub_common_secrets;

use super::{Middleware, Next};
use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::StepError;

const REDACTED_MESSAGE: &str = "Step failed; details withheld";

/// Converts step errors into `Failed` results carrying a retryable flag.
///
/// Cancellation passes through untouched unless configured otherwise.
/// Panics inside the step are caught and classified as internal errors.
pub struct ErrorHandlingMiddleware {
    propagate_cancellation: bool,
    rethrow_unhandled: bool,
    redact_details: bool,
}

impl ErrorHandlingMiddleware {
    /// Create with explicit flags.
    #[must_use]
    pub const fn new(propagate_cancellation: bool, rethrow_unhandled: bool, redact_details: bool) -> Self {
        Self {
            propagate_cancellation,
            rethrow_unhandled,
            redact_details,
        }
    }

    /// Create from pipeline configuration.
    #[must_use]
    pub const fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.propagate_cancellation,
            config.rethrow_unhandled,
            config.redact_error_details,
        )
    }

    fn to_result(&self, error: &StepError) -> ExecutionResult {
        let message = if self.redact_details {
            REDACTED_MESSAGE.to_string()
        } else {
            scrub_common_secrets(&error.to_string())
        };
        let mut result = if error.is_retryable() {
            ExecutionResult::retryable_failure(message)
        } else {
            ExecutionResult::failed(message)
        };
        if !self.redact_details {
            result = result.with_detail(format!("kind={}", error.kind()));
        }
        result
    }
}

impl Default for ErrorHandlingMiddleware {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "step panicked".to_string())
}

#[async_trait]
impl Middleware for ErrorHandlingMiddleware {
    fn name(&self) -> &'static str {
        "error_handling"
    }

    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<ExecutionResult, StepError> {
        let outcome = AssertUnwindSafe(next.run(ctx, cancel)).catch_unwind().await;
        let error = match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(error)) => error,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(step = %ctx.step(), panic = %message, "Step panicked");
                StepError::Internal(message)
            }
        };

        match error {
            StepError::Cancelled if self.propagate_cancellation => Err(StepError::Cancelled),
            StepError::Internal(_) if self.rethrow_unhandled => Err(error),
            error => {
                if error.is_security_violation() {
                    tracing::warn!(step = %ctx.step(), tenant_id = %ctx.tenant_id, error = %error, "Security violation");
                }
                Ok(self.to_result(&error))
            }
        }
    }
}
