//! Step entry/exit logging.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Middleware, Next};
use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::StepError;

/// Logs every step's start, outcome, and duration, and warns on slow steps.
pub struct LoggingMiddleware {
    slow_threshold: Duration,
}

impl LoggingMiddleware {
    /// Create with the given slow-step threshold.
    #[must_use]
    pub const fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }
}

/// Logs the exit line when dropped, so abandoned futures are still reported.
struct ExitLog<'a> {
    step: &'a str,
    started: Instant,
    threshold: Duration,
    outcome: Option<&'static str>,
}

impl Drop for ExitLog<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match self.outcome {
            Some(outcome) => {
                tracing::info!(step = %self.step, outcome, duration_ms, "Step finished");
            }
            None => tracing::warn!(step = %self.step, duration_ms, "Step abandoned"),
        }
        if elapsed > self.threshold {
            tracing::warn!(
                step = %self.step,
                duration_ms,
                threshold_ms = u64::try_from(self.threshold.as_millis()).unwrap_or(u64::MAX),
                "Slow step"
            );
        }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<ExecutionResult, StepError> {
        let step = ctx.step().to_string();
        tracing::info!(
            step = %step,
            tenant_id = %ctx.tenant_id,
            ticket_id = %ctx.ticket_id,
            execution_id = %ctx.metadata.execution_id,
            "Step started"
        );

        let mut exit = ExitLog {
            step: &step,
            started: Instant::now(),
            threshold: self.slow_threshold,
            outcome: None,
        };

        let result = next.run(ctx, cancel).await;
        match &result {
            Ok(r) => {
                exit.outcome = Some(r.status.as_str());
                if r.is_failed() {
                    tracing::warn!(step = %step, error = ?r.error, "Step reported failure");
                }
                tracing::debug!(step = %step, keys = ?r.output.keys().collect::<Vec<_>>(), "Step output");
            }
            Err(e) => {
                exit.outcome = Some(e.kind());
                tracing::error!(step = %step, error = %e, "Step raised error");
            }
        }
        drop(exit);
        result
    }
}
