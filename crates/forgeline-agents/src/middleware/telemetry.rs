//! Per-step tracing spans and in-process step counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{Middleware, Next};
use crate::context::{ExecutionContext, ExecutionResult, ResultStatus};
use crate::error::StepError;

#[derive(Default)]
struct StepStats {
    invocations: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
    errors: AtomicU64,
    total_duration_ms: AtomicU64,
}

/// Point-in-time copy of one step's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepMetricsSnapshot {
    /// Invocations seen.
    pub invocations: u64,
    /// Completed results.
    pub completed: u64,
    /// Failed results.
    pub failed: u64,
    /// Pending results.
    pub pending: u64,
    /// Raised errors.
    pub errors: u64,
    /// Summed wall-clock time.
    pub total_duration_ms: u64,
}

/// Counters keyed by step name.
#[derive(Default)]
pub struct StepMetrics {
    steps: RwLock<HashMap<String, Arc<StepStats>>>,
}

impl StepMetrics {
    /// Create empty metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn stats(&self, step: &str) -> Arc<StepStats> {
        if let Some(stats) = self
            .steps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step)
        {
            return Arc::clone(stats);
        }
        let mut steps = self.steps.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(steps.entry(step.to_string()).or_default())
    }

    fn record(&self, step: &str, outcome: Result<ResultStatus, ()>, duration_ms: u64) {
        let stats = self.stats(step);
        stats.invocations.fetch_add(1, Ordering::Relaxed);
        stats.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        let counter = match outcome {
            Ok(ResultStatus::Completed) => &stats.completed,
            Ok(ResultStatus::Failed) => &stats.failed,
            Ok(ResultStatus::Pending) => &stats.pending,
            Err(()) => &stats.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters for one step, if it has run.
    #[must_use]
    pub fn snapshot(&self, step: &str) -> Option<StepMetricsSnapshot> {
        let steps = self.steps.read().unwrap_or_else(PoisonError::into_inner);
        steps.get(step).map(|s| StepMetricsSnapshot {
            invocations: s.invocations.load(Ordering::Relaxed),
            completed: s.completed.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            pending: s.pending.load(Ordering::Relaxed),
            errors: s.errors.load(Ordering::Relaxed),
            total_duration_ms: s.total_duration_ms.load(Ordering::Relaxed),
        })
    }

    /// Names of every step seen, sorted.
    #[must_use]
    pub fn steps(&self) -> Vec<String> {
        let steps = self.steps.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = steps.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Wraps each step in an `agent_step` span and updates [`StepMetrics`].
pub struct TelemetryMiddleware {
    metrics: Arc<StepMetrics>,
}

impl TelemetryMiddleware {
    /// Create with shared metrics.
    #[must_use]
    pub fn new(metrics: Arc<StepMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Middleware for TelemetryMiddleware {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<ExecutionResult, StepError> {
        let step = ctx.step().to_string();
        let span = tracing::info_span!(
            "agent_step",
            step = %step,
            tenant_id = %ctx.tenant_id,
            ticket_id = %ctx.ticket_id,
            execution_id = %ctx.metadata.execution_id,
            retry_count = ctx.metadata.retry_count,
            status = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        let started = Instant::now();
        let result = next.run(ctx, cancel).instrument(span.clone()).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        span.record("duration_ms", duration_ms);
        match &result {
            Ok(r) => {
                span.record("status", r.status.as_str());
                self.metrics.record(&step, Ok(r.status), duration_ms);
            }
            Err(e) => {
                span.record("status", e.kind());
                span.in_scope(|| {
                    tracing::error!(error = %e, kind = e.kind(), "Step error");
                });
                self.metrics.record(&step, Err(()), duration_ms);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::middleware::test_support::{ScriptedStep, completed, context};
    use forgeline_core::types::TenantId;

    #[tokio::test]
    async fn test_records_outcomes() {
        let metrics = Arc::new(StepMetrics::new());
        let pipeline = Pipeline::builder()
            .with(TelemetryMiddleware::new(metrics.clone()))
            .build();
        let mut ctx = context(&TenantId::generate());
        let cancel = CancellationToken::new();

        let ok = ScriptedStep::always(completed);
        pipeline.execute(&ok, &mut ctx, &cancel).await.unwrap();
        pipeline.execute(&ok, &mut ctx, &cancel).await.unwrap();

        let failing = ScriptedStep::always(|| Err(StepError::Internal("boom".into())));
        let _ = pipeline.execute(&failing, &mut ctx, &cancel).await;

        let snapshot = metrics.snapshot("scripted").unwrap();
        assert_eq!(snapshot.invocations, 3);
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(metrics.steps(), vec!["scripted".to_string()]);
        assert!(metrics.snapshot("missing").is_none());
    }
}
