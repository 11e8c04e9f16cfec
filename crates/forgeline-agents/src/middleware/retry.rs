//! Retry with exponential backoff for transient step failures.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use forgeline_core::config::RetryConfig;

use super::{Middleware, Next};
use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::StepError;

/// Backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Add up to 25% random jitter.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Build from configuration.
    #[must_use]
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
        let extra = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Re-invokes the rest of the chain while the outcome is retryable.
///
/// Retries both raised retryable errors and `Failed` results flagged
/// retryable by an inner classification unit. Each retry increments
/// `metadata.retry_count`.
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    /// Create with a policy.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<ExecutionResult, StepError> {
        let mut attempt = 1;
        loop {
            let outcome = next.run(ctx, cancel).await;

            let failure = match &outcome {
                Err(e) if e.is_retryable() => e.to_string(),
                Ok(r) if r.is_failed() && r.retryable => {
                    r.error.clone().unwrap_or_else(|| "retryable failure".to_string())
                }
                _ => return outcome,
            };

            if attempt >= self.policy.max_attempts {
                tracing::warn!(
                    step = %ctx.step(),
                    attempts = attempt,
                    error = %failure,
                    "Retries exhausted"
                );
                return outcome;
            }

            let delay = self.policy.delay_for(attempt);
            ctx.metadata.retry_count += 1;
            ctx.metadata.last_error = Some(failure.clone());
            tracing::info!(
                step = %ctx.step(),
                retry = ctx.metadata.retry_count,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "Retrying step"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StepError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Pipeline;
    use crate::middleware::test_support::{ScriptedStep, completed, context};
    use forgeline_core::types::TenantId;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    fn transient() -> Result<ExecutionResult, StepError> {
        Err(StepError::Transient("overloaded".into()))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(5), Duration::from_secs(1));
        assert_eq!(p.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounded() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..50 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(250), "{d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let pipeline = Pipeline::builder().with(RetryMiddleware::new(policy(3))).build();
        let step = ScriptedStep::new(vec![transient(), transient()], completed);
        let mut ctx = context(&TenantId::generate());

        let result = pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_completed());
        assert_eq!(step.calls(), 3);
        assert_eq!(ctx.metadata.retry_count, 2);
        assert!(ctx.metadata.last_error.unwrap().contains("overloaded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let pipeline = Pipeline::builder().with(RetryMiddleware::new(policy(3))).build();
        let step = ScriptedStep::always(transient);
        let mut ctx = context(&TenantId::generate());

        let result = pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StepError::Transient(_))));
        assert_eq!(step.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_retryable_failed_result() {
        let pipeline = Pipeline::builder().with(RetryMiddleware::new(policy(2))).build();
        let step = ScriptedStep::new(
            vec![Ok(ExecutionResult::retryable_failure("503"))],
            completed,
        );
        let mut ctx = context(&TenantId::generate());

        let result = pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_completed());
        assert_eq!(step.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_runs_once() {
        let pipeline = Pipeline::builder().with(RetryMiddleware::new(policy(5))).build();
        let step = ScriptedStep::always(|| Err(StepError::Validation("bad".into())));
        let mut ctx = context(&TenantId::generate());

        let result = pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StepError::Validation(_))));
        assert_eq!(step.calls(), 1);
        assert_eq!(ctx.metadata.retry_count, 0);

        let step = ScriptedStep::always(|| Ok(ExecutionResult::failed("rejected")));
        let result = pipeline
            .execute(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_failed());
        assert_eq!(step.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let pipeline = Pipeline::builder()
            .with(RetryMiddleware::new(RetryPolicy {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
                ..policy(3)
            }))
            .build();
        let step = ScriptedStep::always(transient);
        let mut ctx = context(&TenantId::generate());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = pipeline.execute(&step, &mut ctx, &cancel).await;
        assert!(matches!(result, Err(StepError::Cancelled)));
        assert_eq!(step.calls(), 1);
    }
}
