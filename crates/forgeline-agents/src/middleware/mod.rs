//! Middleware pipeline around every agent step.
//!
//! Units are an explicit ordered list. The first registered unit is the
//! outermost: it sees the context first and the result last. Each unit
//! receives a [`Next`] continuation for the rest of the chain and decides
//! whether, and how often, to call it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use forgeline_core::budget::BudgetService;
use forgeline_core::config::Config;
use forgeline_core::tenant::TenantResolver;

use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::StepError;
use crate::workflow::WorkflowNode;

mod budget;
mod error_handling;
mod logging;
mod retry;
mod telemetry;
mod tenant;

pub use budget::TokenBudgetMiddleware;
pub use error_handling::ErrorHandlingMiddleware;
pub use logging::LoggingMiddleware;
pub use retry::{RetryMiddleware, RetryPolicy};
pub use telemetry::{StepMetrics, StepMetricsSnapshot, TelemetryMiddleware};
pub use tenant::TenantIsolationMiddleware;

/// A cross-cutting wrapper around step execution.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Unit name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Handle one invocation, calling `next` to continue down the chain.
    async fn handle(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
        next: Next<'_>,
    ) -> Result<ExecutionResult, StepError>;
}

/// The remainder of the pipeline, ending in the step itself.
///
/// `Copy`, so a unit may run the continuation more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    step: &'a dyn WorkflowNode,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain.
    pub fn run<'b>(
        self,
        ctx: &'b mut ExecutionContext,
        cancel: &'b CancellationToken,
    ) -> BoxFuture<'b, Result<ExecutionResult, StepError>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((head, rest)) => {
                    let next = Next {
                        middlewares: rest,
                        step: self.step,
                    };
                    head.handle(ctx, cancel, next).await
                }
                None => {
                    if cancel.is_cancelled() {
                        return Err(StepError::Cancelled);
                    }
                    self.step.execute(ctx, cancel).await
                }
            }
        })
    }
}

/// A composed chain of middleware units.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Start building a pipeline.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The standard chain, outermost first: logging, error classification,
    /// retry, tenant isolation, token budget, telemetry.
    #[must_use]
    pub fn standard(
        config: &Config,
        tenants: Arc<dyn TenantResolver>,
        budgets: Arc<dyn BudgetService>,
        metrics: Arc<StepMetrics>,
    ) -> Self {
        Self::builder()
            .with(LoggingMiddleware::new(config.pipeline.slow_call_threshold()))
            .with(ErrorHandlingMiddleware::from_config(&config.pipeline))
            .with(RetryMiddleware::new(RetryPolicy::from_config(&config.retry)))
            .with(TenantIsolationMiddleware::new(tenants))
            .with(TokenBudgetMiddleware::new(budgets, config.budget.clone()))
            .with(TelemetryMiddleware::new(metrics))
            .build()
    }

    /// Execute `step` through every unit.
    ///
    /// # Errors
    ///
    /// Returns whatever error the outermost unit lets escape: cancellation
    /// by default, and unclassified errors when configured to re-raise.
    pub async fn execute(
        &self,
        step: &dyn WorkflowNode,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, StepError> {
        Next {
            middlewares: &self.middlewares,
            step,
        }
        .run(ctx, cancel)
        .await
    }

    /// Unit names, outermost first.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Whether the pipeline has no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    /// Append a unit inside every unit registered so far.
    #[must_use]
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Append a shared unit.
    #[must_use]
    pub fn with_shared(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            middlewares: self.middlewares,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted steps shared by the middleware tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use forgeline_core::types::{RepositoryId, TenantId, TicketId};

    use crate::context::{ExecutionContext, ExecutionResult};
    use crate::error::StepError;
    use crate::workflow::WorkflowNode;

    /// Step that replays scripted outcomes, repeating the last one.
    pub struct ScriptedStep {
        outcomes: Mutex<VecDeque<Result<ExecutionResult, StepError>>>,
        last: fn() -> Result<ExecutionResult, StepError>,
        pub calls: AtomicUsize,
    }

    impl ScriptedStep {
        pub fn new(
            outcomes: Vec<Result<ExecutionResult, StepError>>,
            last: fn() -> Result<ExecutionResult, StepError>,
        ) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                last,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn always(last: fn() -> Result<ExecutionResult, StepError>) -> Self {
            Self::new(Vec::new(), last)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkflowNode for ScriptedStep {
        fn id(&self) -> &str {
            "scripted"
        }

        fn node_type(&self) -> &str {
            "test"
        }

        async fn execute(
            &self,
            _ctx: &mut ExecutionContext,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionResult, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.outcomes.lock().unwrap().pop_front();
            next.unwrap_or_else(|| (self.last)())
        }
    }

    pub fn completed() -> Result<ExecutionResult, StepError> {
        Ok(ExecutionResult::completed(forgeline_core::state::StateBag::new()))
    }

    pub fn context(tenant: &TenantId) -> ExecutionContext {
        ExecutionContext::new(
            tenant.clone(),
            TicketId::new("T-1"),
            RepositoryId::new("repo"),
            "scripted",
        )
    }
}
