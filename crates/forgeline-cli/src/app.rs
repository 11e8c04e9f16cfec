//! Wiring shared by the workflow commands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::ValueEnum;

use forgeline_agents::workflow::{
    GitCliSourceControl, IMPLEMENTATION_WORKFLOW, PLANNING_WORKFLOW, SourceControl,
    implementation_graph, planning_graph,
};
use forgeline_agents::{AgentRuntime, Pipeline, StepMetrics, WorkflowEngine, WorkflowGraph};
use forgeline_core::budget::{BudgetError, BudgetService, TokenBudget};
use forgeline_core::config::Config;
use forgeline_core::storage::SledStore;
use forgeline_core::tenant::StaticTenantResolver;
use forgeline_core::ticket::Ticket;
use forgeline_core::types::TenantId;

const SCM_TIMEOUT: Duration = Duration::from_secs(300);

/// Workflow selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workflow {
    /// Analysis, plan artifacts and plan review.
    Planning,
    /// Implementation, code review and pull request.
    Implementation,
}

impl Workflow {
    pub const fn id(self) -> &'static str {
        match self {
            Self::Planning => PLANNING_WORKFLOW,
            Self::Implementation => IMPLEMENTATION_WORKFLOW,
        }
    }

    /// Decision value a rejection resumes with.
    pub const fn rejection(self) -> &'static str {
        match self {
            Self::Planning => "rejected",
            Self::Implementation => "changes_requested",
        }
    }
}

/// Loaded configuration, storage and providers.
pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<SledStore>,
    pub runtime: Arc<AgentRuntime>,
    pub metrics: Arc<StepMetrics>,
}

impl App {
    /// Open the state database and register the configured providers.
    pub fn open(config: Config) -> Result<Self> {
        let db_dir = Config::db_dir();
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;
        Self::open_at(config, &db_dir)
    }

    /// Open with the database at `db_dir`.
    pub fn open_at(config: Config, db_dir: &Path) -> Result<Self> {
        let store = SledStore::open(db_dir)
            .with_context(|| format!("Failed to open state database at {}", db_dir.display()))?;
        let config = Arc::new(config);
        let runtime = Arc::new(AgentRuntime::from_config(Arc::clone(&config)));
        Ok(Self {
            config,
            store: Arc::new(store),
            runtime,
            metrics: Arc::new(StepMetrics::new()),
        })
    }

    /// Engine whose pipeline resolves `acting` as the current tenant.
    ///
    /// `acting` is who invoked the command, never the ticket's own tenant,
    /// so the isolation check compares two independent sources.
    pub fn engine(&self, acting: &TenantId) -> WorkflowEngine {
        let pipeline = Pipeline::standard(
            &self.config,
            Arc::new(StaticTenantResolver::new(acting.clone())),
            self.store.clone(),
            Arc::clone(&self.metrics),
        );
        WorkflowEngine::new(pipeline, self.store.clone(), self.store.clone())
    }

    /// Graph for `workflow`.
    pub fn graph(&self, workflow: Workflow, base_branch: &str) -> WorkflowGraph {
        match workflow {
            Workflow::Planning => planning_graph(&self.runtime),
            Workflow::Implementation => {
                let scm: Arc<dyn SourceControl> = Arc::new(GitCliSourceControl::new(SCM_TIMEOUT));
                implementation_graph(&self.runtime, &scm, base_branch)
            }
        }
    }

    /// Make sure the ticket's tenant has a budget for the current period.
    pub async fn ensure_budget(&self, ticket: &Ticket) -> Result<()> {
        let tenant = &ticket.tenant_id;
        let allotment = self
            .config
            .tenant(tenant)
            .and_then(|t| t.token_allotment)
            .unwrap_or(self.config.budget.default_allotment);

        let budget = match self.store.get_budget(tenant).await {
            Ok(budget) if budget.is_current(Utc::now()) => return Ok(()),
            Ok(expired) => {
                tracing::info!(tenant_id = %tenant, used = expired.used, "Budget period ended, starting a new one");
                TokenBudget::monthly(tenant.clone(), expired.total)
            }
            Err(BudgetError::NotFound(_)) => TokenBudget::monthly(tenant.clone(), allotment),
            Err(e) => return Err(e).context("Failed to read token budget"),
        };
        self.store
            .put_budget(&budget)
            .context("Failed to store token budget")?;
        tracing::info!(tenant_id = %tenant, total = budget.total, "Provisioned token budget");
        Ok(())
    }

    /// Log per-step counters collected during this process.
    pub fn log_metrics(&self) {
        for step in self.metrics.steps() {
            if let Some(s) = self.metrics.snapshot(&step) {
                tracing::debug!(
                    step = %step,
                    invocations = s.invocations,
                    completed = s.completed,
                    failed = s.failed,
                    pending = s.pending,
                    errors = s.errors,
                    duration_ms = s.total_duration_ms,
                    "Step metrics"
                );
            }
        }
    }

    /// Flush storage before exit.
    pub fn close(&self) -> Result<()> {
        self.store.flush().context("Failed to flush state database")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_core::config::TenantConfig;
    use forgeline_core::types::{RepositoryId, TicketId};

    fn ticket(tenant: &TenantId) -> Ticket {
        Ticket::new(
            TicketId::new("FL-1"),
            tenant.clone(),
            RepositoryId::new("repo"),
            "Title",
            "Description",
        )
    }

    #[tokio::test]
    async fn test_budget_uses_tenant_allotment() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = TenantId::generate();
        let mut config = Config::default();
        config.tenants.insert(
            tenant.to_string(),
            TenantConfig {
                token_allotment: Some(5_000),
                ..TenantConfig::default()
            },
        );
        let app = App::open_at(config, dir.path()).unwrap();

        app.ensure_budget(&ticket(&tenant)).await.unwrap();
        assert_eq!(app.store.get_budget(&tenant).await.unwrap().total, 5_000);

        // An existing current budget is left alone.
        app.store
            .record_usage(&tenant, 1_000, "analyze", &TicketId::new("FL-1"))
            .await
            .unwrap();
        app.ensure_budget(&ticket(&tenant)).await.unwrap();
        assert_eq!(app.store.get_budget(&tenant).await.unwrap().used, 1_000);
    }

    #[tokio::test]
    async fn test_budget_defaults_to_global_allotment() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = TenantId::generate();
        let app = App::open_at(Config::default(), dir.path()).unwrap();

        app.ensure_budget(&ticket(&tenant)).await.unwrap();
        assert_eq!(
            app.store.get_budget(&tenant).await.unwrap().total,
            app.config.budget.default_allotment
        );
    }

    #[tokio::test]
    async fn test_engine_rejects_ticket_of_another_tenant() {
        use forgeline_agents::RunOutcome;
        use forgeline_core::state::StateBag;
        use forgeline_core::ticket::{TicketRepository, TicketStatus};
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let app = App::open_at(Config::default(), dir.path()).unwrap();
        let owner = TenantId::generate();
        let ticket = ticket(&owner);
        app.store.update(&ticket).await.unwrap();
        app.ensure_budget(&ticket).await.unwrap();

        let intruder = TenantId::generate();
        let outcome = app
            .engine(&intruder)
            .start(
                &ticket.id,
                &app.graph(Workflow::Planning, "main"),
                StateBag::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }), "{outcome:?}");
        assert_eq!(app.metrics.steps().len(), 0);
        assert_eq!(
            app.store.load(&ticket.id).await.unwrap().status,
            TicketStatus::Failed
        );
    }

    #[test]
    fn test_rejection_decisions() {
        assert_eq!(Workflow::Planning.rejection(), "rejected");
        assert_eq!(Workflow::Implementation.rejection(), "changes_requested");
        assert_eq!(Workflow::Implementation.id(), "implementation");
    }
}
