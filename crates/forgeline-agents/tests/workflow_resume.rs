//! Planning runs suspended at review and resumed from a persistent store.

mod common;

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use common::{ScriptedAgent, TOKENS_PER_REPLY};
use forgeline_agents::workflow::{
    AFFECTED_KEY, FALLBACK_KEY, PlanArtifact, REVIEW_DECISION_KEY, REVIEW_FEEDBACK_KEY,
    REVISION_COUNT_KEY, planning_graph,
};
use forgeline_agents::{RunOutcome, StepMetrics, WorkflowEngine};
use forgeline_core::budget::{BudgetService, TokenBudget};
use forgeline_core::checkpoint::{CheckpointStatus, CheckpointStore};
use forgeline_core::config::Config;
use forgeline_core::state::StateBag;
use forgeline_core::storage::SledStore;
use forgeline_core::ticket::{Ticket, TicketRepository, TicketStatus};
use forgeline_core::types::{RepositoryId, TenantId, TicketId};

struct Harness {
    store: Arc<SledStore>,
    engine: WorkflowEngine,
    agent: Arc<ScriptedAgent>,
    runtime: Arc<forgeline_agents::AgentRuntime>,
}

fn harness(db: &Path, config: &Arc<Config>, tenant: &TenantId, reply: &str) -> Harness {
    let store = Arc::new(SledStore::open(db).unwrap());
    let agent = Arc::new(ScriptedAgent::new(reply));
    let runtime = common::runtime(Arc::clone(config), Arc::clone(&agent));
    let pipeline = common::pipeline(config, tenant, store.clone(), Arc::new(StepMetrics::new()));
    let engine = WorkflowEngine::new(pipeline, store.clone(), store.clone());
    Harness {
        store,
        engine,
        agent,
        runtime,
    }
}

fn ticket(tenant: &TenantId) -> Ticket {
    Ticket::new(
        TicketId::new("FL-42"),
        tenant.clone(),
        RepositoryId::new("billing"),
        "Add CSV export",
        "Users want to export invoices as CSV from the billing page.",
    )
}

fn decision(value: &str, feedback: Option<&str>) -> StateBag {
    let mut input = StateBag::new();
    input.insert(REVIEW_DECISION_KEY, value);
    if let Some(feedback) = feedback {
        input.insert(REVIEW_FEEDBACK_KEY, feedback);
    }
    input
}

/// Start planning on a fresh store and return the checkpoint it suspends at.
async fn start_until_review(db: &Path, config: &Arc<Config>, tenant: &TenantId, ticket: &Ticket) -> String {
    let h = harness(db, config, tenant, "Export invoices through a streaming CSV writer.");
    h.store
        .put_budget(&TokenBudget::monthly(tenant.clone(), 1_000_000))
        .unwrap();
    h.store.update(ticket).await.unwrap();

    let outcome = h
        .engine
        .start(&ticket.id, &planning_graph(&h.runtime), StateBag::new(), &CancellationToken::new())
        .await
        .unwrap();
    let RunOutcome::Suspended { checkpoint_id, resume_step } = outcome else {
        panic!("expected suspension, got {outcome:?}");
    };
    assert_eq!(resume_step, "plan_review");
    // Analysis plus one call per artifact.
    assert_eq!(h.agent.calls(), 1 + PlanArtifact::ALL.len());
    checkpoint_id.to_string()
}

#[tokio::test]
async fn test_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db");
    let tenant = TenantId::generate();
    let config = Arc::new(common::config(&dir.path().join("workspace"), &tenant));
    let ticket = ticket(&tenant);

    let suspended_at = start_until_review(&db, &config, &tenant, &ticket).await;

    // Everything from the first run has been dropped; reopen the store.
    let h = harness(&db, &config, &tenant, "unused");
    assert_eq!(
        h.store.load(&ticket.id).await.unwrap().status,
        TicketStatus::PlanUnderReview
    );
    let graph = planning_graph(&h.runtime);
    let active = h
        .store
        .latest_active(&ticket.id, &graph.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.id.to_string(), suspended_at);
    assert_eq!(active.tenant_id, tenant);

    let outcome = h
        .engine
        .resume(&ticket.id, &graph, decision("approved", None), &CancellationToken::new())
        .await
        .unwrap();
    let RunOutcome::Completed { status, state } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(status, TicketStatus::PlanApproved);
    for artifact in PlanArtifact::ALL {
        assert_eq!(
            state.text(&artifact.state_key()),
            Some("Export invoices through a streaming CSV writer.")
        );
    }
    assert!(state.get(REVIEW_DECISION_KEY).is_none());
    assert_eq!(h.agent.calls(), 0);

    assert_eq!(
        h.store.load(&ticket.id).await.unwrap().status,
        TicketStatus::PlanApproved
    );
    assert_eq!(h.store.get(&active.id).await.unwrap().status, CheckpointStatus::Consumed);
    assert!(h.store.latest_active(&ticket.id, &graph.id).await.unwrap().is_none());

    // Review gates are free; only model calls were charged.
    let charged: u64 = h.store.usage_for(&tenant).unwrap().iter().map(|r| r.amount).sum();
    assert_eq!(charged, (1 + PlanArtifact::ALL.len() as u64) * TOKENS_PER_REPLY);
    assert_eq!(h.store.get_budget(&tenant).await.unwrap().used, charged);
}

#[tokio::test]
async fn test_rejection_with_unclassifiable_feedback_revises_everything() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db");
    let tenant = TenantId::generate();
    let config = Arc::new(common::config(&dir.path().join("workspace"), &tenant));
    let ticket = ticket(&tenant);

    let first = start_until_review(&db, &config, &tenant, &ticket).await;

    // The model answers without a section list.
    let h = harness(&db, &config, &tenant, "Hard to say, it all looks off.");
    let graph = planning_graph(&h.runtime);
    let outcome = h
        .engine
        .resume(
            &ticket.id,
            &graph,
            decision("rejected", Some("The plan ignores invoices with credit notes.")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let RunOutcome::Suspended { checkpoint_id, resume_step } = outcome else {
        panic!("expected a second review, got {outcome:?}");
    };
    assert_eq!(resume_step, "plan_review");
    assert_ne!(checkpoint_id.to_string(), first);

    // Classification, then every artifact regenerated.
    assert_eq!(h.agent.calls(), 1 + PlanArtifact::ALL.len());
    assert!(h.agent.prompts()[0].contains("credit notes"));

    let state = h
        .store
        .get(&checkpoint_id)
        .await
        .unwrap()
        .restore_state()
        .unwrap();
    assert_eq!(state.flag(FALLBACK_KEY), Some(true));
    assert_eq!(
        state.text_list(AFFECTED_KEY),
        PlanArtifact::ALL.iter().map(|a| a.key().to_string()).collect::<Vec<_>>()
    );
    assert_eq!(state.integer(REVISION_COUNT_KEY), Some(1));
    assert!(state.get(REVIEW_FEEDBACK_KEY).is_none());
    assert_eq!(
        state.text(&PlanArtifact::Schema.state_key()),
        Some("Hard to say, it all looks off.")
    );

    let statuses: Vec<CheckpointStatus> = h
        .store
        .list_for_ticket(&ticket.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.status)
        .collect();
    assert_eq!(statuses, vec![CheckpointStatus::Superseded, CheckpointStatus::Active]);
    assert_eq!(
        h.store.load(&ticket.id).await.unwrap().status,
        TicketStatus::PlanUnderReview
    );
}

#[tokio::test]
async fn test_exhausted_budget_fails_before_any_model_call() {
    let dir = tempfile::tempdir().unwrap();
    let tenant = TenantId::generate();
    let config = Arc::new(common::config(&dir.path().join("workspace"), &tenant));
    let ticket = ticket(&tenant);

    let h = harness(&dir.path().join("db"), &config, &tenant, "never used");
    h.store
        .put_budget(&TokenBudget::monthly(tenant.clone(), 0))
        .unwrap();
    h.store.update(&ticket).await.unwrap();

    let graph = planning_graph(&h.runtime);
    let outcome = h
        .engine
        .start(&ticket.id, &graph, StateBag::new(), &CancellationToken::new())
        .await
        .unwrap();
    let RunOutcome::Failed { step, error, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(step, "analyze");
    assert!(error.contains("budget"), "unexpected error: {error}");
    assert_eq!(h.agent.calls(), 0);

    let stored = h.store.load(&ticket.id).await.unwrap();
    assert_eq!(stored.status, TicketStatus::Failed);
    assert!(h.store.latest_active(&ticket.id, &graph.id).await.unwrap().is_none());
    assert!(h.store.usage_for(&tenant).unwrap().is_empty());
}
