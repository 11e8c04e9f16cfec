//! Start, resume, review and cancel workflow runs.

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use forgeline_agents::workflow::{REVIEW_DECISION_KEY, REVIEW_FEEDBACK_KEY};
use forgeline_agents::{RunOutcome, WorkflowError};
use forgeline_core::state::StateBag;
use forgeline_core::ticket::{Ticket, TicketError, TicketRepository, TicketStatus};
use forgeline_core::types::{RepositoryId, TenantId, TicketId};

use crate::app::{App, Workflow};
use crate::ui;

/// Ticket details for `start`; needed only when the ticket is new.
#[derive(Debug, Clone, Default)]
pub struct NewTicket {
    pub repository: Option<String>,
    pub title: Option<String>,
    pub description: String,
}

/// Which run a command targets.
#[derive(Debug, Clone)]
pub struct RunTarget {
    pub ticket: String,
    pub workflow: Workflow,
    pub base_branch: String,
}

/// Start `target.workflow` for a ticket, creating it for `acting` if needed.
pub async fn run_start(
    app: &App,
    acting: &TenantId,
    target: &RunTarget,
    details: NewTicket,
) -> Result<()> {
    let ticket = load_or_create(app, acting, &target.ticket, details).await?;
    app.ensure_budget(&ticket).await?;

    let engine = app.engine(acting);
    let graph = app.graph(target.workflow, &target.base_branch);
    let cancel = cancel_on_ctrl_c();

    ui::info(&format!("Starting {} for ticket {}", target.workflow.id(), ticket.id));
    let outcome = engine
        .start(&ticket.id, &graph, StateBag::new(), &cancel)
        .await;
    report(app, target, outcome)
}

/// Resume a suspended run with `input` merged into its state.
pub async fn run_resume(
    app: &App,
    acting: &TenantId,
    target: &RunTarget,
    input: StateBag,
) -> Result<()> {
    let ticket = load_owned(app, acting, &target.ticket).await?;
    app.ensure_budget(&ticket).await?;

    let engine = app.engine(acting);
    let graph = app.graph(target.workflow, &target.base_branch);
    let cancel = cancel_on_ctrl_c();

    ui::info(&format!("Resuming {} for ticket {}", target.workflow.id(), ticket.id));
    let outcome = engine.resume(&ticket.id, &graph, input, &cancel).await;
    report(app, target, outcome)
}

/// Approve the pending review.
pub async fn run_approve(app: &App, acting: &TenantId, target: &RunTarget) -> Result<()> {
    run_resume(app, acting, target, decision("approved", None)).await
}

/// Reject the pending review with feedback.
pub async fn run_reject(
    app: &App,
    acting: &TenantId,
    target: &RunTarget,
    feedback: &str,
) -> Result<()> {
    if feedback.trim().is_empty() {
        ui::warning("No feedback given; every plan section will be revised");
    }
    run_resume(
        app,
        acting,
        target,
        decision(target.workflow.rejection(), Some(feedback)),
    )
    .await
}

/// Cancel the ticket's run.
pub async fn run_cancel(app: &App, acting: &TenantId, target: &RunTarget) -> Result<()> {
    let ticket = load_owned(app, acting, &target.ticket).await?;
    let graph = app.graph(target.workflow, &target.base_branch);
    app.engine(acting)
        .cancel(&ticket.id, &graph)
        .await
        .context("Failed to cancel")?;
    ui::success(&format!("Ticket {} cancelled", ticket.id));
    Ok(())
}

/// Load a ticket that `acting` owns.
pub async fn load_owned(app: &App, acting: &TenantId, id: &str) -> Result<Ticket> {
    let ticket_id = TicketId::new(id);
    let ticket = app
        .store
        .load(&ticket_id)
        .await
        .with_context(|| format!("Unknown ticket {ticket_id}"))?;
    ensure_owner(&ticket, acting)?;
    Ok(ticket)
}

fn ensure_owner(ticket: &Ticket, acting: &TenantId) -> Result<()> {
    if &ticket.tenant_id != acting {
        tracing::warn!(ticket_id = %ticket.id, tenant_id = %acting, "Ticket belongs to another tenant");
        bail!("Ticket {} belongs to another tenant", ticket.id);
    }
    Ok(())
}

/// Parse `KEY=VALUE` assignments into a state bag of text values.
pub fn parse_assignments(assignments: &[String]) -> Result<StateBag> {
    let mut state = StateBag::new();
    for assignment in assignments {
        let Some((key, value)) = assignment.split_once('=') else {
            bail!("Invalid assignment '{assignment}', expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid assignment '{assignment}', key is empty");
        }
        state.insert(key, value);
    }
    Ok(state)
}

fn decision(value: &str, feedback: Option<&str>) -> StateBag {
    let mut input = StateBag::new();
    input.insert(REVIEW_DECISION_KEY, value);
    if let Some(feedback) = feedback {
        input.insert(REVIEW_FEEDBACK_KEY, feedback);
    }
    input
}

async fn load_or_create(
    app: &App,
    acting: &TenantId,
    id: &str,
    details: NewTicket,
) -> Result<Ticket> {
    let ticket_id = TicketId::new(id);
    match app.store.load(&ticket_id).await {
        Ok(ticket) => {
            ensure_owner(&ticket, acting)?;
            Ok(ticket)
        }
        Err(TicketError::NotFound(_)) => {
            let repository = details
                .repository
                .context("--repo is required for a new ticket")?;
            let title = details
                .title
                .context("--title is required for a new ticket")?;

            let ticket = Ticket::new(
                ticket_id,
                acting.clone(),
                RepositoryId::new(repository),
                title,
                details.description,
            );
            app.store
                .update(&ticket)
                .await
                .context("Failed to store ticket")?;
            tracing::info!(ticket_id = %ticket.id, tenant_id = %ticket.tenant_id, "Created ticket");
            Ok(ticket)
        }
        Err(e) => Err(e).context("Failed to load ticket"),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            token.cancel();
        }
    });
    cancel
}

fn report(app: &App, target: &RunTarget, outcome: Result<RunOutcome, WorkflowError>) -> Result<()> {
    app.log_metrics();
    match outcome.context("Workflow run failed")? {
        RunOutcome::Completed { status, state } => {
            ui::success(&format!("Ticket {} is now {status}", target.ticket));
            if let Some(url) = state.text("pr_url") {
                ui::kv("Pull request", url);
            }
            if status == TicketStatus::PlanApproved {
                ui::info(&format!(
                    "Next: forgeline start --ticket {} --workflow implementation",
                    target.ticket
                ));
            }
            Ok(())
        }
        RunOutcome::Suspended {
            checkpoint_id,
            resume_step,
        } => {
            ui::info(&format!("Waiting for review at '{resume_step}'"));
            ui::kv("Checkpoint", checkpoint_id.as_ref());
            ui::info(&format!(
                "Inspect with 'forgeline checkpoints --ticket {0} --state', then \
                 'forgeline approve --ticket {0}' or 'forgeline reject --ticket {0} --feedback ...'",
                target.ticket
            ));
            Ok(())
        }
        RunOutcome::Failed {
            step,
            error,
            detail,
        } => {
            ui::error(&format!("Step '{step}' failed: {error}"));
            if let Some(detail) = detail {
                ui::kv("Detail", &detail);
            }
            bail!("Ticket {} failed", target.ticket)
        }
    }
}
