//! Inspect a ticket's checkpoints.

use anyhow::{Context, Result};
use console::style;

use forgeline_core::checkpoint::{CheckpointStatus, CheckpointStore};
use forgeline_core::types::TenantId;

use crate::app::App;
use crate::commands::workflow::load_owned;
use crate::ui;

/// List checkpoints, oldest first; with `show_state`, print the state of
/// the active one.
pub async fn run_checkpoints(
    app: &App,
    acting: &TenantId,
    ticket: &str,
    show_state: bool,
) -> Result<()> {
    let ticket = load_owned(app, acting, ticket).await?;
    let ticket_id = ticket.id.clone();

    ui::header(&format!("Ticket {}: {}", ticket.id, ticket.title));
    ui::kv("Status", &ticket.status.to_string());
    ui::kv("Tenant", ticket.tenant_id.as_ref());
    if let Some(reason) = &ticket.failure_reason {
        ui::kv("Failure", reason);
    }

    let checkpoints = app
        .store
        .list_for_ticket(&ticket_id)
        .await
        .context("Failed to list checkpoints")?;
    if checkpoints.is_empty() {
        ui::info("No checkpoints");
        return Ok(());
    }

    println!();
    ui::table_row(&[
        ("CHECKPOINT", 38),
        ("WORKFLOW", 16),
        ("RESUME AT", 22),
        ("STATUS", 12),
        ("CREATED", 20),
    ]);
    for checkpoint in &checkpoints {
        let created = checkpoint.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
        ui::table_row(&[
            (checkpoint.id.as_ref(), 38),
            (checkpoint.workflow_id.as_ref(), 16),
            (checkpoint.resume_step.as_str(), 22),
            (status_label(checkpoint.status), 12),
            (created.as_str(), 20),
        ]);
    }

    if show_state {
        let active = checkpoints
            .iter()
            .rev()
            .find(|c| c.status == CheckpointStatus::Active);
        match active {
            Some(checkpoint) => {
                let state: serde_json::Value = serde_json::from_str(&checkpoint.state)
                    .context("Checkpoint state is not valid JSON")?;
                ui::header(&format!("State at {}", style(&checkpoint.resume_step).cyan()));
                println!("{}", serde_json::to_string_pretty(&state)?);
            }
            None => ui::warning("No active checkpoint"),
        }
    }
    Ok(())
}

const fn status_label(status: CheckpointStatus) -> &'static str {
    match status {
        CheckpointStatus::Active => "active",
        CheckpointStatus::Superseded => "superseded",
        CheckpointStatus::Consumed => "consumed",
    }
}
