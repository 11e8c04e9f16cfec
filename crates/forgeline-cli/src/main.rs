//! Forgeline CLI - plan, review and implement tickets with AI agents.

mod app;
mod commands;
mod ui;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use forgeline_core::config::{Config, LogFormat};
use forgeline_core::types::TenantId;

use app::{App, Workflow};
use commands::workflow::{NewTicket, RunTarget, parse_assignments};

#[derive(Parser)]
#[command(name = "forgeline")]
#[command(about = "Forgeline - checkpointed AI planning and implementation workflows")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to $FORGELINE_STATE_DIR/forgeline.json)
    #[arg(long, global = true, env = "FORGELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Tenant acting on tickets (required for every ticket command)
    #[arg(long, global = true, env = "FORGELINE_TENANT")]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// Ticket ID
    #[arg(long)]
    ticket: String,

    /// Workflow to run
    #[arg(long, value_enum, default_value_t = Workflow::Planning)]
    workflow: Workflow,

    /// Branch pull requests target
    #[arg(long, default_value = "main")]
    base: String,
}

impl From<TargetArgs> for RunTarget {
    fn from(args: TargetArgs) -> Self {
        Self {
            ticket: args.ticket,
            workflow: args.workflow,
            base_branch: args.base,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start a workflow for a ticket
    Start {
        #[command(flatten)]
        target: TargetArgs,

        /// Repository ID (required for a new ticket)
        #[arg(long)]
        repo: Option<String>,

        /// Ticket title (required for a new ticket)
        #[arg(long)]
        title: Option<String>,

        /// Ticket description
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Resume a suspended workflow
    Resume {
        #[command(flatten)]
        target: TargetArgs,

        /// State values to set before resuming
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Approve the pending review and continue
    Approve {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Reject the pending review with feedback
    Reject {
        #[command(flatten)]
        target: TargetArgs,

        /// What needs to change
        #[arg(long, default_value = "")]
        feedback: String,
    },

    /// Cancel a ticket's workflow
    Cancel {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// List a ticket's checkpoints
    Checkpoints {
        /// Ticket ID
        #[arg(long)]
        ticket: String,

        /// Print the state of the active checkpoint
        #[arg(long)]
        state: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Validate the configuration file
    Validate,

    /// Show the effective configuration
    Show,
}

fn init_logging(verbose: bool, config: Option<&Config>) {
    let debug = verbose || config.is_some_and(|c| c.settings.debug);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let format = config.map_or(LogFormat::Pretty, |c| c.settings.log_format);

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

fn acting_tenant(value: Option<&str>) -> anyhow::Result<TenantId> {
    let tenant = TenantId::new(value.context("--tenant or FORGELINE_TENANT is required")?);
    tenant.validate().context("Invalid tenant ID")?;
    Ok(tenant)
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display())),
        None => Config::load_default().context("Failed to load configuration"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    // Validation reports its own errors; it must not fail before it runs.
    if matches!(cli.command, Commands::Config { action: ConfigCommands::Validate }) {
        init_logging(cli.verbose, None);
        return commands::config::run_validate(&config_path);
    }

    let config = load_config(cli.config.as_ref())?;
    init_logging(cli.verbose, Some(&config));

    if matches!(cli.command, Commands::Config { action: ConfigCommands::Show }) {
        return commands::config::run_show(&config);
    }

    let acting = acting_tenant(cli.tenant.as_deref())?;
    let app = App::open(config)?;
    let result = match cli.command {
        Commands::Start {
            target,
            repo,
            title,
            description,
        } => {
            let details = NewTicket {
                repository: repo,
                title,
                description,
            };
            commands::run_start(&app, &acting, &target.into(), details).await
        }
        Commands::Resume { target, set } => match parse_assignments(&set) {
            Ok(input) => commands::run_resume(&app, &acting, &target.into(), input).await,
            Err(e) => Err(e),
        },
        Commands::Approve { target } => {
            commands::run_approve(&app, &acting, &target.into()).await
        }
        Commands::Reject { target, feedback } => {
            commands::run_reject(&app, &acting, &target.into(), &feedback).await
        }
        Commands::Cancel { target } => commands::run_cancel(&app, &acting, &target.into()).await,
        Commands::Checkpoints { ticket, state } => {
            commands::run_checkpoints(&app, &acting, &ticket, state).await
        }
        // Handled before the store is opened.
        Commands::Config { .. } => Ok(()),
    };
    app.close()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_reject_arguments() {
        let cli = Cli::try_parse_from([
            "forgeline",
            "reject",
            "--ticket",
            "FL-1",
            "--workflow",
            "implementation",
            "--feedback",
            "Split the migration",
        ])
        .unwrap();
        let Commands::Reject { target, feedback } = cli.command else {
            panic!("expected reject");
        };
        assert_eq!(target.ticket, "FL-1");
        assert_eq!(target.workflow, Workflow::Implementation);
        assert_eq!(target.base, "main");
        assert_eq!(feedback, "Split the migration");
    }

    #[test]
    fn test_tenant_is_global() {
        let cli = Cli::try_parse_from([
            "forgeline",
            "approve",
            "--ticket",
            "FL-1",
            "--tenant",
            "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
        ])
        .unwrap();
        assert_eq!(
            cli.tenant.as_deref(),
            Some("1b4e28ba-2fa1-11d2-883f-0016d3cca427")
        );
    }

    #[test]
    fn test_acting_tenant_is_validated() {
        assert!(acting_tenant(None).is_err());
        assert!(acting_tenant(Some("acme")).is_err());
        let tenant = acting_tenant(Some("1b4e28ba-2fa1-11d2-883f-0016d3cca427")).unwrap();
        assert_eq!(tenant.as_ref(), "1b4e28ba-2fa1-11d2-883f-0016d3cca427");
    }

    #[test]
    fn test_ticket_is_required() {
        assert!(Cli::try_parse_from(["forgeline", "approve"]).is_err());
    }
}
