mod reminders;
mod serve;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use nudge_types::{AgentType, ReminderStatus};

#[derive(Parser)]
#[command(name = "nudge", about = "Recurring reminder scheduler")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
pub struct GlobalArgs {
    /// Config file (defaults to ~/.nudge/config.json5)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Owner the command acts for
    #[arg(long, global = true, default_value = "local")]
    pub owner: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

/// Payload and timing flags shared by `create` and `update`.
#[derive(Args)]
pub struct ReminderArgs {
    /// Notification title (static reminders)
    #[arg(long)]
    pub title: Option<String>,

    /// Notification body (static reminders)
    #[arg(long)]
    pub body: Option<String>,

    /// Agent instructions (makes an AI agent reminder)
    #[arg(long, conflicts_with_all = ["title", "body"])]
    pub instructions: Option<String>,

    /// Cron expression, e.g. "0 9 * * 1-5"
    #[arg(long)]
    pub repeat: Option<String>,

    /// First fire time, RFC 3339 (e.g. 2025-01-01T09:00:00Z)
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// Stop after this many successful firings
    #[arg(long)]
    pub max_occurrences: Option<u32>,

    /// No firing at or after this time, RFC 3339
    #[arg(long)]
    pub stop_after: Option<DateTime<Utc>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reminder engine until Ctrl-C
    Serve,
    /// Create a reminder
    Create(ReminderArgs),
    /// List reminders
    List {
        /// Only reminders in this status
        #[arg(long)]
        status: Option<ReminderStatus>,

        /// Only reminders of this type (static, ai_agent)
        #[arg(long = "type")]
        agent_type: Option<AgentType>,

        #[arg(long, default_value_t = 50)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        skip: u32,
    },
    /// Show one reminder
    Get { id: String },
    /// Change a reminder
    Update {
        id: String,

        #[command(flatten)]
        args: ReminderArgs,
    },
    /// Cancel a reminder
    Cancel { id: String },
    /// Pause a scheduled reminder
    Pause { id: String },
    /// Resume a paused reminder
    Resume { id: String },
    /// Show upcoming fire times of a cron expression
    Preview {
        expr: String,

        #[arg(short, default_value_t = 5)]
        n: usize,
    },
    /// Check every scheduled reminder against the overdue policy
    Reconcile,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.global.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let rt = tokio::runtime::Runtime::new()?;
    let global = cli.global;

    match cli.command {
        Commands::Serve => rt.block_on(serve::run_serve(&global))?,
        Commands::Create(args) => rt.block_on(reminders::run_create(&global, args))?,
        Commands::List {
            status,
            agent_type,
            limit,
            skip,
        } => rt.block_on(reminders::run_list(&global, status, agent_type, limit, skip))?,
        Commands::Get { id } => rt.block_on(reminders::run_get(&global, &id))?,
        Commands::Update { id, args } => rt.block_on(reminders::run_update(&global, &id, args))?,
        Commands::Cancel { id } => {
            rt.block_on(reminders::run_transition(&global, &id, reminders::Transition::Cancel))?
        }
        Commands::Pause { id } => {
            rt.block_on(reminders::run_transition(&global, &id, reminders::Transition::Pause))?
        }
        Commands::Resume { id } => {
            rt.block_on(reminders::run_transition(&global, &id, reminders::Transition::Resume))?
        }
        Commands::Preview { expr, n } => reminders::run_preview(&expr, n)?,
        Commands::Reconcile => rt.block_on(reminders::run_reconcile(&global))?,
    }

    Ok(())
}
