//! CLI command definitions

use clap::Args;

use crate::core::config::TransportKind;

/// Run a plan
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to plan YAML file
    #[arg(short, long)]
    pub file: String,

    /// How response events reach the orchestrator
    #[arg(long, value_enum, default_value_t = TransportArg::Queued)]
    pub transport: TransportArg,

    /// Concurrent step invocations
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// Give up waiting for the plan after this many seconds
    #[arg(long, default_value_t = 3600)]
    pub timeout_secs: u64,

    /// Keep node executions in this SQLite database instead of memory
    #[arg(long)]
    pub state_db: Option<String>,

    /// Don't save execution to history
    #[arg(long)]
    pub no_history: bool,
}

/// Validate a plan configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to plan YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List plans found in history
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show execution counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Plan name to filter by
    #[arg(short, long)]
    pub plan: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show full details
    #[arg(long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a specific execution
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Transport argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportArg {
    Queued,
    Direct,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Queued => TransportKind::Queued,
            TransportArg::Direct => TransportKind::Direct,
        }
    }
}
