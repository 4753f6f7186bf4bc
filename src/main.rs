use anyhow::{Context, Result};
use orchestrator::cli::commands::{HistoryCommand, ListCommand, RunCommand, ValidateCommand};
use orchestrator::cli::output::*;
use orchestrator::cli::{Cli, Command};
use orchestrator::core::config::{OrchestratorConfig, PlanConfig};
use orchestrator::events::{event_handler, HandlerMode};
use orchestrator::persistence::{
    ExecutionSummary, InMemoryHistory, InMemoryNodeExecutionStore, NodeExecutionStore,
    PlanHistoryStore,
};
use orchestrator::{Engine, PlanStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_plan(cmd, cli.verbose).await?,
        Command::Validate(cmd) => validate_plan(cmd)?,
        Command::List(cmd) => list_plans(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn history_store() -> Result<Arc<dyn PlanHistoryStore>> {
    Ok(Arc::new(
        orchestrator::persistence::SqliteHistoryStore::with_default_path().await?,
    ))
}

#[cfg(not(feature = "sqlite"))]
async fn history_store() -> Result<Arc<dyn PlanHistoryStore>> {
    Ok(Arc::new(InMemoryHistory::new()))
}

#[cfg(feature = "sqlite")]
async fn node_store(state_db: Option<&str>) -> Result<Arc<dyn NodeExecutionStore>> {
    match state_db {
        Some(path) => Ok(Arc::new(
            orchestrator::persistence::SqliteNodeExecutionStore::new(&format!("{}?mode=rwc", path))
                .await?,
        )),
        None => Ok(Arc::new(InMemoryNodeExecutionStore::new())),
    }
}

#[cfg(not(feature = "sqlite"))]
async fn node_store(state_db: Option<&str>) -> Result<Arc<dyn NodeExecutionStore>> {
    if state_db.is_some() {
        anyhow::bail!("--state-db needs the sqlite feature");
    }
    Ok(Arc::new(InMemoryNodeExecutionStore::new()))
}

async fn run_plan(cmd: &RunCommand, verbose: bool) -> Result<()> {
    let config = PlanConfig::from_file(&cmd.file).context("Failed to load plan config")?;

    println!("{} Loaded plan: {}", INFO, style(&config.name).bold());

    let history: Arc<dyn PlanHistoryStore> = if cmd.no_history {
        Arc::new(InMemoryHistory::new())
    } else {
        history_store().await?
    };

    let engine = Engine::builder()
        .with_config(
            OrchestratorConfig::default()
                .with_transport(cmd.transport.into())
                .with_worker_concurrency(cmd.workers),
        )
        .with_store(node_store(cmd.state_db.as_deref()).await?)
        .on_all_events(
            "console",
            HandlerMode::Sync,
            event_handler(move |event| {
                if let Some(line) = format_orchestration_event(event, verbose) {
                    println!("{}", line);
                }
                Ok(())
            }),
        )
        .build()
        .context("Failed to start engine")?;

    println!();
    let execution = engine
        .run_plan(&config, Duration::from_secs(cmd.timeout_secs))
        .await;

    let execution = match execution {
        Ok(execution) => execution,
        Err(e) => {
            println!("\n{} {} {}", CROSS, style(&config.name).bold(), style("did not finish").red());
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if !cmd.no_history {
        if let Some(summary) = engine.summary(execution.id) {
            history.save_execution(&summary).await?;
            println!(
                "\n{} Execution saved to history (ID: {})",
                INFO,
                style(&summary.execution_id.to_string()[..8]).dim()
            );
        }
    }

    match execution.status {
        PlanStatus::Succeeded => {
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&config.name).bold(),
                style("successfully").green()
            );
        }
        status => {
            println!(
                "\n{} {} {}",
                CROSS,
                style(&config.name).bold(),
                format_plan_status(status)
            );
            if !execution.failed_nodes.is_empty() {
                println!("  Failed nodes: {}", style(execution.failed_nodes.join(", ")).red());
            }
            if !execution.not_run.is_empty() {
                println!("  Not run: {}", style(execution.not_run.join(", ")).dim());
            }
            std::process::exit(1);
        }
    }

    Ok(())
}

fn validate_plan(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating plan...", INFO);

    match PlanConfig::from_file(&cmd.file) {
        Ok(config) => {
            let plan = config.to_plan();
            println!("{} Plan configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Nodes: {}", style(config.nodes.len()).cyan());
            println!("  Order: {}", style(plan.execution_order().join(" → ")).dim());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

async fn list_plans(cmd: &ListCommand) -> Result<()> {
    let store = history_store().await?;
    let plans = store.list_plans().await?;

    if plans.is_empty() {
        println!("{} No plans found in history", INFO);
        return Ok(());
    }

    println!("{} Plans in history:", INFO);

    let mut json_data = Vec::new();
    for plan_name in &plans {
        let executions = store.list_executions(plan_name).await?;

        if cmd.with_counts {
            let succeeded = executions.iter().filter(|e| e.status == PlanStatus::Succeeded).count();
            let failed = executions.iter().filter(|e| e.status == PlanStatus::Failed).count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(plan_name).bold(),
                style(executions.len()).cyan(),
                style(succeeded).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(plan_name).bold());
        }

        json_data.push(serde_json::json!({
            "name": plan_name,
            "execution_count": executions.len()
        }));
    }

    if cmd.json {
        let data = serde_json::json!({ "plans": json_data });
        println!("\n{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = history_store().await?;

    if let Some(exec_id_str) = &cmd.execution_id {
        let exec_id = uuid::Uuid::parse_str(exec_id_str).context("Invalid execution ID format")?;
        match store.load_execution(exec_id).await? {
            Some(summary) => print_execution_details(&summary, cmd.verbose)?,
            None => println!("{} Execution not found", WARN),
        }
        return Ok(());
    }

    let mut executions = if let Some(plan_name) = &cmd.plan {
        store.list_executions(plan_name).await?
    } else {
        let mut all = Vec::new();
        for plan in store.list_plans().await? {
            all.extend(store.list_executions(&plan).await?);
        }
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    };
    executions.truncate(cmd.limit);

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
        for summary in &executions {
            println!("  {}", format_execution_summary(summary));
        }
    }

    Ok(())
}

fn print_execution_details(summary: &ExecutionSummary, verbose: bool) -> Result<()> {
    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Plan: {}", style(&summary.plan_name).bold());
    println!("  Status: {}", format_plan_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Progress: {} ({}/{}, {} failed)",
        style(format!("{:.0}%", summary.progress * 100.0)).cyan(),
        summary.completed_nodes,
        summary.total_nodes,
        summary.failed_nodes
    );

    if verbose {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(summary)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}
