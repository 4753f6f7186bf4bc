//! CLI output formatting

use crate::core::state::{NodeStatus, PlanStatus};
use crate::events::OrchestrationEvent;
use crate::persistence::ExecutionSummary;
use console::Emoji;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a node status for display
pub fn format_node_status(status: NodeStatus) -> String {
    let label = status.to_string();
    match status {
        NodeStatus::Succeeded => style(label).green().to_string(),
        NodeStatus::Failed => style(label).red().to_string(),
        NodeStatus::Aborted => style(label).yellow().to_string(),
        NodeStatus::Skipped | NodeStatus::Queued => style(label).dim().to_string(),
        NodeStatus::TaskWaiting | NodeStatus::AsyncWaiting | NodeStatus::ChildWaiting => {
            style(label).blue().to_string()
        }
        _ => style(label).yellow().to_string(),
    }
}

/// Format a plan status for display
pub fn format_plan_status(status: PlanStatus) -> String {
    let label = status.as_str().to_uppercase();
    match status {
        PlanStatus::Running => style(label).yellow().to_string(),
        PlanStatus::Succeeded => style(label).green().to_string(),
        PlanStatus::Failed => style(label).red().to_string(),
        PlanStatus::Aborted => style(label).yellow().to_string(),
    }
}

/// Format execution summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    let status_icon = match summary.status {
        PlanStatus::Succeeded => CHECK,
        PlanStatus::Failed => CROSS,
        PlanStatus::Running => SPINNER,
        PlanStatus::Aborted => WARN,
    };

    format!(
        "{} {} - {} - {} ({}/{}) - {}",
        status_icon,
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.plan_name).bold(),
        format_plan_status(summary.status),
        summary.completed_nodes,
        summary.total_nodes,
        style(format!("{:.0}%", summary.progress * 100.0)).cyan()
    )
}

/// One console line per lifecycle event; status updates only when verbose
pub fn format_orchestration_event(event: &OrchestrationEvent, verbose: bool) -> Option<String> {
    let line = match event {
        OrchestrationEvent::PlanStarted {
            plan_execution_id,
            plan_id,
            ..
        } => format!(
            "{} Starting plan {} ({})",
            ROCKET,
            style(plan_id).bold(),
            style(short_id(plan_execution_id)).dim()
        ),
        OrchestrationEvent::NodeStarted {
            plan_node_id,
            step_type,
            parent_id,
            ..
        } => {
            let indent = if parent_id.is_some() { "    " } else { "" };
            format!(
                "{}{} {} {}",
                indent,
                SPINNER,
                style(plan_node_id).cyan(),
                style(format!("[{}]", step_type)).dim()
            )
        }
        OrchestrationEvent::NodeStatusUpdate {
            plan_node_id,
            from,
            to,
            ..
        } => {
            if !verbose {
                return None;
            }
            format!(
                "  {} {}: {} → {}",
                INFO,
                style(plan_node_id).dim(),
                format_node_status(*from),
                format_node_status(*to)
            )
        }
        OrchestrationEvent::NodeEnded {
            plan_node_id,
            parent_id,
            status,
            failure,
            ..
        } => {
            let indent = if parent_id.is_some() { "    " } else { "" };
            let icon = match status {
                NodeStatus::Succeeded | NodeStatus::Skipped => CHECK,
                NodeStatus::Aborted => WARN,
                _ => CROSS,
            };
            match failure {
                Some(failure) => format!(
                    "{}{} {} {}: {}",
                    indent,
                    icon,
                    style(plan_node_id).bold(),
                    format_node_status(*status),
                    style(&failure.message).dim()
                ),
                None => format!(
                    "{}{} {} {}",
                    indent,
                    icon,
                    style(plan_node_id).bold(),
                    format_node_status(*status)
                ),
            }
        }
        OrchestrationEvent::PlanEnded {
            plan_execution_id,
            status,
            ..
        } => format!(
            "{} Plan ({}) {}",
            INFO,
            style(short_id(plan_execution_id)).dim(),
            format_plan_status(*status)
        ),
    };
    Some(line)
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
