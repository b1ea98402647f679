//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying plans, run
//! reports and state to the user as text tables or JSON.

use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::planner::{ActionOutcome, ActionState, ExecutionReport, Operation, Plan};
use crate::state::{LockInfo, RunStatus, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Action outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Result")]
    state: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Error")]
    error: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// The selected output format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "summary": plan.summary(),
                "plan": plan,
            })),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan for {}/{}", plan.project(), plan.environment());
        let _ = write!(
            output,
            "   Fingerprint: {}\n\n",
            &plan.fingerprint()[..8.min(plan.fingerprint().len())]
        );

        let rows: Vec<PlanActionRow> = plan
            .changes()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_operation(a.operation),
                resource: a.resource.clone(),
                kind: a.kind.to_string(),
                reason: Self::truncate(&a.reason, 50),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for action in plan.changes() {
                let _ = writeln!(output, "   {} {}", Self::format_operation(action.operation), action.resource);
                for detail in &action.details {
                    let _ = writeln!(
                        output,
                        "       {}: {} -> {}",
                        detail.field,
                        detail.old_value.as_deref().unwrap_or("(none)"),
                        detail.new_value.as_deref().unwrap_or("(none)")
                    );
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.delete.to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_report(&self, report: &ExecutionReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ExecutionReport) -> String {
        let headline = match report.status {
            RunStatus::Success => format!("{} Apply complete", "✓".green()),
            RunStatus::PartialFailure => format!("{} Apply partially failed", "⚠".yellow()),
            RunStatus::Failure => format!("{} Apply failed", "✗".red()),
        };
        let mut output = format!("{headline}\n\n");

        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .filter(|o| o.operation != Operation::Noop)
            .map(Self::outcome_row)
            .collect();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = write!(
            output,
            "\nResources: {} applied, {} failed, {} blocked, {} skipped, {} unchanged\n",
            report.applied().len().to_string().green(),
            report.failed().len().to_string().red(),
            report.blocked().len().to_string().yellow(),
            report.skipped().len().to_string().yellow(),
            report.unchanged().len()
        );
        Self::push_outputs(&mut output, &report.outputs);

        if !report.state_errors.is_empty() {
            let _ = write!(output, "\n{} State errors:\n", "⚠".yellow());
            for error in &report.state_errors {
                let _ = writeln!(output, "   - {error}");
            }
        }

        output
    }

    fn outcome_row(outcome: &ActionOutcome) -> OutcomeRow {
        OutcomeRow {
            resource: outcome.resource.clone(),
            action: Self::format_operation(outcome.operation),
            state: Self::format_state_label(outcome.state),
            attempts: outcome.attempts,
            error: outcome
                .error
                .as_deref()
                .map_or_else(String::new, |e| Self::truncate(e, 50)),
        }
    }

    /// Formats the recorded state.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    state.project, state.environment
                );
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.resources.len());

                if !state.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .resources
                        .values()
                        .map(|r| RecordRow {
                            name: r.name.clone(),
                            kind: r.kind.to_string(),
                            provider_id: r.provider_id.clone(),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                Self::push_outputs(&mut output, &state.outputs);

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let mark = match entry.status {
                            RunStatus::Success => "✓".green(),
                            RunStatus::PartialFailure => "⚠".yellow(),
                            RunStatus::Failure => "✗".red(),
                        };
                        let _ = writeln!(
                            output,
                            "     {mark} {} - {} ({} applied, {} failed)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.applied.len(),
                            entry.failed.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a lock.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "State locked by {} ({}), expires in {}s\n",
                lock.holder,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "warnings": &result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats an operation with color.
    fn format_operation(operation: Operation) -> String {
        match operation {
            Operation::Create => "+create".green().to_string(),
            Operation::Update => "~update".yellow().to_string(),
            Operation::Replace => "-/+replace".magenta().to_string(),
            Operation::Delete => "-delete".red().to_string(),
            Operation::Noop => "noop".dimmed().to_string(),
        }
    }

    /// Formats an action state with color.
    fn format_state_label(state: ActionState) -> String {
        match state {
            ActionState::Applied => "applied".green().to_string(),
            ActionState::Failed => "failed".red().to_string(),
            ActionState::Blocked | ActionState::Skipped => state.to_string().yellow().to_string(),
            ActionState::Pending | ActionState::InFlight => state.to_string().dimmed().to_string(),
        }
    }

    fn push_outputs(output: &mut String, outputs: &BTreeMap<String, String>) {
        if outputs.is_empty() {
            return;
        }
        output.push_str("\nOutputs:\n");
        for (name, value) in outputs {
            let _ = writeln!(output, "   {} = {value}", name.cyan());
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RunHistoryEntry, RunOperation};
    use uuid::Uuid;

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-much-longer-message", 10), "a-much-...");
    }

    #[test]
    fn test_state_json_is_parseable() {
        let mut state = StateSnapshot::new("gpu-batch", "dev");
        state.add_history(RunHistoryEntry::new(
            Uuid::new_v4(),
            RunOperation::Apply,
            RunStatus::Success,
            vec!["network".to_string()],
            vec![],
        ));

        let json = OutputFormatter::new(OutputFormat::Json).format_state(&state);
        let parsed: StateSnapshot = serde_json::from_str(&json).expect("valid state json");
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_state_text_lists_history() {
        let mut state = StateSnapshot::new("gpu-batch", "dev");
        state.add_history(RunHistoryEntry::new(
            Uuid::new_v4(),
            RunOperation::Destroy,
            RunStatus::PartialFailure,
            vec![],
            vec!["vm".to_string()],
        ));

        let text = OutputFormatter::new(OutputFormat::Text).format_state(&state);
        assert!(text.contains("gpu-batch/dev"));
        assert!(text.contains("destroy"));
        assert!(text.contains("1 failed"));
        assert!(!text.contains("Outputs:"));
    }

    #[test]
    fn test_state_text_lists_outputs() {
        colored::control::set_override(false);
        let mut state = StateSnapshot::new("gpu-batch", "dev");
        state
            .outputs
            .insert("instance_ip".to_string(), "203.0.113.4".to_string());

        let text = OutputFormatter::new(OutputFormat::Text).format_state(&state);
        assert!(text.contains("Outputs:"));
        assert!(text.contains("instance_ip = 203.0.113.4"));

        let json = OutputFormatter::new(OutputFormat::Json).format_state(&state);
        assert!(json.contains("\"instance_ip\": \"203.0.113.4\""));
    }
}
