//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ContentHasher, InfraConfig, ValidationResult};
use crate::graph::Graph;
use crate::planner::{OperationKind, OperationState, PlanDocument};
use crate::session::SessionReport;
use crate::state::{LockInfo, Snapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanOperationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

/// Snapshot entry row for table display.
#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Applied")]
    applied_at: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for machine-readable output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan document for display.
    #[must_use]
    pub fn format_plan(&self, plan: &PlanDocument) -> String {
        match self.format {
            OutputFormat::Json => plan.to_json().unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &PlanDocument) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. {} resources are up to date.\n",
                "✓".green(),
                plan.summary.no_op
            );
        }

        let mut output = String::new();

        let _ = writeln!(output, "\nPlan for {}/{}", plan.project, plan.environment);
        let _ = write!(
            output,
            "   Snapshot version: {}   Fingerprint: {}\n\n",
            plan.base_snapshot_version,
            ContentHasher::new().short_hash(&plan.fingerprint)
        );

        let rows: Vec<PlanOperationRow> = plan
            .operations
            .iter()
            .filter(|op| op.operation_kind.is_change())
            .enumerate()
            .map(|(i, op)| PlanOperationRow {
                index: i + 1,
                action: Self::format_kind(op.operation_kind),
                resource: format!("{}/{}", op.stack_name, op.resource_id),
                resource_type: op.resource_type.clone(),
                reason: Self::truncate(&op.reason, 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy, {} unchanged\n",
            plan.summary.create.to_string().green(),
            plan.summary.update.to_string().yellow(),
            plan.summary.replace.to_string().magenta(),
            plan.summary.destroy.to_string().red(),
            plan.summary.no_op
        );

        output
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_report(&self, session: &SessionReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(session).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(session),
        }
    }

    fn format_report_text(session: &SessionReport) -> String {
        let report = &session.report;
        let mut output = String::new();

        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .filter(|o| o.kind.is_change())
            .map(|o| OutcomeRow {
                resource: o.address.to_string(),
                action: Self::format_kind(o.kind),
                result: Self::format_state(o.state),
                error: o
                    .error
                    .as_ref()
                    .map(|e| {
                        let retry = if e.retryable { " (retryable)" } else { "" };
                        format!("{}{retry}", Self::truncate(&e.message, 60))
                    })
                    .unwrap_or_default(),
            })
            .collect();

        if !rows.is_empty() {
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let status = if report.is_success() {
            format!("{} Apply complete", "✓".green())
        } else if report.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else {
            format!("{} Apply finished with failures", "✗".red())
        };

        let _ = write!(
            output,
            "\n{status}: {} changed, {} failed, {} skipped, {} cancelled\n",
            report.changed(),
            report.failed().len(),
            report.skipped().len(),
            report.cancelled_operations().len()
        );

        if session.snapshot_written {
            let _ = writeln!(output, "   Snapshot written at version {}", session.snapshot_version);
        } else {
            let _ = writeln!(output, "   Snapshot unchanged at version {}", session.snapshot_version);
        }

        output
    }

    /// Formats the dependency graph.
    #[must_use]
    pub fn format_graph(&self, graph: &Graph) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&GraphJson::from(graph)).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                for stack in graph.stack_order() {
                    let dependencies = graph.stack_dependencies(&stack.name);
                    if dependencies.is_empty() {
                        let _ = writeln!(output, "Stack {}", stack.name.bold());
                    } else {
                        let _ = writeln!(
                            output,
                            "Stack {} (after {})",
                            stack.name.bold(),
                            dependencies.join(", ")
                        );
                    }
                }

                let rows: Vec<NodeRow> = graph
                    .topological_order()
                    .map(|node| NodeRow {
                        resource: node.address.to_string(),
                        resource_type: node.resource.resource_type.clone(),
                        depends_on: graph
                            .dependencies(&node.address)
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
                    .collect();

                output.push('\n');
                output.push_str(&Table::new(rows).to_string());
                let _ = write!(
                    output,
                    "\n\n{} resources, {} dependencies\n",
                    graph.len(),
                    graph.edge_count()
                );
                output
            }
        }
    }

    /// Formats a validation summary.
    #[must_use]
    pub fn format_validation(&self, config: &InfraConfig, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.project.name,
                "environment": config.project.environment,
                "stacks": config.stack_names(),
                "resources": config.resource_count(),
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = writeln!(output, "\n   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Stacks: {}", config.stack_names().join(", "));
                let _ = writeln!(output, "   Resources: {}", config.resource_count());
                output
            }
        }
    }

    /// Formats a snapshot.
    #[must_use]
    pub fn format_snapshot(&self, snapshot: &Snapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(snapshot).unwrap_or_default(),
            OutputFormat::Text => {
                if snapshot.version == 0 {
                    return String::from("No snapshot recorded yet.\n");
                }

                let mut output = String::new();
                let hasher = ContentHasher::new();

                let _ = writeln!(output, "\nSnapshot version {}", snapshot.version);
                if let Some(updated) = snapshot.last_updated {
                    let _ = writeln!(output, "   Last updated: {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
                }

                let rows: Vec<EntryRow> = snapshot
                    .resources
                    .iter()
                    .map(|(address, entry)| EntryRow {
                        resource: address.to_string(),
                        resource_type: entry.resource_type.clone(),
                        hash: hasher.short_hash(&entry.content_hash),
                        applied_at: entry.applied_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();

                output.push('\n');
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} v{} {} by {} ({} changed, {} failed)",
                            entry.version,
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.holder,
                            entry.changed,
                            entry.failed
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&lock).unwrap_or_default(),
            OutputFormat::Text => lock.map_or_else(
                || String::from("Not locked.\n"),
                |lock| {
                    let mut output = String::new();
                    let expired = if lock.is_expired() { " (expired)".red().to_string() } else { String::new() };
                    let _ = writeln!(output, "Locked by {}{expired}", lock.holder.bold());
                    let _ = writeln!(output, "   Token: {}", lock.token);
                    let _ = writeln!(output, "   Acquired: {}", lock.acquired_at.to_rfc3339());
                    let _ = writeln!(
                        output,
                        "   Expires: {} ({}s remaining)",
                        lock.expires_at.to_rfc3339(),
                        lock.remaining_secs()
                    );
                    output
                },
            ),
        }
    }

    fn format_kind(kind: OperationKind) -> String {
        match kind {
            OperationKind::Create => "+create".green().to_string(),
            OperationKind::Update => "~update".yellow().to_string(),
            OperationKind::Replace => "±replace".magenta().to_string(),
            OperationKind::Destroy => "-destroy".red().to_string(),
            OperationKind::NoOp => "no-op".dimmed().to_string(),
        }
    }

    fn format_state(state: OperationState) -> String {
        match state {
            OperationState::Applied | OperationState::Destroyed => state.to_string().green().to_string(),
            OperationState::Failed => state.to_string().red().to_string(),
            OperationState::Skipped | OperationState::Cancelled => state.to_string().yellow().to_string(),
            _ => state.to_string().dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

// JSON serialization helpers

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphJson {
    stacks: Vec<StackJson>,
    nodes: Vec<NodeJson>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StackJson {
    name: String,
    depends_on: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeJson {
    address: String,
    resource_type: String,
    depends_on: Vec<String>,
}

impl From<&Graph> for GraphJson {
    fn from(graph: &Graph) -> Self {
        Self {
            stacks: graph
                .stack_order()
                .map(|stack| StackJson {
                    name: stack.name.clone(),
                    depends_on: graph
                        .stack_dependencies(&stack.name)
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                })
                .collect(),
            nodes: graph
                .topological_order()
                .map(|node| NodeJson {
                    address: node.address.to_string(),
                    resource_type: node.resource.resource_type.clone(),
                    depends_on: graph
                        .dependencies(&node.address)
                        .iter()
                        .map(ToString::to_string)
                        .collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Reference, ResourceNode, Stack};

    fn graph() -> Graph {
        let mut builder = GraphBuilder::new();
        builder.register(
            Stack::new("net")
                .with_resource(ResourceNode::new("vpc", "aws_vpc"))
                .with_resource(ResourceNode::new("subnet", "aws_subnet").with_attribute("vpcId", Reference::local("vpc", "id"))),
        );
        builder.build().unwrap()
    }

    #[test]
    fn test_graph_json() {
        let json = OutputFormatter::new(OutputFormat::Json).format_graph(&graph());
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["nodes"][1]["address"], "net/subnet");
        assert_eq!(value["nodes"][1]["dependsOn"][0], "net/vpc");
        assert_eq!(value["stacks"][0]["name"], "net");
    }

    #[test]
    fn test_graph_text() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_graph(&graph());
        assert!(text.contains("Stack net"));
        assert!(text.contains("2 resources, 1 dependencies"));
    }

    #[test]
    fn test_lock_text() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        assert_eq!(formatter.format_lock(None), "Not locked.\n");

        let lock = LockInfo::new("ci@runner", std::time::Duration::from_secs(60));
        let text = formatter.format_lock(Some(&lock));
        assert!(text.contains("Locked by ci@runner"));
        assert!(text.contains(&lock.token));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(OutputFormatter::truncate("ééééééé", 5), "éé...");
    }
}
