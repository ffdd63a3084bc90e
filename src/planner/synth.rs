//! Plan document synthesis.
//!
//! The plan document is the declarative hand-off to an external apply engine:
//! the graph's stacks, nodes and edges plus the ordered operation records.
//! Synthesis is pure. The same graph and operation list always produce the
//! same bytes, and the document carries a fingerprint of its own content.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use super::diff::DiffDetail;
use super::plan::{OperationKind, OperationList};
use crate::config::ContentHasher;
use crate::error::{Result, StateError};
use crate::graph::{AttributeValue, BackendConfig, Graph, ProviderConfig, ResolvedValue, ResourceAddress};

/// Current plan document format version.
pub const PLAN_FORMAT_VERSION: &str = "1.0";

/// Serialized plan for an external apply engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDocument {
    /// Plan format version.
    pub format_version: String,
    /// Project (scope) name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Snapshot version the plan was computed against.
    pub base_snapshot_version: u64,
    /// SHA-256 of the document with this field empty.
    pub fingerprint: String,
    /// Stacks in dependency order.
    pub stacks: Vec<PlanStack>,
    /// Resources in topological order.
    pub nodes: Vec<PlanNode>,
    /// Dependency edges.
    pub edges: Vec<PlanEdge>,
    /// Operations in execution order.
    pub operations: Vec<PlanOperation>,
    /// Operation counts.
    pub summary: PlanSummary,
}

/// A stack in the plan document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStack {
    /// Stack name.
    pub name: String,
    /// Provider binding configuration.
    pub provider: ProviderConfig,
    /// State backend declaration.
    pub backend: BackendConfig,
    /// Stacks this one consumes outputs or resources from.
    pub depends_on: Vec<String>,
    /// Declared stack outputs.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, AttributeValue>,
}

/// A resource node in the plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    /// Global address.
    pub address: ResourceAddress,
    /// Owning stack.
    pub stack_name: String,
    /// Id within the stack.
    pub resource_id: String,
    /// Resource kind tag.
    pub resource_type: String,
}

/// A dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEdge {
    /// Dependent resource.
    pub from: ResourceAddress,
    /// Resource it depends on.
    pub to: ResourceAddress,
}

/// One operation record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOperation {
    /// Owning stack.
    pub stack_name: String,
    /// Id within the stack.
    pub resource_id: String,
    /// Resource kind tag.
    pub resource_type: String,
    /// What to do.
    pub operation_kind: OperationKind,
    /// Attributes with references substituted; unknown values appear as
    /// `{"computed": ...}` markers.
    pub resolved_attributes: BTreeMap<String, ResolvedValue>,
    /// Addresses of the operations that must finish first.
    pub depends_on: Vec<ResourceAddress>,
    /// Why the operation was planned.
    pub reason: String,
    /// Field-level changes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<DiffDetail>,
}

/// Operation counts by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    /// Creates.
    pub create: usize,
    /// In-place updates.
    pub update: usize,
    /// Replacements.
    pub replace: usize,
    /// Destroys.
    pub destroy: usize,
    /// Unchanged resources.
    pub no_op: usize,
}

impl PlanDocument {
    /// Returns true if the plan changes any infrastructure.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.summary.create + self.summary.update + self.summary.replace + self.summary.destroy > 0
    }

    /// Serializes the document as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StateError::serialization(e.to_string()).into())
    }
}

/// Builds plan documents.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    project: String,
    environment: String,
}

impl Synthesizer {
    /// Creates a synthesizer for a project and environment.
    #[must_use]
    pub fn new(project: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
        }
    }

    /// Serializes the graph and operation list into a plan document.
    #[must_use]
    pub fn synthesize(&self, graph: &Graph, operations: &OperationList) -> PlanDocument {
        let stacks = graph
            .stack_order()
            .map(|stack| PlanStack {
                name: stack.name.clone(),
                provider: stack.provider.clone(),
                backend: stack.backend.clone(),
                depends_on: graph
                    .stack_dependencies(&stack.name)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                outputs: stack.outputs.clone(),
            })
            .collect();

        let nodes = graph
            .topological_order()
            .map(|node| PlanNode {
                address: node.address.clone(),
                stack_name: node.address.stack.clone(),
                resource_id: node.address.id.clone(),
                resource_type: node.resource.resource_type.clone(),
            })
            .collect();

        let edges = graph
            .edges()
            .map(|(from, to)| PlanEdge {
                from: from.clone(),
                to: to.clone(),
            })
            .collect();

        let plan_operations = operations
            .operations()
            .iter()
            .enumerate()
            .map(|(index, op)| PlanOperation {
                stack_name: op.address.stack.clone(),
                resource_id: op.address.id.clone(),
                resource_type: op.resource_type.clone(),
                operation_kind: op.kind,
                resolved_attributes: op.attributes.clone(),
                depends_on: operations.prerequisite_addresses(index).into_iter().cloned().collect(),
                reason: op.reason.clone(),
                changes: op.details.clone(),
            })
            .collect();

        let summary = PlanSummary {
            create: operations.count(OperationKind::Create),
            update: operations.count(OperationKind::Update),
            replace: operations.count(OperationKind::Replace),
            destroy: operations.count(OperationKind::Destroy),
            no_op: operations.count(OperationKind::NoOp),
        };

        let mut document = PlanDocument {
            format_version: PLAN_FORMAT_VERSION.to_string(),
            project: self.project.clone(),
            environment: self.environment.clone(),
            base_snapshot_version: operations.base_version(),
            fingerprint: String::new(),
            stacks,
            nodes,
            edges,
            operations: plan_operations,
            summary,
        };
        document.fingerprint = ContentHasher::new().hash_document(&document);

        debug!(
            "Synthesized plan {} with {} operations",
            ContentHasher::new().short_hash(&document.fingerprint),
            document.operations.len()
        );
        document
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CrossStackResolver, GraphBuilder, Reference, ResourceNode, Stack};
    use crate::planner::Planner;
    use crate::state::Snapshot;
    use serde_json::json;

    fn scenario() -> (Graph, OperationList) {
        let mut builder = GraphBuilder::new();
        builder
            .register(Stack::new("app").with_resource(
                ResourceNode::new("endpoint", "aws_lb").with_attribute("subnetId", Reference::stack_output("net", "subnetId")),
            ))
            .register(
                Stack::new("net")
                    .with_provider(ProviderConfig::new("aws").with_setting("region", "eu-west-1"))
                    .with_resource(ResourceNode::new("vpc", "aws_vpc").with_literal("cidrBlock", "10.0.0.0/16"))
                    .with_resource(
                        ResourceNode::new("subnet", "aws_subnet").with_attribute("vpcId", Reference::local("vpc", "id")),
                    )
                    .with_resource_output("subnetId", "subnet", "id"),
            );
        let graph = builder.build().unwrap();
        let snapshot = Snapshot::empty();
        let resolved = CrossStackResolver::with_applied(&snapshot).resolve(&graph).unwrap();
        let operations = Planner::new().plan(&graph, &resolved, &snapshot).unwrap();
        (graph, operations)
    }

    #[test]
    fn test_document_shape() {
        let (graph, operations) = scenario();
        let document = Synthesizer::new("shop", "dev").synthesize(&graph, &operations);

        let names: Vec<&str> = document.stacks.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["net", "app"]);
        assert_eq!(document.stacks[1].depends_on, ["net"]);

        let order: Vec<String> = document.operations.iter().map(|o| format!("{}/{}", o.stack_name, o.resource_id)).collect();
        assert_eq!(order, ["net/vpc", "net/subnet", "app/endpoint"]);
        assert_eq!(document.operations[2].depends_on, [ResourceAddress::new("net", "subnet")]);
        assert_eq!(document.summary.create, 3);
        assert!(document.has_changes());

        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["operations"][1]["operationKind"], json!("Create"));
        assert_eq!(
            value["operations"][1]["resolvedAttributes"]["vpcId"],
            json!({ "computed": "net/vpc.id" })
        );
        assert_eq!(value["stacks"][0]["provider"]["region"], json!("eu-west-1"));
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let (graph, operations) = scenario();
        let synthesizer = Synthesizer::new("shop", "dev");
        let first = synthesizer.synthesize(&graph, &operations).to_json().unwrap();
        let second = synthesizer.synthesize(&graph, &operations).to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let (graph, operations) = scenario();
        let dev = Synthesizer::new("shop", "dev").synthesize(&graph, &operations);
        let prod = Synthesizer::new("shop", "prod").synthesize(&graph, &operations);
        assert_eq!(dev.fingerprint.len(), 64);
        assert_ne!(dev.fingerprint, prod.fingerprint);
    }
}
