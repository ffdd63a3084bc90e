//! Diff engine for comparing the desired graph against the last snapshot.
//!
//! Each desired resource is classified by comparing its content hash with the
//! hash recorded at its last apply. Resources present in the snapshot but
//! absent from the graph are destroyed.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::ContentHasher;
use crate::error::{Result, TerrastackError};
use crate::graph::{Graph, GraphNode, ResolvedGraph, ResolvedValue, ResourceAddress};
use crate::state::{Snapshot, SnapshotEntry};

/// Engine for computing diffs between the desired graph and a snapshot.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Content hasher.
    hasher: ContentHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource address.
    pub address: ResourceAddress,
    /// Resource kind tag (the desired one, or the recorded one for destroys).
    pub resource_type: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Attributes to apply, empty for destroys.
    pub attributes: BTreeMap<String, ResolvedValue>,
    /// Field-level details about the difference.
    pub details: Vec<DiffDetail>,
    /// Previous hash (if applicable).
    pub old_hash: Option<String>,
    /// New hash (if applicable).
    pub new_hash: Option<String>,
    /// Why the resource is classified this way.
    pub reason: String,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated in place.
    Update,
    /// Resource needs to be destroyed and created again.
    Replace,
    /// Resource needs to be destroyed.
    Destroy,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Old value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// New value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// Complete diff result.
#[derive(Debug)]
pub struct DiffResult {
    /// Desired resources in topological order, then destroyed resources by address.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to destroy.
    pub destroys: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ContentHasher::new(),
        }
    }

    /// Computes the diff between the resolved desired graph and a snapshot.
    ///
    /// A replaced resource's computed outputs do not survive the replacement,
    /// so resources consuming them are re-resolved with those outputs unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if a graph node was not resolved or no longer resolves.
    pub fn compute_diff(&self, graph: &Graph, resolved: &ResolvedGraph, snapshot: &Snapshot) -> Result<DiffResult> {
        let mut diffs = Vec::with_capacity(graph.len());
        let mut replaced: BTreeSet<ResourceAddress> = BTreeSet::new();

        for node in graph.topological_order() {
            let resource = resolved.resource(&node.address).ok_or_else(|| {
                TerrastackError::internal(format!("{} was not resolved", node.address))
            })?;

            let attributes = if graph
                .dependencies(&node.address)
                .into_iter()
                .any(|d| replaced.contains(d))
            {
                resolved.reresolve(graph, node, &replaced)?
            } else {
                resource.attributes.clone()
            };

            let diff = self.compute_resource_diff(graph, node, attributes, snapshot.get(&node.address));
            if diff.diff_type == DiffType::Replace {
                replaced.insert(node.address.clone());
            }
            diffs.push(diff);
        }

        for (address, entry) in &snapshot.resources {
            if !graph.contains(address) {
                debug!("{address} was removed from the desired graph");
                diffs.push(ResourceDiff {
                    address: address.clone(),
                    resource_type: entry.resource_type.clone(),
                    diff_type: DiffType::Destroy,
                    attributes: BTreeMap::new(),
                    details: vec![],
                    old_hash: Some(entry.content_hash.clone()),
                    new_hash: None,
                    reason: String::from("Removed from the desired graph"),
                });
            }
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        let (creates, updates, replaces, destroys, unchanged) = (
            count(DiffType::Create),
            count(DiffType::Update),
            count(DiffType::Replace),
            count(DiffType::Destroy),
            count(DiffType::NoChange),
        );

        Ok(DiffResult {
            diffs,
            creates,
            updates,
            replaces,
            destroys,
            unchanged,
        })
    }

    /// Classifies a single desired resource.
    fn compute_resource_diff(
        &self,
        graph: &Graph,
        node: &GraphNode,
        attributes: BTreeMap<String, ResolvedValue>,
        entry: Option<&SnapshotEntry>,
    ) -> ResourceDiff {
        let resource_type = node.resource.resource_type.clone();
        let new_hash = self.hasher.hash_resource(&resource_type, &attributes);

        let Some(entry) = entry else {
            debug!("{} needs to be created", node.address);
            return ResourceDiff {
                address: node.address.clone(),
                resource_type,
                diff_type: DiffType::Create,
                attributes,
                details: vec![],
                old_hash: None,
                new_hash: Some(new_hash),
                reason: String::from("Not present in the snapshot"),
            };
        };

        let (diff_type, reason) = if entry.resource_type != resource_type {
            (
                DiffType::Replace,
                format!("Resource type changed from {}", entry.resource_type),
            )
        } else if ContentHasher::hashes_match(&entry.content_hash, &new_hash) {
            (DiffType::NoChange, String::from("Up to date"))
        } else {
            let now: BTreeSet<&ResourceAddress> = graph.dependencies(&node.address).into_iter().collect();
            let then: BTreeSet<&ResourceAddress> = entry.depends_on.iter().collect();
            if now == then {
                (DiffType::Update, String::from("Attributes changed"))
            } else {
                (DiffType::Replace, String::from("Attributes and dependencies changed"))
            }
        };

        let details = if diff_type == DiffType::NoChange {
            vec![]
        } else {
            Self::compute_detailed_diff(entry, &resource_type, &attributes)
        };

        debug!("{} classified as {diff_type} ({reason})", node.address);
        ResourceDiff {
            address: node.address.clone(),
            resource_type,
            diff_type,
            attributes,
            details,
            old_hash: Some(entry.content_hash.clone()),
            new_hash: Some(new_hash),
            reason,
        }
    }

    /// Computes field-level differences between the recorded and desired attributes.
    fn compute_detailed_diff(
        entry: &SnapshotEntry,
        resource_type: &str,
        attributes: &BTreeMap<String, ResolvedValue>,
    ) -> Vec<DiffDetail> {
        let mut details = Vec::new();

        if entry.resource_type != resource_type {
            details.push(DiffDetail {
                field: String::from("type"),
                old_value: Some(Value::from(entry.resource_type.clone())),
                new_value: Some(Value::from(resource_type)),
            });
        }

        let fields: BTreeSet<&String> = entry.attributes.keys().chain(attributes.keys()).collect();
        for field in fields {
            let old_value = entry.attributes.get(field).cloned();
            let new_value = attributes.get(field).map(ResolvedValue::to_json);
            if old_value != new_value {
                details.push(DiffDetail {
                    field: field.clone(),
                    old_value,
                    new_value,
                });
            }
        }

        details
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.replaces > 0 || self.destroys > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.destroys
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }

    /// Looks up the diff for an address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| &d.address == address)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CrossStackResolver, GraphBuilder, Reference, ResourceNode, Stack};
    use chrono::Utc;
    use serde_json::json;

    fn graph(stacks: Vec<Stack>) -> Graph {
        let mut builder = GraphBuilder::new();
        for stack in stacks {
            builder.register(stack);
        }
        builder.build().unwrap()
    }

    /// Records every resource of the graph as applied, with `id` outputs.
    fn applied(graph: &Graph) -> Snapshot {
        let hasher = ContentHasher::new();
        let mut snapshot = Snapshot::empty();
        for node in graph.topological_order() {
            let resolved = CrossStackResolver::with_applied(&snapshot).resolve(graph).unwrap();
            let attributes: BTreeMap<String, Value> = resolved
                .resource(&node.address)
                .unwrap()
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            snapshot.upsert(
                node.address.clone(),
                SnapshotEntry {
                    resource_type: node.resource.resource_type.clone(),
                    content_hash: hasher.hash_resource(&node.resource.resource_type, &attributes),
                    attributes,
                    outputs: BTreeMap::from([("id".to_string(), json!(format!("{}-1", node.address.id)))]),
                    depends_on: graph.dependencies(&node.address).into_iter().cloned().collect(),
                    applied_at: Utc::now(),
                },
            );
        }
        snapshot
    }

    fn network(cidr: &str) -> Stack {
        Stack::new("net")
            .with_resource(ResourceNode::new("vpc", "aws_vpc").with_literal("cidrBlock", cidr))
            .with_resource(
                ResourceNode::new("subnet", "aws_subnet")
                    .with_literal("cidrBlock", "10.0.1.0/24")
                    .with_attribute("vpcId", Reference::local("vpc", "id")),
            )
    }

    fn diff(graph: &Graph, snapshot: &Snapshot) -> DiffResult {
        let resolved = CrossStackResolver::with_applied(snapshot).resolve(graph).unwrap();
        DiffEngine::new().compute_diff(graph, &resolved, snapshot).unwrap()
    }

    #[test]
    fn test_empty_snapshot_creates_everything() {
        let graph = graph(vec![network("10.0.0.0/16")]);
        let result = diff(&graph, &Snapshot::empty());
        assert_eq!(result.creates, 2);
        assert!(result.has_changes());
    }

    #[test]
    fn test_identical_snapshot_is_no_change() {
        let graph = graph(vec![network("10.0.0.0/16")]);
        let snapshot = applied(&graph);
        let result = diff(&graph, &snapshot);
        assert_eq!(result.unchanged, 2);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_attribute_change_is_update_with_details() {
        let graph_v1 = graph(vec![network("10.0.0.0/16")]);
        let snapshot = applied(&graph_v1);
        let graph_v2 = graph(vec![network("10.1.0.0/16")]);

        let result = diff(&graph_v2, &snapshot);
        let vpc = result.get(&ResourceAddress::new("net", "vpc")).unwrap();
        assert_eq!(vpc.diff_type, DiffType::Update);
        assert_eq!(
            vpc.details,
            [DiffDetail {
                field: "cidrBlock".into(),
                old_value: Some(json!("10.0.0.0/16")),
                new_value: Some(json!("10.1.0.0/16")),
            }]
        );
        assert_eq!(result.total_changes(), 1);
    }

    #[test]
    fn test_type_change_replaces_and_invalidates_consumers() {
        let graph_v1 = graph(vec![network("10.0.0.0/16")]);
        let snapshot = applied(&graph_v1);

        let graph_v2 = graph(vec![Stack::new("net")
            .with_resource(ResourceNode::new("vpc", "aws_vpc_ipam").with_literal("cidrBlock", "10.0.0.0/16"))
            .with_resource(
                ResourceNode::new("subnet", "aws_subnet")
                    .with_literal("cidrBlock", "10.0.1.0/24")
                    .with_attribute("vpcId", Reference::local("vpc", "id")),
            )]);

        let result = diff(&graph_v2, &snapshot);
        assert_eq!(result.get(&ResourceAddress::new("net", "vpc")).unwrap().diff_type, DiffType::Replace);

        let subnet = result.get(&ResourceAddress::new("net", "subnet")).unwrap();
        assert_eq!(subnet.diff_type, DiffType::Update);
        assert_eq!(subnet.attributes["vpcId"].to_json(), json!({ "computed": "net/vpc.id" }));
    }

    #[test]
    fn test_changed_dependency_and_attributes_replace() {
        let graph_v1 = graph(vec![network("10.0.0.0/16")
            .with_resource(ResourceNode::new("vpc2", "aws_vpc").with_literal("cidrBlock", "10.9.0.0/16"))]);
        let snapshot = applied(&graph_v1);

        let graph_v2 = graph(vec![Stack::new("net")
            .with_resource(ResourceNode::new("vpc", "aws_vpc").with_literal("cidrBlock", "10.0.0.0/16"))
            .with_resource(
                ResourceNode::new("subnet", "aws_subnet")
                    .with_literal("cidrBlock", "10.0.1.0/24")
                    .with_attribute("vpcId", Reference::local("vpc2", "id")),
            )
            .with_resource(ResourceNode::new("vpc2", "aws_vpc").with_literal("cidrBlock", "10.9.0.0/16"))]);

        let result = diff(&graph_v2, &snapshot);
        let subnet = result.get(&ResourceAddress::new("net", "subnet")).unwrap();
        assert_eq!(subnet.diff_type, DiffType::Replace);
        assert_eq!(subnet.reason, "Attributes and dependencies changed");
    }

    #[test]
    fn test_removed_resource_is_destroyed() {
        let graph_v1 = graph(vec![network("10.0.0.0/16")]);
        let snapshot = applied(&graph_v1);
        let graph_v2 = graph(vec![Stack::new("net")
            .with_resource(ResourceNode::new("vpc", "aws_vpc").with_literal("cidrBlock", "10.0.0.0/16"))]);

        let result = diff(&graph_v2, &snapshot);
        assert_eq!(result.destroys, 1);
        assert_eq!(result.unchanged, 1);
        assert_eq!(result.actionable_diffs()[0].address, ResourceAddress::new("net", "subnet"));
    }
}
