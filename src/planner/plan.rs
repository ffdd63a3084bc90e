//! Operation lists: the ordered set of changes needed to converge.
//!
//! Operations form a DAG over their prerequisites. The list order is a
//! topological order of that DAG: deletions of removed resources come first
//! (most dependent first), then desired resources in declaration order,
//! reordered only where a prerequisite demands it.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use super::diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
use crate::error::{Result, StateError, TerrastackError};
use crate::graph::{Graph, ResolvedGraph, ResolvedValue, ResourceAddress, topo};
use crate::state::Snapshot;

/// What an operation does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OperationKind {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Destroy the old instance, then create a new one.
    Replace,
    /// Destroy a resource that is no longer desired.
    Destroy,
    /// Nothing to do; the resource is up to date.
    NoOp,
}

impl OperationKind {
    /// Returns true if the operation changes infrastructure.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl From<DiffType> for OperationKind {
    fn from(diff_type: DiffType) -> Self {
        match diff_type {
            DiffType::Create => Self::Create,
            DiffType::Update => Self::Update,
            DiffType::Replace => Self::Replace,
            DiffType::Destroy => Self::Destroy,
            DiffType::NoChange => Self::NoOp,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

/// A single planned operation.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Resource address.
    pub address: ResourceAddress,
    /// Resource kind tag.
    pub resource_type: String,
    /// What to do.
    pub kind: OperationKind,
    /// Attributes as resolved at plan time, empty for destroys.
    pub attributes: BTreeMap<String, ResolvedValue>,
    /// Resources this one depends on: graph edges for desired resources,
    /// the recorded dependencies for destroys.
    pub depends_on: Vec<ResourceAddress>,
    /// Indices of operations that must finish first.
    pub prerequisites: Vec<usize>,
    /// Hash recorded by the last apply.
    pub old_hash: Option<String>,
    /// Hash of the desired content.
    pub new_hash: Option<String>,
    /// Why this operation was planned.
    pub reason: String,
    /// Field-level changes.
    pub details: Vec<DiffDetail>,
}

/// Ordered operations for one session.
#[derive(Debug, Clone, Default)]
pub struct OperationList {
    operations: Vec<Operation>,
    base_version: u64,
}

impl OperationList {
    /// All operations in execution order.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Snapshot version the plan was computed against.
    #[must_use]
    pub const fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if there are no operations at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Gets an operation by index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Operation> {
        self.operations.get(index)
    }

    /// Finds the operation for an address.
    #[must_use]
    pub fn position(&self, address: &ResourceAddress) -> Option<usize> {
        self.operations.iter().position(|op| &op.address == address)
    }

    /// Counts operations of a kind.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }

    /// Returns true if any operation changes infrastructure.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(|op| op.kind.is_change())
    }

    /// Addresses of the operations that must finish before `index`.
    #[must_use]
    pub fn prerequisite_addresses(&self, index: usize) -> Vec<&ResourceAddress> {
        self.operations
            .get(index)
            .map(|op| {
                op.prerequisites
                    .iter()
                    .filter_map(|&p| self.operations.get(p).map(|o| &o.address))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// For each operation, the indices of operations waiting on it.
    #[must_use]
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.operations.len()];
        for (index, op) in self.operations.iter().enumerate() {
            for &prereq in &op.prerequisites {
                dependents[prereq].push(index);
            }
        }
        dependents
    }
}

/// Turns diffs into an ordered operation list.
#[derive(Debug, Default)]
pub struct Planner {
    differ: DiffEngine,
}

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            differ: DiffEngine::new(),
        }
    }

    /// Diffs the resolved graph against the snapshot and orders the result.
    ///
    /// # Errors
    ///
    /// Returns an error if diffing fails, the snapshot's recorded
    /// dependencies form a cycle, or the operations cannot be ordered.
    pub fn plan(&self, graph: &Graph, resolved: &ResolvedGraph, snapshot: &Snapshot) -> Result<OperationList> {
        let diff = self.differ.compute_diff(graph, resolved, snapshot)?;
        Self::order(graph, diff, snapshot)
    }

    /// Orders the operations of a computed diff.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot's recorded dependencies form a cycle
    /// or the operations cannot be ordered.
    pub fn order(graph: &Graph, diff: DiffResult, snapshot: &Snapshot) -> Result<OperationList> {
        let mut by_address: HashMap<ResourceAddress, ResourceDiff> =
            diff.diffs.into_iter().map(|d| (d.address.clone(), d)).collect();

        // Destroys first, most dependent first, then desired resources in declaration order.
        let removed: Vec<ResourceAddress> = Self::snapshot_order(snapshot)?
            .into_iter()
            .rev()
            .filter(|a| !graph.contains(a))
            .collect();
        let provisional: Vec<ResourceAddress> = removed
            .iter()
            .cloned()
            .chain(graph.nodes().iter().map(|n| n.address.clone()))
            .collect();
        let index_of: HashMap<&ResourceAddress, usize> =
            provisional.iter().enumerate().map(|(i, a)| (a, i)).collect();
        let removed_set: BTreeSet<&ResourceAddress> = removed.iter().collect();

        let mut prerequisites: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); provisional.len()];

        for node in graph.nodes() {
            let op = index_of[&node.address];
            for dep in graph.dependencies(&node.address) {
                prerequisites[op].insert(index_of[dep]);
            }
        }

        for address in &removed {
            let op = index_of[address];
            for dependent in snapshot.dependents_of(address) {
                if removed_set.contains(dependent) {
                    prerequisites[op].insert(index_of[dependent]);
                }
            }
        }

        for address in provisional.iter().skip(removed.len()) {
            let replacing = by_address
                .get(address)
                .is_some_and(|d| d.diff_type == DiffType::Replace);
            if replacing {
                let op = index_of[address];
                for dependent in snapshot.dependents_of(address) {
                    if removed_set.contains(dependent) {
                        prerequisites[op].insert(index_of[dependent]);
                    }
                }
            }
        }

        // A surviving resource should drop its reference before the target goes,
        // unless it already waits on the destroy.
        for address in &removed {
            let op = index_of[address];
            for dependent in snapshot.dependents_of(address) {
                if let Some(&survivor) = index_of.get(dependent)
                    && !removed_set.contains(dependent)
                    && !topo::depends_on(&prerequisites, survivor, op)
                {
                    prerequisites[op].insert(survivor);
                }
            }
        }

        let order = topo::stable_order(&prerequisites).map_err(|cycle| {
            let path: Vec<String> = cycle.iter().map(|&i| provisional[i].to_string()).collect();
            TerrastackError::internal(format!("operations form a cycle: {}", path.join(" -> ")))
        })?;
        let mut final_index = vec![0; order.len()];
        for (position, &index) in order.iter().enumerate() {
            final_index[index] = position;
        }

        let mut operations = Vec::with_capacity(order.len());
        for &index in &order {
            let address = &provisional[index];
            let diff = by_address.remove(address).ok_or_else(|| {
                TerrastackError::internal(format!("no diff computed for {address}"))
            })?;
            let depends_on = if diff.diff_type == DiffType::Destroy {
                snapshot.get(address).map(|e| e.depends_on.clone()).unwrap_or_default()
            } else {
                graph.dependencies(address).into_iter().cloned().collect()
            };
            let mut prereqs: Vec<usize> = prerequisites[index].iter().map(|&p| final_index[p]).collect();
            prereqs.sort_unstable();

            debug!("Planned {} for {}", OperationKind::from(diff.diff_type), address);
            operations.push(Operation {
                address: diff.address,
                resource_type: diff.resource_type,
                kind: diff.diff_type.into(),
                attributes: diff.attributes,
                depends_on,
                prerequisites: prereqs,
                old_hash: diff.old_hash,
                new_hash: diff.new_hash,
                reason: diff.reason,
                details: diff.details,
            });
        }

        info!(
            "Planned {} operations ({} create, {} update, {} replace, {} destroy)",
            operations.len(),
            diff.creates,
            diff.updates,
            diff.replaces,
            diff.destroys
        );

        Ok(OperationList {
            operations,
            base_version: snapshot.version,
        })
    }

    /// Orders snapshot addresses so dependencies come before their dependents.
    fn snapshot_order(snapshot: &Snapshot) -> Result<Vec<ResourceAddress>> {
        let addresses: Vec<&ResourceAddress> = snapshot.resources.keys().collect();
        let index_of: HashMap<&ResourceAddress, usize> =
            addresses.iter().enumerate().map(|(i, a)| (*a, i)).collect();
        let prerequisites: Vec<BTreeSet<usize>> = snapshot
            .resources
            .values()
            .map(|entry| entry.depends_on.iter().filter_map(|d| index_of.get(d).copied()).collect())
            .collect();

        let order = topo::stable_order(&prerequisites).map_err(|cycle| {
            let path: Vec<String> = cycle.iter().map(|&i| addresses[i].to_string()).collect();
            StateError::corrupted(format!("recorded dependencies form a cycle: {}", path.join(" -> ")))
        })?;
        Ok(order.into_iter().map(|i| addresses[i].clone()).collect())
    }
}
