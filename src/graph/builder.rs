//! Graph construction from registered stacks.
//!
//! Edges are derived from reference markers only. A reference to a stack
//! output draws edges to every resource the output expression reaches, so a
//! consumer is ordered after the producing resources, not just after the
//! producing stack.

use super::resource::{RefTarget, ResourceAddress, ResourceNode};
use super::stack::Stack;
use super::topo;
use crate::error::{GraphError, Result};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// A resource placed in the graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Global address.
    pub address: ResourceAddress,
    /// Index of the owning stack in registration order.
    pub stack_index: usize,
    /// The resource definition.
    pub resource: ResourceNode,
    /// Indices of the nodes this node depends on.
    pub depends_on: BTreeSet<usize>,
}

/// Accumulates stacks before the graph is built.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    stacks: Vec<Stack>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stack. Registration order does not affect validity.
    pub fn register(&mut self, stack: Stack) -> &mut Self {
        debug!("Registering stack '{}' ({} resources)", stack.name, stack.resources.len());
        self.stacks.push(stack);
        self
    }

    /// Number of registered stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Returns true if no stacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Builds and validates the dependency graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateId`] when two stacks share a name or a
    /// stack declares the same resource id twice, and
    /// [`GraphError::CycleDetected`] when resources or stacks depend on each
    /// other in a loop.
    pub fn build(&self) -> Result<Graph> {
        let stacks = self.stacks.clone();

        let mut stack_index = HashMap::new();
        for (i, stack) in stacks.iter().enumerate() {
            if stack_index.insert(stack.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateId {
                    kind: "stack".to_string(),
                    id: stack.name.clone(),
                }
                .into());
            }
        }

        let mut nodes = Vec::new();
        let mut index = HashMap::new();
        for (s, stack) in stacks.iter().enumerate() {
            for resource in &stack.resources {
                let address = ResourceAddress::new(&stack.name, &resource.id);
                if index.insert(address.clone(), nodes.len()).is_some() {
                    return Err(GraphError::DuplicateId {
                        kind: "resource".to_string(),
                        id: address.to_string(),
                    }
                    .into());
                }
                nodes.push(GraphNode {
                    address,
                    stack_index: s,
                    resource: resource.clone(),
                    depends_on: BTreeSet::new(),
                });
            }
        }

        let mut graph = Graph {
            stacks,
            stack_index,
            nodes,
            index,
            order: Vec::new(),
            stack_order: Vec::new(),
            stack_depends_on: Vec::new(),
        };

        for i in 0..graph.nodes.len() {
            let owner = graph.stacks[graph.nodes[i].stack_index].name.clone();
            let mut edges = BTreeSet::new();
            for reference in graph.nodes[i].resource.references() {
                if let Some(target) = reference.target(&owner) {
                    graph.collect_producers(&target, &mut BTreeSet::new(), &mut edges);
                }
            }
            graph.nodes[i].depends_on = edges;
        }

        let prerequisites: Vec<BTreeSet<usize>> =
            graph.nodes.iter().map(|n| n.depends_on.clone()).collect();
        graph.order = topo::stable_order(&prerequisites).map_err(|cycle| GraphError::CycleDetected {
            cycle: cycle.iter().map(|&i| graph.nodes[i].address.to_string()).collect(),
        })?;

        let mut stack_prereqs = vec![BTreeSet::new(); graph.stacks.len()];
        for node in &graph.nodes {
            for &dep in &node.depends_on {
                let producer = graph.nodes[dep].stack_index;
                if producer != node.stack_index {
                    stack_prereqs[node.stack_index].insert(producer);
                }
            }
        }
        // Stack outputs that only forward other stacks' outputs carry no
        // resource edge, so add those stack edges directly.
        for (s, stack) in graph.stacks.iter().enumerate() {
            for value in stack.outputs.values() {
                for reference in value.references() {
                    if let Some(RefTarget::StackOutput { stack: producer, .. }) =
                        reference.target(&stack.name)
                        && let Some(&p) = graph.stack_index.get(&producer)
                        && p != s
                    {
                        stack_prereqs[s].insert(p);
                    }
                }
            }
        }
        graph.stack_order = topo::stable_order(&stack_prereqs).map_err(|cycle| {
            GraphError::CycleDetected {
                cycle: cycle.iter().map(|&i| graph.stacks[i].name.clone()).collect(),
            }
        })?;
        graph.stack_depends_on = stack_prereqs;

        info!(
            "Built dependency graph: {} stacks, {} resources, {} edges",
            graph.stacks.len(),
            graph.nodes.len(),
            graph.edge_count()
        );
        Ok(graph)
    }
}

/// A validated, acyclic dependency graph over all registered stacks.
#[derive(Debug, Clone)]
pub struct Graph {
    stacks: Vec<Stack>,
    stack_index: HashMap<String, usize>,
    nodes: Vec<GraphNode>,
    index: HashMap<ResourceAddress, usize>,
    order: Vec<usize>,
    stack_order: Vec<usize>,
    stack_depends_on: Vec<BTreeSet<usize>>,
}

impl Graph {
    /// Adds the indices of resources a reference target depends on.
    ///
    /// Unknown targets add nothing; the resolver reports them.
    fn collect_producers(
        &self,
        target: &RefTarget,
        visiting: &mut BTreeSet<(String, String)>,
        edges: &mut BTreeSet<usize>,
    ) {
        match target {
            RefTarget::Resource { address, .. } => {
                if let Some(&i) = self.index.get(address) {
                    edges.insert(i);
                }
            }
            RefTarget::StackOutput { stack, output } => {
                if !visiting.insert((stack.clone(), output.clone())) {
                    return;
                }
                let Some(expr) = self.stack(stack).and_then(|s| s.outputs.get(output)) else {
                    return;
                };
                for reference in expr.references() {
                    if let Some(inner) = reference.target(stack) {
                        self.collect_producers(&inner, visiting, edges);
                    }
                }
            }
        }
    }

    /// Registered stacks in registration order.
    #[must_use]
    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Looks up a stack by name.
    #[must_use]
    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stack_index.get(name).map(|&i| &self.stacks[i])
    }

    /// Index of a stack by name.
    #[must_use]
    pub fn stack_position(&self, name: &str) -> Option<usize> {
        self.stack_index.get(name).copied()
    }

    /// Stacks in dependency order: every stack comes after the stacks it consumes.
    pub fn stack_order(&self) -> impl Iterator<Item = &Stack> {
        self.stack_order.iter().map(|&i| &self.stacks[i])
    }

    /// Names of the stacks a stack consumes outputs or attributes from.
    #[must_use]
    pub fn stack_dependencies(&self, name: &str) -> Vec<&str> {
        self.stack_index.get(name).map_or_else(Vec::new, |&i| {
            self.stack_depends_on[i]
                .iter()
                .map(|&p| self.stacks[p].name.as_str())
                .collect()
        })
    }

    /// All nodes in declaration order (stack registration order, then resource order).
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Looks up a node by address.
    #[must_use]
    pub fn node(&self, address: &ResourceAddress) -> Option<&GraphNode> {
        self.index.get(address).map(|&i| &self.nodes[i])
    }

    /// Declaration index of a node.
    #[must_use]
    pub fn position(&self, address: &ResourceAddress) -> Option<usize> {
        self.index.get(address).copied()
    }

    /// Returns true if the graph contains the address.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.index.contains_key(address)
    }

    /// Nodes in topological order: every node after all nodes it depends on.
    pub fn topological_order(&self) -> impl Iterator<Item = &GraphNode> {
        self.order.iter().map(|&i| &self.nodes[i])
    }

    /// Addresses of the nodes a node depends on, in declaration order.
    #[must_use]
    pub fn dependencies(&self, address: &ResourceAddress) -> Vec<&ResourceAddress> {
        self.node(address).map_or_else(Vec::new, |n| {
            n.depends_on.iter().map(|&d| &self.nodes[d].address).collect()
        })
    }

    /// Every edge as `(dependent, dependency)`, in declaration order.
    pub fn edges(&self) -> impl Iterator<Item = (&ResourceAddress, &ResourceAddress)> {
        self.nodes.iter().flat_map(move |n| {
            n.depends_on
                .iter()
                .map(move |&d| (&n.address, &self.nodes[d].address))
        })
    }

    /// Number of dependency edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.depends_on.len()).sum()
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
