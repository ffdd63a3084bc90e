//! Cross-stack reference resolution.
//!
//! Stacks are resolved in dependency order. Within a stack, resources are
//! resolved in topological order, so every same-stack reference finds its
//! target already resolved. Stack outputs are evaluated once all of the
//! stack's resources are resolved. A reference into a stack that has not
//! completed yet becomes a pending placeholder, which is substituted after
//! each stack completes; any placeholder left at the end is an error.
//!
//! Values that only exist after apply (the `id` of a resource that has never
//! been applied, or any declared output) resolve to a computed marker
//! `{"computed": "<stack>/<id>.<output>"}`.

use super::builder::{Graph, GraphNode};
use super::resource::{AttributeValue, RefTarget, Reference, ResourceAddress};
use crate::error::{GraphError, Result, TerrastackError};
use crate::state::Snapshot;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Maximum nesting of stack outputs that forward other stack outputs.
pub const MAX_OUTPUT_DEPTH: usize = 32;

/// A fully or partially resolved attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResolvedValue {
    /// A concrete value.
    Known(Value),
    /// A value known only after the named resource output is applied.
    Computed {
        /// `<stack>/<id>.<output>` of the producing resource.
        computed: String,
    },
    /// A value waiting on a stack that has not completed resolution.
    Pending {
        /// Textual form of the awaited reference.
        pending: String,
    },
    /// A list containing at least one unknown value.
    List(Vec<ResolvedValue>),
    /// A map containing at least one unknown value.
    Map(BTreeMap<String, ResolvedValue>),
}

impl ResolvedValue {
    /// Builds a list, collapsing to [`ResolvedValue::Known`] when every item is known.
    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        if items.iter().all(Self::is_known) {
            Self::Known(Value::Array(items.into_iter().filter_map(Self::into_known).collect()))
        } else {
            Self::List(items)
        }
    }

    /// Builds a map, collapsing to [`ResolvedValue::Known`] when every entry is known.
    #[must_use]
    pub fn map(entries: BTreeMap<String, Self>) -> Self {
        if entries.values().all(Self::is_known) {
            Self::Known(Value::Object(
                entries
                    .into_iter()
                    .filter_map(|(k, v)| v.into_known().map(|v| (k, v)))
                    .collect(),
            ))
        } else {
            Self::Map(entries)
        }
    }

    /// Returns true if the value is fully concrete.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    /// Returns the concrete value, if fully known.
    #[must_use]
    pub fn into_known(self) -> Option<Value> {
        match self {
            Self::Known(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the concrete value, if fully known.
    #[must_use]
    pub const fn as_known(&self) -> Option<&Value> {
        match self {
            Self::Known(value) => Some(value),
            _ => None,
        }
    }

    /// The first pending placeholder inside this value, if any.
    #[must_use]
    pub fn first_pending(&self) -> Option<&str> {
        match self {
            Self::Pending { pending } => Some(pending),
            Self::List(items) => items.iter().find_map(Self::first_pending),
            Self::Map(entries) => entries.values().find_map(Self::first_pending),
            Self::Known(_) | Self::Computed { .. } => None,
        }
    }

    /// JSON form of the value, with unknowns as their marker objects.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Known(value) => value.clone(),
            Self::Computed { computed } => serde_json::json!({ "computed": computed }),
            Self::Pending { pending } => serde_json::json!({ "pending": pending }),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(entries) => Value::Object(entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
        }
    }
}

/// Resolves every reference marker in `value` through `lookup`.
///
/// # Errors
///
/// Propagates the first error returned by `lookup`.
pub fn resolve_value<F>(value: &AttributeValue, lookup: &mut F) -> Result<ResolvedValue>
where
    F: FnMut(&Reference) -> Result<ResolvedValue>,
{
    Ok(match value {
        AttributeValue::Literal(v) => ResolvedValue::Known(v.clone()),
        AttributeValue::Reference(reference) => lookup(reference)?,
        AttributeValue::List(items) => ResolvedValue::list(
            items
                .iter()
                .map(|item| resolve_value(item, lookup))
                .collect::<Result<_>>()?,
        ),
        AttributeValue::Map(entries) => ResolvedValue::map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), resolve_value(v, lookup)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

/// A resource with its attributes resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
    /// Global address.
    pub address: ResourceAddress,
    /// Resource kind tag.
    pub resource_type: String,
    /// Attributes with references substituted.
    pub attributes: BTreeMap<String, ResolvedValue>,
    /// Outputs recorded for this resource by the last apply.
    pub computed_outputs: BTreeMap<String, Value>,
}

impl ResolvedResource {
    /// Returns true if any attribute still waits on a computed output.
    #[must_use]
    pub fn has_unknowns(&self) -> bool {
        self.attributes.values().any(|v| !v.is_known())
    }
}

/// The result of resolving a graph.
#[derive(Debug, Clone, Default)]
pub struct ResolvedGraph {
    resources: BTreeMap<ResourceAddress, ResolvedResource>,
    stack_outputs: BTreeMap<String, BTreeMap<String, ResolvedValue>>,
    stack_order: Vec<String>,
}

impl ResolvedGraph {
    /// Gets a resolved resource.
    #[must_use]
    pub fn resource(&self, address: &ResourceAddress) -> Option<&ResolvedResource> {
        self.resources.get(address)
    }

    /// All resolved resources by address.
    pub fn resources(&self) -> impl Iterator<Item = &ResolvedResource> {
        self.resources.values()
    }

    /// Resolved outputs of a stack.
    #[must_use]
    pub fn stack_outputs(&self, stack: &str) -> Option<&BTreeMap<String, ResolvedValue>> {
        self.stack_outputs.get(stack)
    }

    /// A single resolved stack output.
    #[must_use]
    pub fn stack_output(&self, stack: &str, output: &str) -> Option<&ResolvedValue> {
        self.stack_outputs.get(stack).and_then(|o| o.get(output))
    }

    /// Stack names in the order they completed resolution.
    #[must_use]
    pub fn resolution_order(&self) -> &[String] {
        &self.stack_order
    }

    /// Re-resolves a node's attributes treating the computed outputs of
    /// `invalidated` resources as unknown.
    ///
    /// Used when an upstream resource will be replaced: values it computed
    /// last time will not survive, so consumers see computed markers again.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnresolvedReference`] if a reference no longer resolves.
    pub fn reresolve(
        &self,
        graph: &Graph,
        node: &GraphNode,
        invalidated: &BTreeSet<ResourceAddress>,
    ) -> Result<BTreeMap<String, ResolvedValue>> {
        let completed: BTreeSet<String> = self.stack_order.iter().cloned().collect();
        let scope = Scope {
            graph,
            resolved: self,
            completed: &completed,
            invalidated,
        };
        scope.resolve_node(node)
    }
}

/// Lookup context over a partially built [`ResolvedGraph`].
struct Scope<'a> {
    graph: &'a Graph,
    resolved: &'a ResolvedGraph,
    completed: &'a BTreeSet<String>,
    invalidated: &'a BTreeSet<ResourceAddress>,
}

impl Scope<'_> {
    fn resolve_node(&self, node: &GraphNode) -> Result<BTreeMap<String, ResolvedValue>> {
        let from = node.address.to_string();
        node.resource
            .attributes
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.resolve(&node.address.stack, &from, value, 0)?)))
            .collect()
    }

    fn resolve_outputs(&self, stack: &str) -> Result<BTreeMap<String, ResolvedValue>> {
        let Some(definition) = self.graph.stack(stack) else {
            return Ok(BTreeMap::new());
        };
        definition
            .outputs
            .iter()
            .map(|(name, value)| {
                let from = format!("{stack}:{name}");
                Ok((name.clone(), self.resolve(stack, &from, value, 0)?))
            })
            .collect()
    }

    fn resolve(&self, owner: &str, from: &str, value: &AttributeValue, depth: usize) -> Result<ResolvedValue> {
        resolve_value(value, &mut |reference| self.lookup(owner, from, reference, depth))
    }

    fn lookup(&self, owner: &str, from: &str, reference: &Reference, depth: usize) -> Result<ResolvedValue> {
        let Some(target) = reference.target(owner) else {
            return Err(GraphError::unresolved(
                from,
                reference.describe(owner),
                "reference names neither a stack nor a resource",
            )
            .into());
        };
        let unresolved =
            |reason: &str| -> TerrastackError { GraphError::unresolved(from, target.to_string(), reason).into() };

        match &target {
            RefTarget::Resource { address, output } => {
                let Some(node) = self.graph.node(address) else {
                    return Err(if self.graph.stack(&address.stack).is_some() {
                        unresolved("resource is not declared in that stack")
                    } else {
                        unresolved("stack is not registered")
                    });
                };
                let Some(resource) = self.resolved.resource(address) else {
                    return Ok(ResolvedValue::Pending {
                        pending: target.to_string(),
                    });
                };

                if let Some(value) = resource.attributes.get(output) {
                    return Ok(value.clone());
                }
                if !self.invalidated.contains(address)
                    && let Some(value) = resource.computed_outputs.get(output)
                {
                    return Ok(ResolvedValue::Known(value.clone()));
                }
                if node.resource.computes(output) {
                    return Ok(ResolvedValue::Computed {
                        computed: target.to_string(),
                    });
                }
                Err(unresolved("resource has no attribute or output with that name"))
            }
            RefTarget::StackOutput { stack, output } => {
                let Some(producer) = self.graph.stack(stack) else {
                    return Err(unresolved("stack is not registered"));
                };
                let Some(expression) = producer.outputs.get(output) else {
                    return Err(unresolved("stack does not declare that output"));
                };
                if stack == owner {
                    return Err(unresolved("a stack cannot consume its own outputs"));
                }
                if !self.completed.contains(stack) {
                    return Ok(ResolvedValue::Pending {
                        pending: target.to_string(),
                    });
                }
                if self.invalidated.is_empty()
                    && let Some(value) = self.resolved.stack_output(stack, output)
                {
                    return Ok(value.clone());
                }
                if depth >= MAX_OUTPUT_DEPTH {
                    return Err(unresolved("stack outputs forward each other too deeply"));
                }
                self.resolve(stack, &format!("{stack}:{output}"), expression, depth + 1)
            }
        }
    }
}

/// Resolves reference markers across stacks in dependency order.
#[derive(Debug, Default)]
pub struct CrossStackResolver<'a> {
    applied: Option<&'a Snapshot>,
}

impl<'a> CrossStackResolver<'a> {
    /// Creates a resolver with no applied outputs: every computed output is unknown.
    #[must_use]
    pub const fn new() -> Self {
        Self { applied: None }
    }

    /// Uses the outputs recorded in `snapshot` for resources applied earlier.
    #[must_use]
    pub const fn with_applied(snapshot: &'a Snapshot) -> Self {
        Self {
            applied: Some(snapshot),
        }
    }

    /// Resolves every resource attribute and stack output in the graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnresolvedReference`] for references to
    /// unregistered stacks, undeclared resources or outputs, and references
    /// still pending once every stack has completed.
    pub fn resolve(&self, graph: &Graph) -> Result<ResolvedGraph> {
        let mut resolved = ResolvedGraph::default();
        let mut completed = BTreeSet::new();
        let invalidated = BTreeSet::new();
        let mut pending_resources: BTreeSet<ResourceAddress> = BTreeSet::new();
        let mut pending_outputs: BTreeSet<String> = BTreeSet::new();

        for (stack_position, stack) in graph
            .stack_order()
            .map(|s| (graph.stack_position(&s.name), s))
        {
            debug!("Resolving stack '{}'", stack.name);

            for node in graph
                .topological_order()
                .filter(|n| Some(n.stack_index) == stack_position)
            {
                let attributes = Scope {
                    graph,
                    resolved: &resolved,
                    completed: &completed,
                    invalidated: &invalidated,
                }
                .resolve_node(node)?;

                if attributes.values().any(|v| v.first_pending().is_some()) {
                    pending_resources.insert(node.address.clone());
                }
                resolved.resources.insert(
                    node.address.clone(),
                    ResolvedResource {
                        address: node.address.clone(),
                        resource_type: node.resource.resource_type.clone(),
                        attributes,
                        computed_outputs: self.applied_outputs(node),
                    },
                );
            }

            let outputs = Scope {
                graph,
                resolved: &resolved,
                completed: &completed,
                invalidated: &invalidated,
            }
            .resolve_outputs(&stack.name)?;
            if outputs.values().any(|v| v.first_pending().is_some()) {
                pending_outputs.insert(stack.name.clone());
            }
            resolved.stack_outputs.insert(stack.name.clone(), outputs);
            resolved.stack_order.push(stack.name.clone());
            completed.insert(stack.name.clone());

            Self::substitute_pending(graph, &mut resolved, &completed, &mut pending_resources, &mut pending_outputs)?;
        }

        if let Some(address) = pending_resources.first() {
            return Err(Self::leftover(address.to_string(), resolved.resource(address).map(|r| &r.attributes)));
        }
        if let Some(stack) = pending_outputs.first() {
            return Err(Self::leftover(stack.clone(), resolved.stack_outputs(stack)));
        }

        info!(
            "Resolved {} resources across {} stacks",
            resolved.resources.len(),
            resolved.stack_order.len()
        );
        Ok(resolved)
    }

    fn applied_outputs(&self, node: &GraphNode) -> BTreeMap<String, Value> {
        self.applied
            .and_then(|s| s.get(&node.address))
            .filter(|entry| entry.resource_type == node.resource.resource_type)
            .map(|entry| entry.outputs.clone())
            .unwrap_or_default()
    }

    /// Re-resolves everything still holding placeholders now that another stack has completed.
    fn substitute_pending(
        graph: &Graph,
        resolved: &mut ResolvedGraph,
        completed: &BTreeSet<String>,
        pending_resources: &mut BTreeSet<ResourceAddress>,
        pending_outputs: &mut BTreeSet<String>,
    ) -> Result<()> {
        let invalidated = BTreeSet::new();

        for address in pending_resources.clone() {
            let Some(node) = graph.node(&address) else {
                continue;
            };
            let attributes = Scope {
                graph,
                resolved,
                completed,
                invalidated: &invalidated,
            }
            .resolve_node(node)?;
            if attributes.values().all(|v| v.first_pending().is_none()) {
                debug!("Substituted pending references of {address}");
                pending_resources.remove(&address);
            }
            if let Some(resource) = resolved.resources.get_mut(&address) {
                resource.attributes = attributes;
            }
        }

        for stack in pending_outputs.clone() {
            let outputs = Scope {
                graph,
                resolved,
                completed,
                invalidated: &invalidated,
            }
            .resolve_outputs(&stack)?;
            if outputs.values().all(|v| v.first_pending().is_none()) {
                pending_outputs.remove(&stack);
            }
            resolved.stack_outputs.insert(stack, outputs);
        }
        Ok(())
    }

    fn leftover(from: String, values: Option<&BTreeMap<String, ResolvedValue>>) -> TerrastackError {
        let target = values
            .and_then(|v| v.values().find_map(ResolvedValue::first_pending))
            .unwrap_or("<unknown>")
            .to_string();
        GraphError::unresolved(from, target, "producing stack never completed resolution").into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, ResourceNode, Stack};
    use crate::state::SnapshotEntry;
    use chrono::Utc;
    use serde_json::json;

    fn net() -> Stack {
        Stack::new("net")
            .with_resource(ResourceNode::new("vpc", "aws_vpc").with_literal("cidrBlock", "10.0.0.0/16"))
            .with_resource(
                ResourceNode::new("subnet", "aws_subnet")
                    .with_literal("cidrBlock", "10.0.1.0/24")
                    .with_attribute("vpcId", Reference::local("vpc", "id"))
                    .with_attribute("vpcCidr", Reference::local("vpc", "cidrBlock")),
            )
            .with_resource_output("subnetId", "subnet", "id")
    }

    fn app() -> Stack {
        Stack::new("app").with_resource(
            ResourceNode::new("endpoint", "aws_vpc_endpoint")
                .with_attribute("subnetIds", AttributeValue::List(vec![Reference::stack_output("net", "subnetId").into()])),
        )
    }

    fn build(stacks: Vec<Stack>) -> Graph {
        let mut builder = GraphBuilder::new();
        for stack in stacks {
            builder.register(stack);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_attribute_references_resolve_to_values() {
        let graph = build(vec![net()]);
        let resolved = CrossStackResolver::new().resolve(&graph).unwrap();

        let subnet = resolved.resource(&ResourceAddress::new("net", "subnet")).unwrap();
        assert_eq!(subnet.attributes["vpcCidr"], ResolvedValue::Known(json!("10.0.0.0/16")));
        assert_eq!(
            subnet.attributes["vpcId"],
            ResolvedValue::Computed {
                computed: "net/vpc.id".into()
            }
        );
        assert!(subnet.has_unknowns());
    }

    #[test]
    fn test_producer_stack_resolved_first_regardless_of_registration() {
        let graph = build(vec![app(), net()]);
        let resolved = CrossStackResolver::new().resolve(&graph).unwrap();
        assert_eq!(resolved.resolution_order(), ["net", "app"]);

        let endpoint = resolved.resource(&ResourceAddress::new("app", "endpoint")).unwrap();
        assert_eq!(
            endpoint.attributes["subnetIds"].to_json(),
            json!([{ "computed": "net/subnet.id" }])
        );
    }

    #[test]
    fn test_applied_outputs_substitute_computed_markers() {
        let graph = build(vec![app(), net()]);
        let mut snapshot = Snapshot::empty();
        for (id, ty, out) in [("vpc", "aws_vpc", "vpc-1"), ("subnet", "aws_subnet", "subnet-1")] {
            snapshot.upsert(
                ResourceAddress::new("net", id),
                SnapshotEntry {
                    resource_type: ty.into(),
                    attributes: BTreeMap::new(),
                    content_hash: String::new(),
                    outputs: BTreeMap::from([("id".to_string(), json!(out))]),
                    depends_on: vec![],
                    applied_at: Utc::now(),
                },
            );
        }

        let resolved = CrossStackResolver::with_applied(&snapshot).resolve(&graph).unwrap();
        let endpoint = resolved.resource(&ResourceAddress::new("app", "endpoint")).unwrap();
        assert_eq!(endpoint.attributes["subnetIds"], ResolvedValue::Known(json!(["subnet-1"])));
        assert_eq!(resolved.stack_output("net", "subnetId"), Some(&ResolvedValue::Known(json!("subnet-1"))));

        let invalidated = BTreeSet::from([ResourceAddress::new("net", "subnet")]);
        let node = graph.node(&ResourceAddress::new("app", "endpoint")).unwrap();
        let again = resolved.reresolve(&graph, node, &invalidated).unwrap();
        assert_eq!(again["subnetIds"].to_json(), json!([{ "computed": "net/subnet.id" }]));
    }

    #[test]
    fn test_unregistered_stack_is_unresolved() {
        let graph = build(vec![app()]);
        match CrossStackResolver::new().resolve(&graph) {
            Err(TerrastackError::Graph(GraphError::UnresolvedReference { from, target, .. })) => {
                assert_eq!(from, "app/endpoint");
                assert_eq!(target, "net:subnetId");
            }
            other => panic!("expected unresolved reference, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_attribute_is_unresolved() {
        let graph = build(vec![Stack::new("net")
            .with_resource(ResourceNode::new("vpc", "aws_vpc"))
            .with_resource(ResourceNode::new("subnet", "aws_subnet").with_attribute("x", Reference::local("vpc", "arn")))]);
        let err = CrossStackResolver::new().resolve(&graph).unwrap_err();
        assert!(err.to_string().contains("net/vpc.arn"));
    }

    #[test]
    fn test_forwarding_chain_within_depth_limit() {
        let mut stacks = vec![net()];
        let mut previous = Reference::stack_output("net", "subnetId");
        for i in 1..MAX_OUTPUT_DEPTH {
            let name = format!("fwd{i}");
            stacks.push(Stack::new(name.clone()).with_output("x", previous));
            previous = Reference::stack_output(name, "x");
        }
        stacks.push(Stack::new("app").with_resource(ResourceNode::new("endpoint", "t").with_attribute("subnet", previous)));
        let graph = build(stacks);
        let resolved = CrossStackResolver::new().resolve(&graph).unwrap();

        let invalidated = BTreeSet::from([ResourceAddress::new("net", "subnet")]);
        let node = graph.node(&ResourceAddress::new("app", "endpoint")).unwrap();
        let again = resolved.reresolve(&graph, node, &invalidated).unwrap();
        assert_eq!(again["subnet"].to_json(), json!({ "computed": "net/subnet.id" }));
    }

    #[test]
    fn test_forwarded_outputs_cycle_rejected() {
        let one = Stack::new("one").with_output("x", Reference::stack_output("two", "y"));
        let two = Stack::new("two").with_output("y", Reference::stack_output("one", "x"));
        let mut builder = GraphBuilder::new();
        builder.register(one).register(two);
        // Stacks that forward each other's outputs form a stack-level cycle.
        assert!(builder.build().is_err());
    }
}
