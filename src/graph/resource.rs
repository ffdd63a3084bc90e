//! Resource definitions and reference markers.
//!
//! A [`ResourceNode`] is the atomic unit of desired infrastructure. Its
//! attributes are plain data: literals, nested lists and maps, or explicit
//! [`Reference`] markers pointing at another resource's attribute or output.
//! Dependency edges are discovered by walking these markers, never by
//! evaluating anything.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Output name every resource exposes once applied.
pub const ID_OUTPUT: &str = "id";

/// Globally unique address of a resource: `(stack name, resource id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    /// Name of the owning stack.
    pub stack: String,
    /// Resource id, unique within the stack.
    pub id: String,
}

impl ResourceAddress {
    /// Creates a new address.
    #[must_use]
    pub fn new(stack: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stack, self.id)
    }
}

impl FromStr for ResourceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((stack, id)) if !stack.is_empty() && !id.is_empty() => Ok(Self::new(stack, id)),
            _ => Err(format!("Invalid resource address '{s}', expected <stack>/<id>")),
        }
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}

/// A typed pointer from an attribute to another resource's attribute or output.
///
/// Serialized as `{ refStack, refResourceId, refOutput }`. `refStack` defaults
/// to the referencing resource's own stack. When `refResourceId` is omitted the
/// marker names a stack-level output of `refStack`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Reference {
    /// Producing stack, if different from the referencing one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_stack: Option<String>,
    /// Referenced resource id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_resource_id: Option<String>,
    /// Attribute or output name on the referenced resource or stack.
    pub ref_output: String,
}

/// What a [`Reference`] points at once its owning stack is known.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefTarget {
    /// An attribute or computed output of a resource.
    Resource {
        /// Referenced resource.
        address: ResourceAddress,
        /// Attribute or output name.
        output: String,
    },
    /// A stack-level output.
    StackOutput {
        /// Producing stack.
        stack: String,
        /// Output name.
        output: String,
    },
}

impl Reference {
    /// References an attribute or output of a resource in the same stack.
    #[must_use]
    pub fn local(resource_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            ref_stack: None,
            ref_resource_id: Some(resource_id.into()),
            ref_output: output.into(),
        }
    }

    /// References an attribute or output of a resource in another stack.
    #[must_use]
    pub fn cross_stack(
        stack: impl Into<String>,
        resource_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            ref_stack: Some(stack.into()),
            ref_resource_id: Some(resource_id.into()),
            ref_output: output.into(),
        }
    }

    /// References a stack-level output.
    #[must_use]
    pub fn stack_output(stack: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            ref_stack: Some(stack.into()),
            ref_resource_id: None,
            ref_output: output.into(),
        }
    }

    /// Resolves the marker against the stack that owns it.
    ///
    /// Returns `None` for a marker naming neither a stack nor a resource.
    #[must_use]
    pub fn target(&self, owner_stack: &str) -> Option<RefTarget> {
        match (&self.ref_stack, &self.ref_resource_id) {
            (stack, Some(id)) => Some(RefTarget::Resource {
                address: ResourceAddress::new(stack.as_deref().unwrap_or(owner_stack), id),
                output: self.ref_output.clone(),
            }),
            (Some(stack), None) => Some(RefTarget::StackOutput {
                stack: stack.clone(),
                output: self.ref_output.clone(),
            }),
            (None, None) => None,
        }
    }

    /// Human-readable form used in error messages.
    #[must_use]
    pub fn describe(&self, owner_stack: &str) -> String {
        self.target(owner_stack)
            .map_or_else(|| format!("<malformed>.{}", self.ref_output), |t| t.to_string())
    }
}

impl fmt::Display for RefTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource { address, output } => write!(f, "{address}.{output}"),
            Self::StackOutput { stack, output } => write!(f, "{stack}:{output}"),
        }
    }
}

/// An attribute value: a literal, a reference marker, or a nested structure of either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A reference to another resource's attribute or output.
    Reference(Reference),
    /// A list that may contain references.
    List(Vec<AttributeValue>),
    /// A map that may contain references.
    Map(BTreeMap<String, AttributeValue>),
    /// A scalar literal.
    Literal(Value),
}

impl AttributeValue {
    /// Creates a literal value.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Collects every reference marker contained in this value, depth first.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(reference) => found.push(reference),
            Self::List(items) => items.iter().for_each(|item| item.collect_references(found)),
            Self::Map(entries) => entries.values().for_each(|item| item.collect_references(found)),
            Self::Literal(_) => {}
        }
    }
}

impl From<Reference> for AttributeValue {
    fn from(reference: Reference) -> Self {
        Self::Reference(reference)
    }
}

/// A single piece of desired infrastructure, as supplied by a provider binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Id, unique within the owning stack.
    pub id: String,
    /// Resource kind tag (e.g. `aws_vpc`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Attribute name to literal value or reference.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Names of outputs the provider computes on apply, in addition to `id`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub outputs: BTreeSet<String>,
}

impl ResourceNode {
    /// Creates a resource with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            attributes: BTreeMap::new(),
            outputs: BTreeSet::new(),
        }
    }

    /// Adds (or replaces) an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Adds a literal attribute.
    #[must_use]
    pub fn with_literal(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_attribute(name, AttributeValue::literal(value))
    }

    /// Declares an output computed by the provider on apply.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.insert(name.into());
        self
    }

    /// Returns true if `name` is an output the provider will compute.
    #[must_use]
    pub fn computes(&self, name: &str) -> bool {
        name == ID_OUTPUT || self.outputs.contains(name)
    }

    /// All reference markers in this resource's attributes, in attribute-name order.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        self.attributes
            .values()
            .flat_map(AttributeValue::references)
            .collect()
    }
}
