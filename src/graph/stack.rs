//! Stacks: named groups of resources sharing a state backend and provider configuration.

use super::resource::{AttributeValue, Reference, ResourceNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Where a stack's snapshot lives, as declared by the stack author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Bucket holding remote state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Object key of the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Storage region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Lock table or lock namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_table: Option<String>,
}

/// Provider binding configuration for a stack.
///
/// Opaque to the planner apart from `name`; carried through to the plan document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name (e.g. `aws`).
    #[serde(default)]
    pub name: String,
    /// Remaining provider settings (region, profile, ...).
    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

impl ProviderConfig {
    /// Creates a provider configuration with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: BTreeMap::new(),
        }
    }

    /// Adds a provider setting.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// A named group of resources.
///
/// Resources keep their declaration order. Declaring a resource id a second
/// time replaces the earlier definition in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    /// Stack name, unique within a session.
    pub name: String,
    /// Resources in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceNode>,
    /// Stack-level outputs other stacks may reference.
    #[serde(default)]
    pub outputs: BTreeMap<String, AttributeValue>,
    /// State backend declaration.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Provider binding configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl Stack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declares a resource. An existing resource with the same id is replaced in place.
    #[must_use]
    pub fn with_resource(mut self, resource: ResourceNode) -> Self {
        self.declare(resource);
        self
    }

    /// Declares a resource on a borrowed stack.
    pub fn declare(&mut self, resource: ResourceNode) {
        match self.resources.iter_mut().find(|r| r.id == resource.id) {
            Some(existing) => *existing = resource,
            None => self.resources.push(resource),
        }
    }

    /// Declares a stack output.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    /// Declares a stack output exposing a resource attribute or computed output of this stack.
    #[must_use]
    pub fn with_resource_output(
        self,
        name: impl Into<String>,
        resource_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        let reference = Reference::cross_stack(self.name.clone(), resource_id, output);
        self.with_output(name, reference)
    }

    /// Sets the backend declaration.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the provider configuration.
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }

    /// Looks up a resource by id.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&ResourceNode> {
        self.resources.iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redeclare_replaces_in_place() {
        let stack = Stack::new("net")
            .with_resource(ResourceNode::new("vpc", "aws_vpc").with_literal("cidrBlock", "10.0.0.0/16"))
            .with_resource(ResourceNode::new("igw", "aws_internet_gateway"))
            .with_resource(ResourceNode::new("vpc", "aws_vpc").with_literal("cidrBlock", "10.1.0.0/16"));

        let ids: Vec<_> = stack.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["vpc", "igw"]);
        assert_eq!(
            stack.resource("vpc").unwrap().attributes["cidrBlock"],
            AttributeValue::literal("10.1.0.0/16")
        );
    }

    #[test]
    fn test_resource_output_points_at_own_stack() {
        let stack = Stack::new("net").with_resource_output("subnetId", "subnet", "id");
        match &stack.outputs["subnetId"] {
            AttributeValue::Reference(r) => {
                assert_eq!(r.ref_stack.as_deref(), Some("net"));
                assert_eq!(r.ref_resource_id.as_deref(), Some("subnet"));
            }
            other => panic!("unexpected output value {other:?}"),
        }
    }

    #[test]
    fn test_provider_settings_flatten() {
        let provider: ProviderConfig =
            serde_yaml::from_str("name: aws\nregion: eu-west-1\nprofile: ops\n").unwrap();
        assert_eq!(provider.name, "aws");
        assert_eq!(provider.settings["region"], Value::from("eu-west-1"));
        assert_eq!(provider.settings.len(), 2);
    }
}
