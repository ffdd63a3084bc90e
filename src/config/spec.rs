//! Configuration specification types.
//!
//! This module defines the structs that map to the `terrastack.yaml` file:
//! project identity, state backend, apply tunables and the stacks themselves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::graph::{AttributeValue, BackendConfig, ProviderConfig, ResourceNode, Stack};
use crate::planner::{DEFAULT_OPERATION_TIMEOUT, DEFAULT_PARALLELISM};
use crate::session::SessionSettings;
use crate::state::{DEFAULT_LOCK_TTL_SECS, LockRetry, generate_holder_id};

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Apply tunables.
    #[serde(default)]
    pub apply: ApplyConfig,
    /// Stacks to manage.
    #[serde(default)]
    pub stacks: Vec<StackConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name; scopes the snapshot and lock.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackendKind,
    /// Base directory for the local backend.
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (AWS default chain if unset).
    #[serde(default)]
    pub region: Option<String>,
    /// Lock namespace for the s3 backend.
    #[serde(default)]
    pub lock_table: Option<String>,
    /// Lock time-to-live in seconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// How long to keep retrying a contended lock, in seconds.
    #[serde(default)]
    pub lock_retry_window_secs: u64,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Apply tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyConfig {
    /// Maximum concurrent operations.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Per-operation timeout in seconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Command line of the external apply engine.
    #[serde(default)]
    pub engine: Option<Vec<String>>,
}

/// A stack as declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Stack name.
    pub name: String,
    /// Provider binding configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Per-stack backend declaration, carried into the plan document.
    #[serde(default)]
    pub backend: Option<BackendConfig>,
    /// Resources in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceNode>,
    /// Stack outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, AttributeValue>,
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_lock_ttl() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

const fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

const fn default_operation_timeout() -> u64 {
    DEFAULT_OPERATION_TIMEOUT.as_secs()
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendKind::default(),
            path: None,
            bucket: None,
            prefix: None,
            region: None,
            lock_table: None,
            lock_ttl_secs: default_lock_ttl(),
            lock_retry_window_secs: 0,
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            operation_timeout_secs: default_operation_timeout(),
            engine: None,
        }
    }
}

impl StateConfig {
    /// Lock retry policy for contended acquisitions.
    #[must_use]
    pub const fn lock_retry(&self) -> LockRetry {
        LockRetry::within(Duration::from_secs(self.lock_retry_window_secs))
    }
}

impl InfraConfig {
    /// Converts the declared stacks into graph stacks, keeping declaration order.
    #[must_use]
    pub fn to_stacks(&self) -> Vec<Stack> {
        self.stacks.iter().map(StackConfig::to_stack).collect()
    }

    /// Session settings derived from the state and apply sections.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            lock_ttl: Duration::from_secs(self.state.lock_ttl_secs),
            parallelism: self.apply.parallelism,
            operation_timeout: Duration::from_secs(self.apply.operation_timeout_secs),
            holder: generate_holder_id(),
        }
    }

    /// Returns the declared stack names.
    #[must_use]
    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(|s| s.name.as_str()).collect()
    }

    /// Total number of declared resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.stacks.iter().map(|s| s.resources.len()).sum()
    }
}

impl StackConfig {
    /// Converts into a graph stack. Resources are copied as declared, so a
    /// repeated id still reaches the graph builder.
    #[must_use]
    pub fn to_stack(&self) -> Stack {
        Stack {
            name: self.name.clone(),
            resources: self.resources.clone(),
            outputs: self.outputs.clone(),
            backend: self.backend.clone().unwrap_or_default(),
            provider: self.provider.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Reference;

    const YAML: &str = r"
project:
  name: shop
stacks:
  - name: net
    provider:
      name: aws
      region: eu-west-1
    resources:
      - id: vpc
        type: aws_vpc
        attributes:
          cidrBlock: 10.0.0.0/16
      - id: subnet
        type: aws_subnet
        attributes:
          vpcId: { refResourceId: vpc, refOutput: id }
    outputs:
      subnetId: { refStack: net, refResourceId: subnet, refOutput: id }
  - name: app
    resources:
      - id: endpoint
        type: aws_apigateway
        outputs: [url]
        attributes:
          subnetId: { refStack: net, refOutput: subnetId }
          tags: { team: payments }
";

    #[test]
    fn test_defaults_and_references() {
        let config: InfraConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackendKind::Local);
        assert_eq!(config.state.lock_ttl_secs, DEFAULT_LOCK_TTL_SECS);
        assert_eq!(config.apply.parallelism, DEFAULT_PARALLELISM);
        assert_eq!(config.stack_names(), ["net", "app"]);
        assert_eq!(config.resource_count(), 3);

        let stacks = config.to_stacks();
        let subnet = stacks[0].resource("subnet").unwrap();
        assert_eq!(subnet.attributes["vpcId"], AttributeValue::from(Reference::local("vpc", "id")));
        assert_eq!(
            stacks[1].resource("endpoint").unwrap().attributes["subnetId"],
            AttributeValue::from(Reference::stack_output("net", "subnetId"))
        );
        assert!(stacks[1].resource("endpoint").unwrap().computes("url"));
        assert_eq!(stacks[0].provider.name, "aws");
    }

    #[test]
    fn test_session_settings() {
        let mut config: InfraConfig = serde_yaml::from_str(YAML).unwrap();
        config.state.lock_ttl_secs = 90;
        config.apply.operation_timeout_secs = 30;
        let settings = config.session_settings();
        assert_eq!(settings.lock_ttl, Duration::from_secs(90));
        assert_eq!(settings.operation_timeout, Duration::from_secs(30));
        assert_eq!(config.state.lock_retry(), LockRetry::within(Duration::ZERO));
    }
}
