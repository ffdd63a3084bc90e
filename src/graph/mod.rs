//! Dependency graph over resources in multiple stacks.
//!
//! This module provides:
//! - The resource model: nodes, reference markers and addresses
//! - Stacks grouping resources with backend and provider configuration
//! - Graph construction with cycle and duplicate detection
//! - Cross-stack reference resolution

mod builder;
mod resolver;
mod resource;
mod stack;
pub mod topo;

pub use builder::{Graph, GraphBuilder, GraphNode};
pub use resolver::{resolve_value, CrossStackResolver, MAX_OUTPUT_DEPTH, ResolvedGraph, ResolvedResource, ResolvedValue};
pub use resource::{AttributeValue, RefTarget, Reference, ResourceAddress, ResourceNode, ID_OUTPUT};
pub use stack::{BackendConfig, ProviderConfig, Stack};
