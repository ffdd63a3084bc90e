//! Resource provisioners: the seam between the apply engine and whatever
//! actually talks to a cloud provider.
//!
//! The core never calls a provider API itself. Each operation is handed to a
//! [`ResourceProvisioner`], which returns the outputs the provider computed.

mod command;

pub use command::{EX_TEMPFAIL, ExternalCommandProvisioner};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ResourceApplyError;
use crate::graph::ResourceAddress;
use crate::planner::OperationKind;
use crate::state::SnapshotEntry;

/// Outputs computed by a provider, by name.
pub type Outputs = BTreeMap<String, Value>;

/// A single operation handed to a provisioner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    /// Resource address.
    pub address: ResourceAddress,
    /// Resource kind tag.
    pub resource_type: String,
    /// Planned operation kind.
    pub kind: OperationKind,
    /// Concrete attributes with every reference substituted.
    pub attributes: BTreeMap<String, Value>,
    /// What the last apply recorded for this resource, if anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<SnapshotEntry>,
}

/// Executes resource operations against a provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Creates the resource and returns its computed outputs.
    async fn create(&self, request: &ApplyRequest) -> Result<Outputs, ResourceApplyError>;

    /// Updates the resource in place and returns its computed outputs.
    async fn update(&self, request: &ApplyRequest) -> Result<Outputs, ResourceApplyError>;

    /// Destroys the resource recorded in `request.prior`.
    async fn destroy(&self, request: &ApplyRequest) -> Result<(), ResourceApplyError>;
}
