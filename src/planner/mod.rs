//! Planning and apply for infrastructure operations.
//!
//! This module compares the resolved desired graph with the last applied
//! snapshot, orders the resulting operations, serializes them into a plan
//! document and executes them through a provisioner.

mod diff;
mod executor;
mod lifecycle;
mod plan;
mod synth;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{
    ApplyEngine, ApplyReport, CancelSignal, DEFAULT_OPERATION_TIMEOUT, DEFAULT_PARALLELISM, OperationOutcome,
};
pub use lifecycle::{LifecycleEvent, OperationState, TransitionError};
pub use plan::{Operation, OperationKind, OperationList, Planner};
pub use synth::{
    PLAN_FORMAT_VERSION, PlanDocument, PlanEdge, PlanNode, PlanOperation, PlanStack, PlanSummary, Synthesizer,
};
