//! Apply engine for executing operation lists.
//!
//! Operations are dispatched to a bounded pool of tokio tasks as soon as all
//! of their prerequisites have succeeded. A failed operation halts only its
//! dependent subtree; cancellation stops new dispatch and lets in-flight
//! operations finish. Attribute references are substituted at dispatch time
//! from the outputs of operations that already completed.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::lifecycle::{LifecycleEvent, OperationState, TransitionError};
use super::plan::{Operation, OperationKind, OperationList};
use crate::config::ContentHasher;
use crate::error::{ApplyError, GraphError, ResourceApplyError, Result, TerrastackError};
use crate::graph::{
    AttributeValue, Graph, MAX_OUTPUT_DEPTH, RefTarget, ResolvedValue, ResourceAddress, resolve_value,
};
use crate::provisioner::{ApplyRequest, Outputs, ResourceProvisioner};
use crate::state::{SessionHistoryEntry, Snapshot, SnapshotEntry};

/// Default number of operations running at once.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Default per-operation timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Shared switch that stops an apply from dispatching further operations.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Creates a signal that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Returns a receiver observing this signal.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Cancels every apply observing this signal.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Final record of one operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    /// Resource address.
    pub address: ResourceAddress,
    /// Resource kind tag.
    pub resource_type: String,
    /// Planned operation kind.
    pub kind: OperationKind,
    /// Terminal lifecycle state.
    pub state: OperationState,
    /// Failure reported by the provisioner or the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResourceApplyError>,
    /// Concrete attributes sent to the provisioner.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
    /// Outputs the provisioner computed.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: Outputs,
    /// Resources this one depends on.
    pub depends_on: Vec<ResourceAddress>,
    /// For replaces: whether the old instance is already gone.
    pub old_instance_destroyed: bool,
}

/// Result of executing an operation list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    /// One outcome per operation, in operation-list order.
    pub outcomes: Vec<OperationOutcome>,
    /// Whether the apply was cancelled.
    pub cancelled: bool,
}

impl ApplyReport {
    fn with_state(&self, state: OperationState) -> Vec<&OperationOutcome> {
        self.outcomes.iter().filter(|o| o.state == state).collect()
    }

    /// Operations that failed.
    #[must_use]
    pub fn failed(&self) -> Vec<&OperationOutcome> {
        self.with_state(OperationState::Failed)
    }

    /// Operations never started because the apply was cancelled.
    #[must_use]
    pub fn cancelled_operations(&self) -> Vec<&OperationOutcome> {
        self.with_state(OperationState::Cancelled)
    }

    /// Operations never started because a prerequisite did not succeed.
    #[must_use]
    pub fn skipped(&self) -> Vec<&OperationOutcome> {
        self.with_state(OperationState::Skipped)
    }

    /// Number of successful operations that changed infrastructure.
    #[must_use]
    pub fn changed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.kind.is_change() && o.state.is_success())
            .count()
    }

    /// Returns true if every operation reached terminal success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.state.is_success())
    }

    /// Derives the snapshot to write back from the prior one.
    ///
    /// Only operations that reached terminal success change the recorded
    /// state, except a replace whose old instance was destroyed before the
    /// create failed: that resource no longer exists and is dropped.
    #[must_use]
    pub fn next_snapshot(&self, prior: &Snapshot, holder: &str) -> Snapshot {
        let hasher = ContentHasher::new();
        let mut resources = prior.resources.clone();

        for outcome in &self.outcomes {
            match (outcome.kind, outcome.state) {
                (OperationKind::NoOp, OperationState::Applied) => {
                    if let Some(entry) = resources.get_mut(&outcome.address) {
                        entry.depends_on.clone_from(&outcome.depends_on);
                    }
                }
                (_, OperationState::Applied) => {
                    resources.insert(
                        outcome.address.clone(),
                        SnapshotEntry {
                            resource_type: outcome.resource_type.clone(),
                            content_hash: hasher.hash_resource(&outcome.resource_type, &outcome.attributes),
                            attributes: outcome.attributes.clone(),
                            outputs: outcome.outputs.clone(),
                            depends_on: outcome.depends_on.clone(),
                            applied_at: Utc::now(),
                        },
                    );
                }
                (_, OperationState::Destroyed) => {
                    resources.remove(&outcome.address);
                }
                (OperationKind::Replace, _) if outcome.old_instance_destroyed => {
                    resources.remove(&outcome.address);
                }
                _ => {}
            }
        }

        let failed = self.failed().len();
        let history = SessionHistoryEntry {
            timestamp: Utc::now(),
            holder: holder.to_string(),
            version: prior.version + 1,
            changed: self.changed(),
            failed,
            not_run: self.cancelled_operations().len() + self.skipped().len(),
            success: self.is_success(),
        };
        prior.next(resources, history)
    }
}

/// Executes operation lists through a [`ResourceProvisioner`].
pub struct ApplyEngine {
    provisioner: Arc<dyn ResourceProvisioner>,
    parallelism: usize,
    operation_timeout: Duration,
}

impl std::fmt::Debug for ApplyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("parallelism", &self.parallelism)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl ApplyEngine {
    /// Creates an engine with default parallelism and timeout.
    #[must_use]
    pub fn new(provisioner: Arc<dyn ResourceProvisioner>) -> Self {
        Self {
            provisioner,
            parallelism: DEFAULT_PARALLELISM,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Sets the maximum number of concurrent operations (at least one).
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Executes every operation, respecting prerequisites and cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Engine`] if the worker pool itself breaks down.
    /// Individual operation failures are reported in the [`ApplyReport`].
    pub async fn execute(
        &self,
        graph: &Graph,
        operations: &OperationList,
        snapshot: &Snapshot,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ApplyReport> {
        let mut coordinator = Coordinator::new(graph, operations, snapshot)?;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut in_flight = 0usize;
        let mut cancelled = *cancel.borrow_and_update();
        let mut cancel_open = true;

        info!(
            "Applying {} operations (parallelism {})",
            operations.len(),
            self.parallelism
        );

        loop {
            if !cancelled && *cancel.borrow() {
                cancelled = true;
                warn!("Apply cancelled, no further operations will start");
            }

            while !cancelled {
                let Some(&index) = coordinator.ready.first() else {
                    break;
                };
                let kind = coordinator.operations[index].kind;
                if kind.is_change() && in_flight >= self.parallelism {
                    break;
                }
                coordinator.ready.remove(&index);
                coordinator.advance(index, LifecycleEvent::Dispatch)?;

                if !kind.is_change() {
                    coordinator.complete_unchanged(index)?;
                    continue;
                }
                match coordinator.request(index) {
                    Ok(request) => {
                        coordinator.outcomes[index].attributes.clone_from(&request.attributes);
                        self.spawn(index, request, sender.clone());
                        in_flight += 1;
                    }
                    Err(e) => coordinator.fail(index, e)?,
                }
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                Some(done) = receiver.recv() => {
                    in_flight -= 1;
                    coordinator.outcomes[done.index].old_instance_destroyed = done.old_instance_destroyed;
                    match done.result {
                        Ok(outputs) => coordinator.succeed(done.index, outputs)?,
                        Err(e) => coordinator.fail(done.index, e)?,
                    }
                }
                changed = cancel.changed(), if cancel_open && !cancelled => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                }
                else => {
                    return Err(ApplyError::Engine {
                        message: "completion channel closed with operations in flight".to_string(),
                    }
                    .into());
                }
            }
        }

        coordinator.finish(cancelled)
    }

    fn spawn(&self, index: usize, request: ApplyRequest, sender: mpsc::UnboundedSender<Completion>) {
        let provisioner = Arc::clone(&self.provisioner);
        let limit = self.operation_timeout;
        debug!("Dispatching {} for {}", request.kind, request.address);

        tokio::spawn(async move {
            let guard = CompletionGuard {
                index,
                sender: Some(sender),
            };
            let destroyed = AtomicBool::new(false);
            let result = match tokio::time::timeout(limit, perform(provisioner.as_ref(), &request, &destroyed)).await {
                Ok(result) => result,
                Err(_) => Err(ResourceApplyError::retryable(format!(
                    "{} timed out after {}s",
                    request.address,
                    limit.as_secs_f64()
                ))),
            };
            guard.finish(result, destroyed.load(Ordering::SeqCst));
        });
    }
}

/// Runs one operation against the provisioner.
async fn perform(
    provisioner: &dyn ResourceProvisioner,
    request: &ApplyRequest,
    old_destroyed: &AtomicBool,
) -> std::result::Result<Outputs, ResourceApplyError> {
    match request.kind {
        OperationKind::Create => provisioner.create(request).await,
        OperationKind::Update => provisioner.update(request).await,
        OperationKind::Destroy => provisioner.destroy(request).await.map(|()| Outputs::new()),
        OperationKind::Replace => {
            let old = ApplyRequest {
                attributes: request
                    .prior
                    .as_ref()
                    .map(|p| p.attributes.clone())
                    .unwrap_or_default(),
                ..request.clone()
            };
            provisioner.destroy(&old).await?;
            old_destroyed.store(true, Ordering::SeqCst);

            let fresh = ApplyRequest {
                prior: None,
                ..request.clone()
            };
            provisioner.create(&fresh).await
        }
        OperationKind::NoOp => Ok(Outputs::new()),
    }
}

struct Completion {
    index: usize,
    result: std::result::Result<Outputs, ResourceApplyError>,
    old_instance_destroyed: bool,
}

/// Reports a failure for its operation if the worker stops without reporting.
struct CompletionGuard {
    index: usize,
    sender: Option<mpsc::UnboundedSender<Completion>>,
}

impl CompletionGuard {
    fn finish(mut self, result: std::result::Result<Outputs, ResourceApplyError>, old_instance_destroyed: bool) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Completion {
                index: self.index,
                result,
                old_instance_destroyed,
            });
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Completion {
                index: self.index,
                result: Err(ResourceApplyError::permanent("worker stopped before reporting a result")),
                old_instance_destroyed: false,
            });
        }
    }
}

fn engine_error(err: TransitionError) -> TerrastackError {
    ApplyError::Engine {
        message: err.to_string(),
    }
    .into()
}

fn unresolved(from: &str, target: &RefTarget, reason: &str) -> TerrastackError {
    GraphError::unresolved(from, target.to_string(), reason).into()
}

/// Bookkeeping for one run of the engine.
struct Coordinator<'a> {
    graph: &'a Graph,
    snapshot: &'a Snapshot,
    operations: &'a [Operation],
    dependents: Vec<Vec<usize>>,
    index_of: HashMap<&'a ResourceAddress, usize>,
    waiting: Vec<usize>,
    ready: BTreeSet<usize>,
    outcomes: Vec<OperationOutcome>,
}

impl<'a> Coordinator<'a> {
    fn new(graph: &'a Graph, list: &'a OperationList, snapshot: &'a Snapshot) -> Result<Self> {
        let operations = list.operations();
        let outcomes = operations
            .iter()
            .map(|op| -> Result<OperationOutcome> {
                Ok(OperationOutcome {
                    address: op.address.clone(),
                    resource_type: op.resource_type.clone(),
                    kind: op.kind,
                    state: OperationState::Pending
                        .transition(LifecycleEvent::Plan, op.kind)
                        .map_err(engine_error)?,
                    error: None,
                    attributes: BTreeMap::new(),
                    outputs: Outputs::new(),
                    depends_on: op.depends_on.clone(),
                    old_instance_destroyed: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let waiting: Vec<usize> = operations.iter().map(|op| op.prerequisites.len()).collect();
        let ready = (0..operations.len()).filter(|&i| waiting[i] == 0).collect();

        Ok(Self {
            graph,
            snapshot,
            operations,
            dependents: list.dependents(),
            index_of: operations.iter().enumerate().map(|(i, op)| (&op.address, i)).collect(),
            waiting,
            ready,
            outcomes,
        })
    }

    fn advance(&mut self, index: usize, event: LifecycleEvent) -> Result<()> {
        let outcome = &mut self.outcomes[index];
        outcome.state = outcome.state.transition(event, outcome.kind).map_err(engine_error)?;
        Ok(())
    }

    fn complete_unchanged(&mut self, index: usize) -> Result<()> {
        let (attributes, outputs) = self
            .snapshot
            .get(&self.operations[index].address)
            .map(|entry| (entry.attributes.clone(), entry.outputs.clone()))
            .unwrap_or_default();
        self.outcomes[index].attributes = attributes;
        self.succeed(index, outputs)
    }

    fn succeed(&mut self, index: usize, outputs: Outputs) -> Result<()> {
        self.advance(index, LifecycleEvent::Succeed)?;
        let outcome = &mut self.outcomes[index];
        outcome.outputs = outputs;
        if outcome.kind.is_change() {
            info!("{} {}", outcome.address, outcome.state);
        }

        for &dependent in &self.dependents[index] {
            self.waiting[dependent] -= 1;
            if self.waiting[dependent] == 0 && self.outcomes[dependent].state == OperationState::Planned {
                self.ready.insert(dependent);
            }
        }
        Ok(())
    }

    fn fail(&mut self, index: usize, failure: ResourceApplyError) -> Result<()> {
        self.advance(index, LifecycleEvent::Fail)?;
        error!(
            "{} {} failed: {} (retryable: {})",
            self.outcomes[index].kind, self.outcomes[index].address, failure.message, failure.retryable
        );
        self.outcomes[index].error = Some(failure);

        let mut pending = self.dependents[index].clone();
        while let Some(dependent) = pending.pop() {
            if self.outcomes[dependent].state == OperationState::Planned {
                self.advance(dependent, LifecycleEvent::Skip)?;
                self.ready.remove(&dependent);
                warn!(
                    "Skipping {} for {}: a prerequisite failed",
                    self.outcomes[dependent].kind, self.outcomes[dependent].address
                );
                pending.extend(self.dependents[dependent].iter().copied());
            }
        }
        Ok(())
    }

    fn finish(mut self, cancelled: bool) -> Result<ApplyReport> {
        if cancelled {
            for index in 0..self.outcomes.len() {
                if self.outcomes[index].state == OperationState::Planned {
                    self.advance(index, LifecycleEvent::Cancel)?;
                }
            }
        }

        if let Some(stuck) = self.outcomes.iter().find(|o| !o.state.is_terminal()) {
            return Err(ApplyError::Engine {
                message: format!("{} never reached a terminal state ({})", stuck.address, stuck.state),
            }
            .into());
        }

        let report = ApplyReport {
            outcomes: self.outcomes,
            cancelled,
        };
        info!(
            "Apply finished: {} changed, {} failed, {} cancelled, {} skipped",
            report.changed(),
            report.failed().len(),
            report.cancelled_operations().len(),
            report.skipped().len()
        );
        Ok(report)
    }

    /// Builds the provisioner request with every reference substituted.
    fn request(&self, index: usize) -> std::result::Result<ApplyRequest, ResourceApplyError> {
        let op = &self.operations[index];
        let prior = self.snapshot.get(&op.address).cloned();

        let attributes: BTreeMap<String, Value> = if op.kind == OperationKind::Destroy {
            prior.as_ref().map(|p| p.attributes.clone()).unwrap_or_default()
        } else {
            let node = self.graph.node(&op.address).ok_or_else(|| {
                ResourceApplyError::permanent(format!("{} is not in the desired graph", op.address))
            })?;
            node.resource
                .attributes
                .iter()
                .map(|(name, value)| Ok((name.clone(), self.concrete(&op.address.stack, value)?)))
                .collect::<std::result::Result<_, ResourceApplyError>>()?
        };

        Ok(ApplyRequest {
            address: op.address.clone(),
            resource_type: op.resource_type.clone(),
            kind: op.kind,
            attributes,
            prior,
        })
    }

    fn concrete(&self, owner: &str, value: &AttributeValue) -> std::result::Result<Value, ResourceApplyError> {
        self.live_value(owner, value, 0)
            .map_err(|e| ResourceApplyError::permanent(e.to_string()))?
            .into_known()
            .ok_or_else(|| ResourceApplyError::permanent("attribute is still unknown at apply time"))
    }

    fn live_value(&self, owner: &str, value: &AttributeValue, depth: usize) -> Result<ResolvedValue> {
        resolve_value(value, &mut |reference| {
            let Some(target) = reference.target(owner) else {
                return Err(GraphError::unresolved(
                    owner,
                    reference.describe(owner),
                    "reference names neither a stack nor a resource",
                )
                .into());
            };
            match &target {
                RefTarget::Resource { address, output } => self
                    .live_output(address, output)
                    .map(|v| ResolvedValue::Known(v.clone()))
                    .ok_or_else(|| unresolved(owner, &target, "value is not available after apply")),
                RefTarget::StackOutput { stack, output } => {
                    let expression = self
                        .graph
                        .stack(stack)
                        .and_then(|s| s.outputs.get(output))
                        .ok_or_else(|| unresolved(owner, &target, "stack does not declare that output"))?;
                    if depth >= MAX_OUTPUT_DEPTH {
                        return Err(unresolved(owner, &target, "stack outputs forward each other too deeply"));
                    }
                    self.live_value(stack, expression, depth + 1)
                }
            }
        })
    }

    fn live_output(&self, address: &ResourceAddress, output: &str) -> Option<&Value> {
        let outcome = &self.outcomes[*self.index_of.get(address)?];
        if !outcome.state.is_success() {
            return None;
        }
        outcome
            .attributes
            .get(output)
            .or_else(|| outcome.outputs.get(output))
    }
}
