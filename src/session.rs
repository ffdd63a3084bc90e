//! Session orchestration.
//!
//! A [`Session`] collects stacks for one project and environment, then runs
//! plan or apply against a [`StateBackend`]: the graph is built first, the
//! lock is acquired, the snapshot is read and diffed, operations run, the
//! snapshot is written back once, and the lock is always released.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};

use crate::error::{EXIT_OPERATIONS_FAILED, EXIT_SUCCESS, Result};
use crate::graph::{CrossStackResolver, Graph, GraphBuilder, Stack};
use crate::planner::{
    ApplyEngine, ApplyReport, CancelSignal, DEFAULT_OPERATION_TIMEOUT, DEFAULT_PARALLELISM, OperationList,
    PlanDocument, Planner, Synthesizer,
};
use crate::provisioner::ResourceProvisioner;
use crate::state::{BackendKey, DEFAULT_LOCK_TTL_SECS, LockToken, Snapshot, StateBackend, generate_holder_id};

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Lock time-to-live; the lock is renewed at a third of this during apply.
    pub lock_ttl: Duration,
    /// Maximum concurrent operations.
    pub parallelism: usize,
    /// Per-operation timeout.
    pub operation_timeout: Duration,
    /// Lock holder identity.
    pub holder: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            parallelism: DEFAULT_PARALLELISM,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            holder: generate_holder_id(),
        }
    }
}

/// Result of a plan.
#[derive(Debug)]
pub struct PlanOutcome {
    /// The validated graph.
    pub graph: Graph,
    /// Ordered operations.
    pub operations: OperationList,
    /// Serialized plan.
    pub document: PlanDocument,
}

/// Result of an apply.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    /// The plan that was executed.
    pub plan: PlanDocument,
    /// Per-operation outcomes.
    pub report: ApplyReport,
    /// Snapshot version after the session.
    pub snapshot_version: u64,
    /// Whether a new snapshot was written.
    pub snapshot_written: bool,
}

impl SessionReport {
    /// Maps the outcome onto a session exit code.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.report.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_OPERATIONS_FAILED
        }
    }
}

/// One plan or apply run for a project and environment.
#[derive(Debug)]
pub struct Session {
    project: String,
    environment: String,
    builder: GraphBuilder,
    settings: SessionSettings,
    cancel: CancelSignal,
}

impl Session {
    /// Creates a session with default settings.
    #[must_use]
    pub fn new(project: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
            builder: GraphBuilder::new(),
            settings: SessionSettings::default(),
            cancel: CancelSignal::new(),
        }
    }

    /// Replaces the session settings.
    #[must_use]
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Registers a stack.
    pub fn register(&mut self, stack: Stack) -> &mut Self {
        self.builder.register(stack);
        self
    }

    /// Session settings.
    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Signal that stops an apply from dispatching further operations.
    #[must_use]
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Key the session's snapshot and lock live under.
    #[must_use]
    pub fn backend_key(&self) -> BackendKey {
        BackendKey::new(&self.project, &self.environment)
    }

    /// Builds and validates the graph. Runs before any lock is taken.
    ///
    /// # Errors
    ///
    /// Returns a structural [`crate::error::GraphError`].
    pub fn build(&self) -> Result<Graph> {
        self.builder.build()
    }

    /// Computes the plan under the lock without applying it.
    ///
    /// # Errors
    ///
    /// Returns structural errors before locking, lock contention, backend
    /// failures and unresolved references.
    pub async fn plan<B: StateBackend + ?Sized>(&self, backend: &B) -> Result<PlanOutcome> {
        let graph = self.build()?;
        let key = self.backend_key();
        let token = self.lock(backend, &key).await?;

        let result = self.prepare(backend, &key, &graph).await;
        Self::unlock(backend, &key, &token).await;

        let (_, operations, document) = result?;
        Ok(PlanOutcome {
            graph,
            operations,
            document,
        })
    }

    /// Plans and applies, then writes the snapshot back.
    ///
    /// # Errors
    ///
    /// Returns structural errors before locking, lock contention, backend
    /// failures, and [`crate::error::StateError::StaleWrite`] if the lock was
    /// lost before the snapshot could be written. Per-operation failures are
    /// reported in the [`SessionReport`].
    pub async fn apply<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        provisioner: Arc<dyn ResourceProvisioner>,
    ) -> Result<SessionReport> {
        let graph = self.build()?;
        let key = self.backend_key();
        let token = self.lock(backend, &key).await?;

        let result = self.apply_locked(backend, &key, &token, &graph, provisioner).await;
        Self::unlock(backend, &key, &token).await;
        result
    }

    async fn lock<B: StateBackend + ?Sized>(&self, backend: &B, key: &BackendKey) -> Result<LockToken> {
        debug!("Acquiring {} lock on {key}", backend.backend_type());
        backend
            .acquire_lock(key, &self.settings.holder, self.settings.lock_ttl)
            .await
    }

    async fn unlock<B: StateBackend + ?Sized>(backend: &B, key: &BackendKey, token: &LockToken) {
        if let Err(e) = backend.release_lock(key, token).await {
            warn!("Failed to release lock on {key}, it will expire on its own: {e}");
        }
    }

    async fn prepare<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &BackendKey,
        graph: &Graph,
    ) -> Result<(Snapshot, OperationList, PlanDocument)> {
        let snapshot = backend.read_snapshot(key).await?;
        debug!("Read snapshot v{} with {} resources", snapshot.version, snapshot.len());

        let resolved = CrossStackResolver::with_applied(&snapshot).resolve(graph)?;
        let operations = Planner::new().plan(graph, &resolved, &snapshot)?;
        let document = Synthesizer::new(&self.project, &self.environment).synthesize(graph, &operations);
        Ok((snapshot, operations, document))
    }

    async fn apply_locked<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &BackendKey,
        token: &LockToken,
        graph: &Graph,
        provisioner: Arc<dyn ResourceProvisioner>,
    ) -> Result<SessionReport> {
        let (snapshot, operations, document) = self.prepare(backend, key, graph).await?;

        let engine = ApplyEngine::new(provisioner)
            .with_parallelism(self.settings.parallelism)
            .with_operation_timeout(self.settings.operation_timeout);
        let execution = engine.execute(graph, &operations, &snapshot, self.cancel.subscribe());
        tokio::pin!(execution);

        let every = (self.settings.lock_ttl / 3).max(Duration::from_secs(1));
        let mut renewal = interval_at(Instant::now() + every, every);
        let report = loop {
            tokio::select! {
                report = &mut execution => break report?,
                _ = renewal.tick() => match backend.renew_lock(key, token).await {
                    Ok(lock) => debug!("Renewed lock on {key} until {}", lock.expires_at),
                    Err(e) => {
                        error!("Lost the lock on {key}, stopping dispatch: {e}");
                        self.cancel.cancel();
                    }
                },
            }
        };

        let destroyed_old = report.outcomes.iter().any(|o| o.old_instance_destroyed);
        let (snapshot_version, snapshot_written) = if report.changed() > 0 || destroyed_old {
            let next = report.next_snapshot(&snapshot, &self.settings.holder);
            backend.write_snapshot(key, token, &next).await?;
            info!("Wrote snapshot v{} for {key}", next.version);
            (next.version, true)
        } else {
            info!("No changes applied, snapshot v{} left as is", snapshot.version);
            (snapshot.version, false)
        };

        Ok(SessionReport {
            plan: document,
            report,
            snapshot_version,
            snapshot_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EXIT_LOCK_CONTENTION, ResourceApplyError, StateError, TerrastackError};
    use crate::graph::{Reference, ResourceAddress, ResourceNode};
    use crate::planner::OperationKind;
    use crate::provisioner::{ApplyRequest, Outputs};
    use crate::state::MemoryStateBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail: BTreeSet<String>,
    }

    impl Recorder {
        fn record(&self, action: &str, request: &ApplyRequest) -> std::result::Result<Outputs, ResourceApplyError> {
            self.calls.lock().unwrap().push(format!("{action} {}", request.address));
            if self.fail.contains(&request.address.id) {
                return Err(ResourceApplyError::permanent("denied"));
            }
            Ok(Outputs::from([("id".to_string(), json!(format!("{}-id", request.address.id)))]))
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResourceProvisioner for Recorder {
        async fn create(&self, request: &ApplyRequest) -> std::result::Result<Outputs, ResourceApplyError> {
            self.record("create", request)
        }

        async fn update(&self, request: &ApplyRequest) -> std::result::Result<Outputs, ResourceApplyError> {
            self.record("update", request)
        }

        async fn destroy(&self, request: &ApplyRequest) -> std::result::Result<(), ResourceApplyError> {
            self.record("destroy", request).map(|_| ())
        }
    }

    fn network() -> Stack {
        Stack::new("net")
            .with_resource(ResourceNode::new("vpc", "aws_vpc").with_literal("cidrBlock", "10.0.0.0/16"))
            .with_resource(
                ResourceNode::new("subnet", "aws_subnet")
                    .with_literal("cidrBlock", "10.0.1.0/24")
                    .with_attribute("vpcId", Reference::local("vpc", "id")),
            )
            .with_resource_output("subnetId", "subnet", "id")
    }

    fn app() -> Stack {
        Stack::new("app").with_resource(
            ResourceNode::new("endpoint", "aws_apigateway").with_attribute("subnetId", Reference::stack_output("net", "subnetId")),
        )
    }

    #[tokio::test]
    async fn test_net_app_end_to_end() {
        let backend = MemoryStateBackend::new();

        // App is registered first; the producing stack still applies first.
        let mut first = Session::new("shop", "dev");
        first.register(app()).register(network());
        let provisioner = Arc::new(Recorder::default());
        let report = first.apply(&backend, provisioner.clone()).await.unwrap();

        assert_eq!(report.exit_code(), EXIT_SUCCESS);
        assert_eq!(
            provisioner.calls(),
            ["create net/vpc", "create net/subnet", "create app/endpoint"]
        );
        assert!(report.snapshot_written);
        assert_eq!(report.snapshot_version, 1);

        let key = first.backend_key();
        let snapshot = backend.read_snapshot(&key).await.unwrap();
        assert_eq!(snapshot.len(), 3);
        let endpoint = snapshot.get(&ResourceAddress::new("app", "endpoint")).unwrap();
        assert_eq!(endpoint.attributes["subnetId"], json!("subnet-id"));
        assert!(backend.lock_info(&key).await.unwrap().is_none());

        // Drop the app stack and the subnet.
        let mut second = Session::new("shop", "dev");
        second.register(
            Stack::new("net").with_resource(ResourceNode::new("vpc", "aws_vpc").with_literal("cidrBlock", "10.0.0.0/16")),
        );
        let plan = second.plan(&backend).await.unwrap();
        let kinds: Vec<(String, OperationKind)> = plan
            .operations
            .operations()
            .iter()
            .map(|op| (op.address.to_string(), op.kind))
            .collect();
        assert_eq!(
            kinds,
            [
                ("app/endpoint".to_string(), OperationKind::Destroy),
                ("net/subnet".to_string(), OperationKind::Destroy),
                ("net/vpc".to_string(), OperationKind::NoOp),
            ]
        );

        let provisioner = Arc::new(Recorder::default());
        let report = second.apply(&backend, provisioner.clone()).await.unwrap();
        assert_eq!(provisioner.calls(), ["destroy app/endpoint", "destroy net/subnet"]);
        assert_eq!(report.snapshot_version, 2);
        assert_eq!(backend.read_snapshot(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_apply_writes_nothing() {
        let backend = MemoryStateBackend::new();
        let mut session = Session::new("shop", "dev");
        session.register(network());
        session.apply(&backend, Arc::new(Recorder::default())).await.unwrap();

        let idle = Arc::new(Recorder::default());
        let report = session.apply(&backend, idle.clone()).await.unwrap();
        assert!(!report.snapshot_written);
        assert_eq!(report.snapshot_version, 1);
        assert!(idle.calls().is_empty());
        assert!(!report.plan.has_changes());
    }

    #[tokio::test]
    async fn test_lock_contention_maps_to_exit_code() {
        let backend = MemoryStateBackend::new();
        let mut session = Session::new("shop", "dev");
        session.register(network());
        backend
            .acquire_lock(&session.backend_key(), "someone-else", Duration::from_secs(60))
            .await
            .unwrap();

        let err = session.plan(&backend).await.unwrap_err();
        assert!(matches!(err, TerrastackError::State(StateError::LockContention { .. })));
        assert_eq!(err.exit_code(), EXIT_LOCK_CONTENTION);
    }

    #[tokio::test]
    async fn test_structural_error_never_locks() {
        let backend = MemoryStateBackend::new();
        let mut session = Session::new("shop", "dev");
        session.register(
            Stack::new("s")
                .with_resource(ResourceNode::new("a", "t").with_attribute("x", Reference::local("b", "id")))
                .with_resource(ResourceNode::new("b", "t").with_attribute("x", Reference::local("a", "id"))),
        );

        let err = session.apply(&backend, Arc::new(Recorder::default())).await.unwrap_err();
        assert!(err.is_structural());
        assert!(backend.lock_info(&session.backend_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_records_successes_only() {
        let backend = MemoryStateBackend::new();
        let mut session = Session::new("shop", "dev");
        session.register(network());
        let provisioner = Arc::new(Recorder {
            fail: BTreeSet::from(["subnet".to_string()]),
            ..Recorder::default()
        });

        let report = session.apply(&backend, provisioner).await.unwrap();
        assert_eq!(report.exit_code(), EXIT_OPERATIONS_FAILED);
        assert_eq!(report.report.failed().len(), 1);

        let snapshot = backend.read_snapshot(&session.backend_key()).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&ResourceAddress::new("net", "vpc")).is_some());
        assert!(!snapshot.history[0].success);
    }
}
