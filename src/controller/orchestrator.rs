//! Reconciliation orchestrator.
//!
//! Deduplicates reconcile requests per [`RequestKey`] before handing them to
//! the [`ClusterAwareExecutor`]. Each key has at most one task queued or
//! running plus one pending follow-up:
//!
//! - no entry: a task is submitted to the executor
//! - entry queued but not started: the new factory replaces the queued one
//! - entry running: the factory is parked and runs right after the current one
//!
//! Later requests always replace the parked factory, so a burst of N requests
//! against a busy key runs at most twice. Tasks are never cancelled.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::controller::error::{Error, Result};
use crate::controller::executor::ClusterAwareExecutor;
use crate::crd::ClusterKey;
use crate::health::HealthState;

/// What a request reconciles. Locking is per cluster, dedup is per request key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Cluster,
    Partition { name: String },
}

impl RequestKind {
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Cluster => "cluster",
            RequestKind::Partition { .. } => "partition",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub cluster: ClusterKey,
    pub kind: RequestKind,
}

impl RequestKey {
    pub fn cluster(cluster: ClusterKey) -> Self {
        Self {
            cluster,
            kind: RequestKind::Cluster,
        }
    }

    pub fn partition(cluster: ClusterKey, name: impl Into<String>) -> Self {
        Self {
            cluster,
            kind: RequestKind::Partition { name: name.into() },
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RequestKind::Cluster => write!(f, "{}", self.cluster),
            RequestKind::Partition { name } => write!(f, "{} (partition {})", self.cluster, name),
        }
    }
}

/// Per-attempt reconcile state of a request key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// What `submit` did with a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new task was queued on the executor.
    Scheduled,
    /// Parked behind the running task.
    Deferred,
    /// Replaced a factory that had not started yet.
    Coalesced,
}

type TaskFactory = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Slot {
    running: bool,
    next: Option<TaskFactory>,
}

struct Inner {
    executor: ClusterAwareExecutor,
    slots: Mutex<HashMap<RequestKey, Slot>>,
    states: Mutex<HashMap<RequestKey, ReconcileState>>,
    idle: Notify,
    health: Option<Arc<HealthState>>,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<RequestKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn states(&self) -> MutexGuard<'_, HashMap<RequestKey, ReconcileState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, key: &RequestKey, state: ReconcileState) {
        self.states().insert(key.clone(), state);
    }

    fn update_inflight(&self, count: usize) {
        if let Some(health) = &self.health {
            health
                .metrics
                .set_inflight(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }
}

/// Keyed serializer in front of the executor.
#[derive(Clone)]
pub struct ReconciliationOrchestrator {
    inner: Arc<Inner>,
}

impl ReconciliationOrchestrator {
    pub fn new(executor: ClusterAwareExecutor, health: Option<Arc<HealthState>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                slots: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                health,
            }),
        }
    }

    /// Request a reconcile of `key`; `factory` builds the work when it runs.
    pub fn submit<F, Fut>(&self, key: RequestKey, factory: F) -> SubmitOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let factory: TaskFactory = Box::new(move || factory().boxed());
        let (outcome, inflight) = {
            let mut slots = self.inner.slots();
            let outcome = match slots.get_mut(&key) {
                Some(slot) => {
                    let replaced = slot.next.replace(factory).is_some();
                    if slot.running && !replaced {
                        SubmitOutcome::Deferred
                    } else {
                        SubmitOutcome::Coalesced
                    }
                }
                None => {
                    slots.insert(
                        key.clone(),
                        Slot {
                            running: false,
                            next: Some(factory),
                        },
                    );
                    SubmitOutcome::Scheduled
                }
            };
            self.inner.set_state(&key, ReconcileState::Pending);
            (outcome, slots.len())
        };

        self.inner.update_inflight(inflight);

        match outcome {
            SubmitOutcome::Scheduled => schedule(self.inner.clone(), key),
            SubmitOutcome::Coalesced => {
                debug!(request = %key, "Coalesced reconcile request");
                if let Some(health) = &self.inner.health {
                    health.metrics.record_coalesced();
                }
            }
            SubmitOutcome::Deferred => {
                debug!(request = %key, "Reconcile running, follow-up parked");
            }
        }
        outcome
    }

    /// Last known state of `key`.
    pub fn state(&self, key: &RequestKey) -> Option<ReconcileState> {
        self.inner.states().get(key).copied()
    }

    /// Drop bookkeeping for a key whose custom resource was deleted.
    /// Work already queued still runs.
    pub fn forget(&self, key: &RequestKey) {
        self.inner.states().remove(key);
    }

    /// Request keys with work queued or running.
    pub fn inflight(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn is_inflight(&self, key: &RequestKey) -> bool {
        self.inner.slots().contains_key(key)
    }

    /// Wait until no work is queued or running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.slots().is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.slots().is_empty();
            }
        }
    }
}

fn schedule(inner: Arc<Inner>, key: RequestKey) {
    let cluster = key.cluster.clone();
    let task_inner = inner.clone();
    // Completion is tracked through the slot, not the handle
    let _handle = inner
        .executor
        .submit(cluster, move || run_slot(task_inner, key));
}

async fn run_slot(inner: Arc<Inner>, key: RequestKey) {
    let factory = {
        let mut slots = inner.slots();
        match slots.get_mut(&key) {
            Some(slot) => {
                slot.running = true;
                inner.set_state(&key, ReconcileState::Running);
                slot.next.take()
            }
            None => None,
        }
    };

    let mut outcome = None;
    if let Some(factory) = factory {
        let started = Instant::now();
        let result = AssertUnwindSafe(async move { factory().await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed().as_secs_f64();
        outcome = Some(record_result(&inner, &key, result, elapsed));
    }

    let (reschedule, remaining) = {
        let mut slots = inner.slots();
        let reschedule = match slots.get_mut(&key) {
            Some(slot) if slot.next.is_some() => {
                slot.running = false;
                true
            }
            Some(_) => {
                slots.remove(&key);
                false
            }
            None => false,
        };
        // A request that arrived while running already marked the key
        // Pending; a forgotten key stays forgotten.
        if let (false, Some(state)) = (reschedule, outcome)
            && let Some(entry) = inner.states().get_mut(&key)
        {
            *entry = state;
        }
        (reschedule, slots.len())
    };

    inner.update_inflight(remaining);
    if reschedule {
        schedule(inner.clone(), key);
    } else if remaining == 0 {
        inner.idle.notify_waiters();
    }
}

fn record_result(
    inner: &Inner,
    key: &RequestKey,
    result: std::thread::Result<Result<()>>,
    elapsed: f64,
) -> ReconcileState {
    let namespace = key.cluster.namespace.as_str();
    let name = key.cluster.name.as_str();
    let kind = key.kind.label();
    if let Some(health) = &inner.health {
        health.metrics.record_reconcile(namespace, name, kind, elapsed);
    }

    let error_kind = match result {
        Ok(Ok(())) => {
            debug!(request = %key, elapsed, "Reconciliation succeeded");
            if let Some(health) = &inner.health {
                health.touch_last_reconcile();
            }
            return ReconcileState::Succeeded;
        }
        Ok(Err(e @ Error::Validation { .. })) => {
            warn!(request = %key, error = %e, "Spec rejected");
            e.kind()
        }
        Ok(Err(e)) => {
            error!(request = %key, error = %e, retryable = e.is_retryable(), "Reconciliation failed");
            e.kind()
        }
        Err(_) => {
            error!(request = %key, "Reconciliation panicked");
            "panic"
        }
    };

    if let Some(health) = &inner.health {
        health.metrics.record_error(namespace, name, kind, error_kind);
    }
    ReconcileState::Failed
}
