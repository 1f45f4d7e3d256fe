//! Watch adapters and periodic sweeps.
//!
//! Watch events on both custom resource kinds are translated into reconcile
//! requests for the orchestrator. The translation is pure so it can be tested
//! without an API server; the loops only pump events through it. A periodic
//! sweep re-requests every custom resource in the namespace so failed or
//! missed work is retried.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, ResourceExt};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::controller::cluster_reconciler::reconcile_cluster;
use crate::controller::context::Context;
use crate::controller::orchestrator::{
    ReconciliationOrchestrator, RequestKey, RequestKind, SubmitOutcome,
};
use crate::controller::partition_reconciler::reconcile_partition;
use crate::crd::{RabbitMQCustomResource, RabbitMQNetworkPartitionCustomResource};

/// What a watch event asks of the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchAction {
    Reconcile(RequestKey),
    /// The custom resource is gone; drop its bookkeeping.
    Forget(RequestKey),
}

/// Last generation seen per request key.
///
/// Status writes do not bump `metadata.generation`, so the operator's own
/// status patches do not trigger another reconcile.
#[derive(Debug, Default)]
pub struct GenerationTracker {
    seen: HashMap<RequestKey, Option<i64>>,
}

impl GenerationTracker {
    /// Record `generation` for `key`; true when it differs from the last one seen.
    pub fn changed(&mut self, key: &RequestKey, generation: Option<i64>) -> bool {
        match self.seen.insert(key.clone(), generation) {
            Some(previous) => previous != generation || generation.is_none(),
            None => true,
        }
    }

    pub fn remove(&mut self, key: &RequestKey) {
        self.seen.remove(key);
    }
}

fn cluster_request(resource: &RabbitMQCustomResource) -> Option<RequestKey> {
    resource.cluster_key().map(RequestKey::cluster)
}

fn partition_request(partition: &RabbitMQNetworkPartitionCustomResource) -> Option<RequestKey> {
    partition
        .cluster_key()
        .map(|cluster| RequestKey::partition(cluster, partition.name_any()))
}

/// Translate a cluster CR watch event.
pub fn cluster_event_actions(
    event: &watcher::Event<RabbitMQCustomResource>,
    tracker: &mut GenerationTracker,
) -> Vec<WatchAction> {
    match event {
        watcher::Event::Apply(resource) | watcher::Event::InitApply(resource) => {
            let Some(key) = cluster_request(resource) else {
                return Vec::new();
            };
            if resource.metadata.deletion_timestamp.is_some()
                || !tracker.changed(&key, resource.metadata.generation)
            {
                return Vec::new();
            }
            vec![WatchAction::Reconcile(key)]
        }
        watcher::Event::Delete(resource) => match cluster_request(resource) {
            Some(key) => {
                tracker.remove(&key);
                vec![WatchAction::Forget(key)]
            }
            None => Vec::new(),
        },
        watcher::Event::Init | watcher::Event::InitDone => Vec::new(),
    }
}

/// Translate a partition CR watch event.
///
/// Deleting a partition also re-requests its cluster, whose replica count and
/// `PartitionHealing` condition are no longer held by the recovery.
pub fn partition_event_actions(
    event: &watcher::Event<RabbitMQNetworkPartitionCustomResource>,
    tracker: &mut GenerationTracker,
) -> Vec<WatchAction> {
    match event {
        watcher::Event::Apply(partition) | watcher::Event::InitApply(partition) => {
            let Some(key) = partition_request(partition) else {
                return Vec::new();
            };
            if partition.metadata.deletion_timestamp.is_some()
                || !tracker.changed(&key, partition.metadata.generation)
            {
                return Vec::new();
            }
            vec![WatchAction::Reconcile(key)]
        }
        watcher::Event::Delete(partition) => match partition_request(partition) {
            Some(key) => {
                tracker.remove(&key);
                let cluster = RequestKey::cluster(key.cluster.clone());
                vec![WatchAction::Forget(key), WatchAction::Reconcile(cluster)]
            }
            None => Vec::new(),
        },
        watcher::Event::Init | watcher::Event::InitDone => Vec::new(),
    }
}

/// Requests issued by one sweep, skipping resources being deleted.
pub fn sweep_requests(
    clusters: &[RabbitMQCustomResource],
    partitions: &[RabbitMQNetworkPartitionCustomResource],
) -> Vec<RequestKey> {
    let clusters = clusters
        .iter()
        .filter(|c| c.metadata.deletion_timestamp.is_none())
        .filter_map(|c| {
            let key = cluster_request(c);
            if key.is_none() {
                warn!(name = %c.name_any(), "Skipping cluster without namespace");
            }
            key
        });
    let partitions = partitions
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter_map(|p| {
            let key = partition_request(p);
            if key.is_none() {
                warn!(name = %p.name_any(), "Skipping partition without namespace");
            }
            key
        });
    clusters.chain(partitions).collect()
}

/// Hands reconcile requests to the orchestrator with the matching reconciler.
#[derive(Clone)]
pub struct Dispatcher {
    orchestrator: ReconciliationOrchestrator,
    ctx: Arc<Context>,
}

impl Dispatcher {
    pub fn new(orchestrator: ReconciliationOrchestrator, ctx: Arc<Context>) -> Self {
        Self { orchestrator, ctx }
    }

    pub fn orchestrator(&self) -> &ReconciliationOrchestrator {
        &self.orchestrator
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn dispatch(&self, action: WatchAction) {
        match action {
            WatchAction::Reconcile(key) => {
                self.request(key);
            }
            WatchAction::Forget(key) => {
                debug!(request = %key, "Custom resource deleted, forgetting");
                self.orchestrator.forget(&key);
            }
        }
    }

    /// Submit a reconcile of `key`.
    pub fn request(&self, key: RequestKey) -> SubmitOutcome {
        let ctx = self.ctx.clone();
        let request = key.clone();
        self.orchestrator.submit(key, move || async move {
            match request.kind {
                RequestKind::Cluster => reconcile_cluster(request.cluster, ctx).await,
                RequestKind::Partition { name } => {
                    reconcile_partition(request.cluster, name, ctx).await
                }
            }
        })
    }
}

fn watcher_config() -> watcher::Config {
    watcher::Config::default().any_semantic()
}

/// Watch cluster CRs until the stream ends.
///
/// Watch errors are logged; the watcher re-establishes itself with
/// exponential backoff.
pub async fn run_cluster_watch(api: Api<RabbitMQCustomResource>, dispatcher: Dispatcher) {
    info!("Starting RabbitMQCustomResource watch");
    let mut tracker = GenerationTracker::default();
    let mut events = watcher(api, watcher_config()).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                for action in cluster_event_actions(&event, &mut tracker) {
                    dispatcher.dispatch(action);
                }
            }
            Err(e) => warn!(error = %e, "RabbitMQCustomResource watch error, retrying with backoff"),
        }
    }
    warn!("RabbitMQCustomResource watch ended");
}

/// Watch partition CRs until the stream ends.
pub async fn run_partition_watch(
    api: Api<RabbitMQNetworkPartitionCustomResource>,
    dispatcher: Dispatcher,
) {
    info!("Starting RabbitMQNetworkPartitionCustomResource watch");
    let mut tracker = GenerationTracker::default();
    let mut events = watcher(api, watcher_config()).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                for action in partition_event_actions(&event, &mut tracker) {
                    dispatcher.dispatch(action);
                }
            }
            Err(e) => warn!(error = %e, "Partition watch error, retrying with backoff"),
        }
    }
    warn!("Partition watch ended");
}

/// Request a reconcile of every custom resource in the watched namespace.
///
/// A failed list is logged and the other kind is still swept.
pub async fn sweep_once(dispatcher: &Dispatcher) -> usize {
    let ctx = dispatcher.context();
    let namespace = &ctx.config.namespace;

    let clusters = ctx
        .apis
        .clusters
        .list(namespace, None)
        .await
        .unwrap_or_else(|e| {
            warn!(namespace = %namespace, error = %e, "Sweep could not list clusters");
            Vec::new()
        });
    let partitions = ctx
        .apis
        .partitions
        .list(namespace, None)
        .await
        .unwrap_or_else(|e| {
            warn!(namespace = %namespace, error = %e, "Sweep could not list partitions");
            Vec::new()
        });

    let requests = sweep_requests(&clusters, &partitions);
    let count = requests.len();
    for key in requests {
        dispatcher.request(key);
    }
    debug!(namespace = %namespace, requests = count, "Sweep submitted reconciles");
    count
}

/// Sweep forever: first after `sweep_initial_delay`, then every `sweep_period`.
///
/// At most `sweep_workers` sweeps run at once; a tick with no free slot is skipped.
pub async fn run_sweeps(dispatcher: Dispatcher) {
    let config = dispatcher.context().config.clone();
    let permits = Arc::new(Semaphore::new(config.sweep_workers.max(1)));

    tokio::time::sleep(config.sweep_initial_delay).await;
    let mut ticker = tokio::time::interval(config.sweep_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!("All sweep workers busy, skipping this sweep");
            continue;
        };
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            sweep_once(&dispatcher).await;
            drop(permit);
        });
    }
}
