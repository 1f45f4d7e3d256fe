//! Request coalescing, per-cluster serialization and the dispatch path from
//! watch actions and sweeps down to the reconcilers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rabbitmq_operator::client::management::QueueInfo;
use rabbitmq_operator::controller::error::Error;
use rabbitmq_operator::controller::executor::ClusterAwareExecutor;
use rabbitmq_operator::controller::named_locks::NamedLocks;
use rabbitmq_operator::controller::orchestrator::{
    ReconcileState, ReconciliationOrchestrator, RequestKey, SubmitOutcome,
};
use rabbitmq_operator::controller::watch::{Dispatcher, WatchAction, sweep_once};
use rabbitmq_operator::crd::{ClusterKey, PartitionState};
use tokio::sync::oneshot;

use crate::fixtures::{PartitionBuilder, RabbitMQBuilder};
use crate::mock_state::TestEnv;

fn orchestrator(env: &TestEnv) -> ReconciliationOrchestrator {
    ReconciliationOrchestrator::new(
        ClusterAwareExecutor::new(4, NamedLocks::new()),
        Some(env.health.clone()),
    )
}

fn dispatcher(env: &TestEnv) -> Dispatcher {
    Dispatcher::new(orchestrator(env), env.ctx.clone())
}

fn cluster_key(name: &str) -> ClusterKey {
    ClusterKey::new("ns", name)
}

/// Tracks how many tasks run at once.
#[derive(Clone, Default)]
struct Concurrency {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
}

impl Concurrency {
    async fn run(&self, hold: Duration) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Coalescing and serialization
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_burst_of_requests_runs_twice() {
    let env = TestEnv::new();
    let orchestrator = orchestrator(&env);
    let key = RequestKey::cluster(cluster_key("mq"));
    let tracker = Concurrency::default();
    let (started_tx, started_rx) = oneshot::channel::<()>();

    let t = tracker.clone();
    orchestrator.submit(key.clone(), move || async move {
        let _ = started_tx.send(());
        t.run(Duration::from_millis(500)).await;
        Ok(())
    });
    started_rx.await.unwrap();

    let outcomes: Vec<_> = (0..9)
        .map(|_| {
            let t = tracker.clone();
            orchestrator.submit(key.clone(), move || async move {
                t.run(Duration::from_millis(10)).await;
                Ok(())
            })
        })
        .collect();
    assert_eq!(orchestrator.state(&key), Some(ReconcileState::Pending));

    assert!(orchestrator.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(tracker.runs(), 2);
    assert_eq!(outcomes[0], SubmitOutcome::Deferred);
    assert_eq!(
        outcomes.iter().filter(|o| **o == SubmitOutcome::Coalesced).count(),
        8
    );
    assert_eq!(orchestrator.state(&key), Some(ReconcileState::Succeeded));
    assert!(
        env.health
            .metrics
            .encode()
            .contains("rabbitmq_operator_coalesced_requests_total 8")
    );
}

#[tokio::test(start_paused = true)]
async fn test_same_cluster_requests_never_overlap() {
    let env = TestEnv::new();
    let orchestrator = orchestrator(&env);
    let tracker = Concurrency::default();

    for key in [
        RequestKey::cluster(cluster_key("mq")),
        RequestKey::partition(cluster_key("mq"), "p1"),
        RequestKey::partition(cluster_key("mq"), "p2"),
    ] {
        let t = tracker.clone();
        orchestrator.submit(key, move || async move {
            t.run(Duration::from_millis(100)).await;
            Ok(())
        });
    }

    assert!(orchestrator.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(tracker.runs(), 3);
    assert_eq!(tracker.peak(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_clusters_run_in_parallel() {
    let env = TestEnv::new();
    let orchestrator = orchestrator(&env);
    let tracker = Concurrency::default();

    for name in ["a", "b", "c"] {
        let t = tracker.clone();
        orchestrator.submit(RequestKey::cluster(cluster_key(name)), move || async move {
            t.run(Duration::from_millis(100)).await;
            Ok(())
        });
    }

    assert!(orchestrator.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(tracker.runs(), 3);
    assert_eq!(tracker.peak(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_and_panicking_tasks_release_the_cluster() {
    let env = TestEnv::new();
    let orchestrator = orchestrator(&env);
    let key = RequestKey::cluster(cluster_key("mq"));

    orchestrator.submit(key.clone(), || async {
        Err::<(), _>(Error::Transient("broker busy".to_string()))
    });
    assert!(orchestrator.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(orchestrator.state(&key), Some(ReconcileState::Failed));

    let bug = true;
    orchestrator.submit(key.clone(), move || async move {
        if bug {
            panic!("reconciler bug");
        }
        Ok(())
    });
    assert!(orchestrator.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(orchestrator.state(&key), Some(ReconcileState::Failed));

    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    orchestrator.submit(key.clone(), move || async move {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert!(orchestrator.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.state(&key), Some(ReconcileState::Succeeded));

    let metrics = env.health.metrics.encode();
    assert!(metrics.contains("rabbitmq_operator_reconciliation_errors_total"));
}

#[tokio::test(start_paused = true)]
async fn test_wait_idle_times_out_while_busy() {
    let env = TestEnv::new();
    let orchestrator = orchestrator(&env);
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    orchestrator.submit(RequestKey::cluster(cluster_key("mq")), move || async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        o.lock().unwrap().push("done");
        Ok(())
    });

    assert!(!orchestrator.wait_idle(Duration::from_secs(1)).await);
    assert_eq!(orchestrator.inflight(), 1);
    assert!(orchestrator.wait_idle(Duration::from_secs(120)).await);
    assert_eq!(*order.lock().unwrap(), vec!["done"]);
    assert_eq!(orchestrator.inflight(), 0);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_dispatch_reconciles_and_forgets() {
    let env = TestEnv::new();
    env.kube.clusters.insert(RabbitMQBuilder::new("mq").build());
    let dispatcher = dispatcher(&env);
    let key = RequestKey::cluster(cluster_key("mq"));

    dispatcher.dispatch(WatchAction::Reconcile(key.clone()));
    assert!(dispatcher.orchestrator().wait_idle(Duration::from_secs(10)).await);
    assert_eq!(
        dispatcher.orchestrator().state(&key),
        Some(ReconcileState::Succeeded)
    );
    assert!(env.kube.statefulsets.object("ns", "mq").is_some());

    dispatcher.dispatch(WatchAction::Forget(key.clone()));
    assert_eq!(dispatcher.orchestrator().state(&key), None);
}

#[tokio::test(start_paused = true)]
async fn test_cluster_reconcile_waits_for_partition_recovery() {
    let env = TestEnv::new();
    env.kube.clusters.insert(RabbitMQBuilder::new("mq").build());
    let dispatcher = dispatcher(&env);
    let cluster = RequestKey::cluster(cluster_key("mq"));

    dispatcher.request(cluster.clone());
    assert!(dispatcher.orchestrator().wait_idle(Duration::from_secs(10)).await);
    env.kube.settle_statefulset(&cluster_key("mq"));
    env.kube.clear_calls();

    let kube = env.kube.clone();
    let kubelet = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            kube.settle_statefulset(&cluster_key("mq"));
        }
    });

    env.kube
        .partitions
        .insert(PartitionBuilder::new("split", "mq").node("mq-2").build());
    dispatcher.request(RequestKey::partition(cluster_key("mq"), "split"));
    dispatcher.request(cluster.clone());

    assert!(dispatcher.orchestrator().wait_idle(Duration::from_secs(600)).await);
    kubelet.abort();

    // The cluster pass ran after recovery and left the replica count alone
    assert_eq!(env.kube.replica_history("mq"), vec![2, 3]);
    assert!(env.kube.partitions.object("ns", "split").is_none());
    assert_eq!(
        dispatcher.orchestrator().state(&cluster),
        Some(ReconcileState::Succeeded)
    );
}

#[tokio::test(start_paused = true)]
async fn test_other_clusters_progress_during_partition_recovery() {
    let env = TestEnv::new();
    for name in ["a", "b", "c"] {
        env.kube.clusters.insert(RabbitMQBuilder::new(name).build());
    }
    let dispatcher = dispatcher(&env);
    for name in ["a", "b", "c"] {
        dispatcher.request(RequestKey::cluster(cluster_key(name)));
    }
    assert!(dispatcher.orchestrator().wait_idle(Duration::from_secs(10)).await);
    for name in ["a", "b", "c"] {
        env.kube.settle_statefulset(&cluster_key(name));
    }

    // Queues on the partitioned nodes never drain, so both recoveries sit
    // in Drain until the timeout
    env.broker.set_queues(
        ["a", "b"]
            .iter()
            .map(|name| QueueInfo {
                name: "orders".to_string(),
                vhost: "/".to_string(),
                node: format!("rabbit@{name}-2.{name}-discovery.ns.svc.cluster.local"),
                messages: 10,
            })
            .collect(),
    );
    for name in ["a", "b"] {
        let partition = format!("split-{name}");
        env.kube.partitions.insert(
            PartitionBuilder::new(partition.clone(), name)
                .node(format!("{name}-2"))
                .build(),
        );
        dispatcher.request(RequestKey::partition(cluster_key(name), partition));
    }
    // Cluster passes queued behind the recoveries
    for name in ["a", "b"] {
        dispatcher.request(RequestKey::cluster(cluster_key(name)));
    }

    env.kube
        .clusters
        .insert(RabbitMQBuilder::new("c").image("broker:2").generation(2).build());
    let c = RequestKey::cluster(cluster_key("c"));
    dispatcher.request(c.clone());

    tokio::time::sleep(Duration::from_secs(5)).await;
    let statefulset = env.kube.statefulsets.object("ns", "c").unwrap();
    let image = statefulset.spec.unwrap().template.spec.unwrap().containers[0]
        .image
        .clone();
    assert_eq!(image.as_deref(), Some("broker:2"));
    assert_eq!(
        dispatcher.orchestrator().state(&c),
        Some(ReconcileState::Succeeded)
    );
    // Both recoveries are still draining
    let forced = serde_json::json!("Forced");
    assert!(
        env.kube
            .partitions
            .calls_of("patch_status")
            .iter()
            .filter_map(|call| call.body.as_ref()?.pointer("/status/state"))
            .all(|state| *state != forced)
    );
}

#[tokio::test(start_paused = true)]
async fn test_sweep_requests_every_live_resource() {
    let env = TestEnv::new();
    env.kube.clusters.insert(RabbitMQBuilder::new("mq").build());
    env.kube.clusters.insert(RabbitMQBuilder::new("other").build());
    env.kube.partitions.insert(
        PartitionBuilder::new("old", "mq")
            .node("mq-2")
            .state(PartitionState::Done)
            .build(),
    );
    let dispatcher = dispatcher(&env);

    let requested = sweep_once(&dispatcher).await;
    assert_eq!(requested, 3);
    assert!(dispatcher.orchestrator().wait_idle(Duration::from_secs(10)).await);

    assert!(env.kube.statefulsets.object("ns", "mq").is_some());
    assert!(env.kube.statefulsets.object("ns", "other").is_some());
    assert!(env.kube.partitions.object("ns", "old").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_with_nothing_to_do() {
    let env = TestEnv::new();
    let dispatcher = dispatcher(&env);
    assert_eq!(sweep_once(&dispatcher).await, 0);
    assert_eq!(dispatcher.orchestrator().inflight(), 0);
}
