//! Network partition recovery against the in-memory fakes.
//!
//! Every test runs on paused tokio time. A background task plays the
//! StatefulSet controller, so pods come back a second after the replica
//! count is restored.

use std::time::Duration;

use rabbitmq_operator::client::management::QueueInfo;
use rabbitmq_operator::controller::cluster_reconciler::reconcile_cluster;
use rabbitmq_operator::controller::error::Error;
use rabbitmq_operator::controller::partition_reconciler::reconcile_partition;
use rabbitmq_operator::controller::status::get_condition_reason;
use rabbitmq_operator::crd::{ClusterKey, ConditionType, PartitionState};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::fixtures::{PartitionBuilder, RabbitMQBuilder};
use crate::mock_state::{FakeKube, TestEnv};

const PARTITIONED_NODE: &str = "rabbit@mq-2.mq-discovery.ns.svc.cluster.local";
const HEALTHY_NODE: &str = "rabbit@mq-0.mq-discovery.ns.svc.cluster.local";

fn key() -> ClusterKey {
    ClusterKey::new("ns", "mq")
}

fn queue(name: &str, node: &str, messages: u64) -> QueueInfo {
    QueueInfo {
        name: name.to_string(),
        vhost: "/".to_string(),
        node: node.to_string(),
        messages,
    }
}

/// A settled three-node cluster with its admin secret in place.
async fn running_cluster() -> TestEnv {
    let env = TestEnv::new();
    env.kube.clusters.insert(RabbitMQBuilder::new("mq").build());
    reconcile_cluster(key(), env.ctx.clone()).await.unwrap();
    env.kube.settle_statefulset(&key());
    env.kube.clear_calls();
    env.events.clear();
    env
}

fn spawn_kubelet(kube: &FakeKube) -> JoinHandle<()> {
    let kube = kube.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            kube.settle_statefulset(&key());
        }
    })
}

/// States written to the partition status, in order.
fn persisted_states(env: &TestEnv, name: &str) -> Vec<String> {
    env.kube
        .partitions
        .calls_of("patch_status")
        .into_iter()
        .filter(|c| c.name == name)
        .filter_map(|c| {
            c.body?
                .pointer("/status/state")?
                .as_str()
                .map(str::to_string)
        })
        .collect()
}

fn persisted_bodies(env: &TestEnv, name: &str) -> Vec<serde_json::Value> {
    env.kube
        .partitions
        .calls_of("patch_status")
        .into_iter()
        .filter(|c| c.name == name)
        .filter_map(|c| c.body)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_drained_node_is_evicted_and_rejoins() {
    let env = running_cluster().await;
    env.broker.set_queues(vec![
        queue("orders", HEALTHY_NODE, 42),
        queue("audit", PARTITIONED_NODE, 0),
    ]);
    env.kube
        .partitions
        .insert(PartitionBuilder::new("split", "mq").node(PARTITIONED_NODE).build());
    let kubelet = spawn_kubelet(&env.kube);

    reconcile_partition(key(), "split".to_string(), env.ctx.clone())
        .await
        .unwrap();
    kubelet.abort();

    assert_eq!(
        persisted_states(&env, "split"),
        vec!["Observed", "Drain", "Evict", "Restart", "Done"]
    );
    assert_eq!(env.kube.replica_history("mq"), vec![2, 3]);
    assert_eq!(
        env.kube.pods.calls_of("delete").iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["mq-2"]
    );
    assert!(env.kube.partitions.object("ns", "split").is_none());
    assert!(env.kube.pods.object("ns", "mq-2").is_some());
    assert!(env.events.warnings().is_empty());
    assert!(env.events.reasons().iter().all(|r| r == "StateChanged"));
}

#[tokio::test(start_paused = true)]
async fn test_undrained_node_is_forced_after_drain_timeout() {
    let env = running_cluster().await;
    env.broker
        .set_queues(vec![queue("orders", PARTITIONED_NODE, 7)]);
    env.kube
        .partitions
        .insert(PartitionBuilder::new("split", "mq").node("mq-2").build());
    let kubelet = spawn_kubelet(&env.kube);

    let started = Instant::now();
    reconcile_partition(key(), "split".to_string(), env.ctx.clone())
        .await
        .unwrap();
    kubelet.abort();

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(
        persisted_states(&env, "split"),
        vec!["Observed", "Drain", "Forced", "Restart", "Done"]
    );
    assert_eq!(env.kube.replica_history("mq"), vec![2, 3]);

    let warnings = env.events.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].reason, "ForcedEviction");

    let bodies = persisted_bodies(&env, "split");
    let restart = &bodies[3];
    assert_eq!(restart.pointer("/status/forced"), Some(&serde_json::json!(true)));
    let conditions: Vec<_> = serde_json::from_value(
        restart.pointer("/status/conditions").cloned().unwrap(),
    )
    .unwrap();
    assert_eq!(
        get_condition_reason(&conditions, ConditionType::PartitionHealing),
        Some("ForcedEviction")
    );
    assert!(env.kube.partitions.object("ns", "split").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_node_counts_as_not_drained() {
    let env = running_cluster().await;
    env.broker.set_unreachable(true);
    env.kube
        .partitions
        .insert(PartitionBuilder::new("split", "mq").node("mq-2").build());
    let kubelet = spawn_kubelet(&env.kube);

    reconcile_partition(key(), "split".to_string(), env.ctx.clone())
        .await
        .unwrap();
    kubelet.abort();

    let states = persisted_states(&env, "split");
    assert!(states.contains(&"Forced".to_string()));
    assert!(!states.contains(&"Evict".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_drain_resumes_from_persisted_timestamp() {
    let env = running_cluster().await;
    env.broker
        .set_queues(vec![queue("orders", PARTITIONED_NODE, 7)]);

    let mut partition = PartitionBuilder::new("split", "mq")
        .node("mq-2")
        .state(PartitionState::Drain)
        .build();
    let entered = jiff::Timestamp::now() - jiff::SignedDuration::from_secs(60);
    if let Some(status) = partition.status.as_mut() {
        status.state_entered_at = Some(entered.to_string());
    }
    env.kube.partitions.insert(partition);
    let kubelet = spawn_kubelet(&env.kube);

    let started = Instant::now();
    reconcile_partition(key(), "split".to_string(), env.ctx.clone())
        .await
        .unwrap();
    kubelet.abort();

    // Already past the 30s drain timeout when the operator picked it up
    let states = persisted_states(&env, "split");
    assert_eq!(states.first().map(String::as_str), Some("Forced"));
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_restart_timeout_fails_then_retries() {
    let env = running_cluster().await;
    env.kube
        .partitions
        .insert(PartitionBuilder::new("split", "mq").node("mq-2").build());

    // Nothing brings the pod back
    let err = reconcile_partition(key(), "split".to_string(), env.ctx.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PartitionTimeout { .. }));
    assert_eq!(
        persisted_states(&env, "split").last().map(String::as_str),
        Some("Failed")
    );
    let partition = env.kube.partitions.object("ns", "split").unwrap();
    assert_eq!(partition.state(), PartitionState::Failed);
    assert!(
        env.events
            .warnings()
            .iter()
            .any(|e| e.reason == "RecoveryFailed")
    );

    // The next attempt restarts with a fresh deadline
    env.kube.clear_calls();
    let kubelet = spawn_kubelet(&env.kube);
    reconcile_partition(key(), "split".to_string(), env.ctx.clone())
        .await
        .unwrap();
    kubelet.abort();

    assert_eq!(persisted_states(&env, "split"), vec!["Restart", "Done"]);
    assert!(env.kube.partitions.object("ns", "split").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_partition_of_missing_cluster_is_rejected() {
    let env = TestEnv::new();
    env.kube
        .partitions
        .insert(PartitionBuilder::new("split", "ghost").node("ghost-1").build());

    let err = reconcile_partition(
        ClusterKey::new("ns", "ghost"),
        "split".to_string(),
        env.ctx.clone(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Validation { .. }));
    let status = env
        .kube
        .partitions
        .object("ns", "split")
        .and_then(|p| p.status)
        .unwrap();
    assert_eq!(
        get_condition_reason(&status.conditions, ConditionType::Validated),
        Some("ValidationFailed")
    );
    assert!(status.message.unwrap().contains("ghost"));
    assert_eq!(env.events.reasons(), vec!["ValidationFailed"]);
}

#[tokio::test(start_paused = true)]
async fn test_too_many_partitioned_nodes_are_rejected() {
    let env = running_cluster().await;
    env.kube.partitions.insert(
        PartitionBuilder::new("split", "mq")
            .node("mq-0")
            .node("mq-1")
            .node("mq-2")
            .build(),
    );

    let err = reconcile_partition(key(), "split".to_string(), env.ctx.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation { .. }));
    assert!(env.kube.replica_history("mq").is_empty());
    assert!(env.kube.pods.calls_of("delete").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_done_partition_is_deleted() {
    let env = running_cluster().await;
    env.kube.partitions.insert(
        PartitionBuilder::new("split", "mq")
            .node("mq-2")
            .state(PartitionState::Done)
            .build(),
    );

    reconcile_partition(key(), "split".to_string(), env.ctx.clone())
        .await
        .unwrap();

    assert!(env.kube.partitions.object("ns", "split").is_none());
    assert!(env.kube.statefulsets.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_partition_is_ignored() {
    let env = running_cluster().await;
    reconcile_partition(key(), "gone".to_string(), env.ctx.clone())
        .await
        .unwrap();
    assert!(env.kube.partitions.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transitions_are_counted() {
    let env = running_cluster().await;
    env.kube
        .partitions
        .insert(PartitionBuilder::new("split", "mq").node("mq-2").build());
    let kubelet = spawn_kubelet(&env.kube);

    reconcile_partition(key(), "split".to_string(), env.ctx.clone())
        .await
        .unwrap();
    kubelet.abort();

    let metrics = env.health.metrics.encode();
    assert!(metrics.contains(r#"rabbitmq_operator_partition_transitions_total{state="Done"} 1"#));
}
