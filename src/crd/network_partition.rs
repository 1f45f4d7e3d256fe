//! RabbitMQ network partition Custom Resource Definition.
//!
//! Created (by an operator or by tooling that detects split brain) to ask the
//! operator to heal a partition: drain the minority nodes, evict them and
//! bring them back so they rejoin the majority.

use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ClusterKey, Condition};

/// Example:
/// ```yaml
/// apiVersion: indeed.com/v1alpha1
/// kind: RabbitMQNetworkPartitionCustomResource
/// metadata:
///   name: mq-partition
/// spec:
///   clusterName: mq
///   partitionedNodes:
///     - rabbit@mq-2.mq-discovery.ns.svc.cluster.local
/// ```
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "indeed.com",
    version = "v1alpha1",
    kind = "RabbitMQNetworkPartitionCustomResource",
    plural = "rabbitmqnetworkpartitions",
    singular = "rabbitmqnetworkpartition",
    status = "NetworkPartitionStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPartitionSpec {
    /// Name of the RabbitMQ cluster in the same namespace.
    pub cluster_name: String,
    /// Nodes on the minority side, as pod names or erlang node names.
    #[serde(default)]
    pub partitioned_nodes: Vec<String>,
}

/// Progress of a partition recovery, persisted so it survives operator restarts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPartitionStatus {
    #[serde(default)]
    pub state: PartitionState,
    /// RFC 3339 timestamp of the last state change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_entered_at: Option<String>,
    /// Whether the nodes were evicted without draining their queues.
    #[serde(default)]
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// States of the partition recovery procedure.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum PartitionState {
    /// The partition CR has been seen but no action taken yet.
    #[default]
    Observed,
    /// Waiting for queues on the partitioned nodes to empty.
    Drain,
    /// Queues drained; evicting the partitioned nodes.
    Evict,
    /// Drain timed out; evicting with possible message loss.
    Forced,
    /// Replicas restored, waiting for the nodes to rejoin.
    Restart,
    /// All nodes rejoined. The CR is deleted.
    Done,
    /// Nodes did not rejoin in time.
    Failed,
}

impl PartitionState {
    /// Done is the only state with nothing left to do.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PartitionState::Done)
    }

    /// States that wait on external progress between polls.
    pub fn is_waiting(&self) -> bool {
        matches!(self, PartitionState::Drain | PartitionState::Restart)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Observed => write!(f, "Observed"),
            PartitionState::Drain => write!(f, "Drain"),
            PartitionState::Evict => write!(f, "Evict"),
            PartitionState::Forced => write!(f, "Forced"),
            PartitionState::Restart => write!(f, "Restart"),
            PartitionState::Done => write!(f, "Done"),
            PartitionState::Failed => write!(f, "Failed"),
        }
    }
}

impl RabbitMQNetworkPartitionCustomResource {
    /// Key of the cluster this partition belongs to.
    pub fn cluster_key(&self) -> Option<ClusterKey> {
        let namespace = self.namespace()?;
        Some(ClusterKey::new(namespace, self.spec.cluster_name.clone()))
    }

    /// Current state, `Observed` when no status has been written yet.
    pub fn state(&self) -> PartitionState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
