//! RabbitMQ cluster Custom Resource Definition.
//!
//! Wire-compatible with the `RabbitMQCustomResource` kind in the `indeed.com`
//! group. The spec keeps the original field names (`rabbitMQImage`,
//! `storageResources`, `clusterSpec`) and accepts the shorter aliases
//! (`image`, `storage`) as well.

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// RabbitMQCustomResource declares one RabbitMQ cluster.
///
/// Example:
/// ```yaml
/// apiVersion: indeed.com/v1alpha1
/// kind: RabbitMQCustomResource
/// metadata:
///   name: mq
/// spec:
///   replicas: 3
///   rabbitMQImage: rabbitmq:3.8-management
///   storageResources:
///     storageClassName: ssd
///     storage: 10Gi
///   clusterSpec:
///     highWatermarkFraction: 0.4
///     users:
///       - username: app
///         vhosts: ["/"]
///         tags: ["monitoring"]
/// ```
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "indeed.com",
    version = "v1alpha1",
    kind = "RabbitMQCustomResource",
    plural = "rabbitmqs",
    singular = "rabbitmq",
    shortname = "rmq",
    status = "RabbitMQClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RabbitMQClusterSpec {
    /// Number of broker nodes (default 3).
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Broker container image.
    #[serde(rename = "rabbitMQImage", alias = "image")]
    pub image: String,

    /// Image used by the init container that renders broker configuration.
    #[serde(default = "default_init_container_image")]
    pub init_container_image: String,

    /// Create a LoadBalancer service in addition to the main service.
    #[serde(default)]
    pub create_load_balancer: bool,

    /// Create a NodePort service in addition to the main service.
    #[serde(default)]
    pub create_node_port: bool,

    /// Resource requests and limits for the broker container.
    #[serde(default)]
    pub compute_resources: ComputeResources,

    /// Persistent storage for each broker node.
    #[serde(alias = "storage")]
    pub storage_resources: StorageResources,

    /// Broker-level configuration.
    #[serde(default)]
    pub cluster_spec: BrokerClusterSpec,
}

impl Default for RabbitMQClusterSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            image: String::new(),
            init_container_image: default_init_container_image(),
            create_load_balancer: false,
            create_node_port: false,
            compute_resources: ComputeResources::default(),
            storage_resources: StorageResources::default(),
            cluster_spec: BrokerClusterSpec::default(),
        }
    }
}

fn default_replicas() -> i32 {
    3
}

fn default_init_container_image() -> String {
    "busybox:1.36".to_string()
}

/// Requests and limits for cpu and memory.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeResources {
    #[serde(default)]
    pub requests: ResourceQuantities,
    #[serde(default)]
    pub limits: ResourceQuantities,
}

/// A cpu/memory pair; unset values are omitted from the container.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Volume claim parameters.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageResources {
    /// Storage class for the broker data volumes.
    #[serde(alias = "class")]
    pub storage_class_name: String,
    /// Requested capacity, e.g. `10Gi`.
    #[serde(alias = "capacity")]
    pub storage: String,
}

/// Broker configuration and broker-side objects.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerClusterSpec {
    /// Fraction of available memory at which publishers are blocked.
    #[serde(default = "default_high_watermark_fraction")]
    pub high_watermark_fraction: f64,

    #[serde(default)]
    pub users: Vec<UserSpec>,

    #[serde(default)]
    pub shovels: Vec<ShovelSpec>,

    #[serde(default)]
    pub policies: Vec<PolicySpec>,

    #[serde(default)]
    pub operator_policies: Vec<PolicySpec>,
}

impl Default for BrokerClusterSpec {
    fn default() -> Self {
        Self {
            high_watermark_fraction: default_high_watermark_fraction(),
            users: Vec::new(),
            shovels: Vec::new(),
            policies: Vec::new(),
            operator_policies: Vec::new(),
        }
    }
}

fn default_high_watermark_fraction() -> f64 {
    0.4
}

/// A broker user. The password lives in a generated secret.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    pub username: String,
    /// Virtual hosts the user gets full permissions on.
    #[serde(default)]
    pub vhosts: Vec<String>,
    /// Management tags such as `monitoring` or `administrator`.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A policy or operator policy, addressed by `(vhost, name)`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    pub name: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Regular expression matched against queue/exchange names.
    pub pattern: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_apply_to")]
    pub apply_to: String,
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub definition: BTreeMap<String, serde_json::Value>,
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_apply_to() -> String {
    "all".to_string()
}

fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

/// A dynamic shovel moving messages from a local queue to another cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShovelSpec {
    pub name: String,
    /// Stable identity of the shovel across renames.
    pub uuid: String,
    pub source: SourceShovelSpec,
    pub destination: DestinationShovelSpec,
    #[serde(default = "default_ack_mode")]
    pub ack_mode: String,
    #[serde(default = "default_delete_after")]
    pub delete_after: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u32,
    /// Seconds to wait before reconnecting after a failure.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u32,
}

fn default_ack_mode() -> String {
    "on-confirm".to_string()
}

fn default_delete_after() -> String {
    "never".to_string()
}

fn default_prefetch_count() -> u32 {
    1000
}

fn default_reconnect_delay() -> u32 {
    5
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceShovelSpec {
    pub queue: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

/// Remote side of a shovel. Credentials come from `secretName` in
/// `secretNamespace` (keys `username` and `password`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationShovelSpec {
    #[serde(default)]
    pub addresses: Vec<AddressAndVhost>,
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub secret_namespace: String,
    /// Destination queue; defaults to the source queue name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressAndVhost {
    /// `host` or `host:port` of a remote broker.
    pub address: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

/// Observed state of a RabbitMQ cluster.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RabbitMQClusterStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub ready_replicas: i32,
    /// Broker-side objects created by the operator, used to scope deletions.
    #[serde(default)]
    pub managed_objects: ManagedBrokerObjects,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedBrokerObjects {
    #[serde(default)]
    pub policies: Vec<BrokerObjectRef>,
    #[serde(default)]
    pub operator_policies: Vec<BrokerObjectRef>,
    #[serde(default)]
    pub shovels: Vec<ManagedShovel>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerObjectRef {
    pub vhost: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedShovel {
    pub uuid: String,
    pub vhost: String,
    pub name: String,
}

/// Condition describes one aspect of a resource's state.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Ready, ready, reason, message, generation)
    }

    /// Create a "Validated" condition.
    pub fn validated(valid: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Validated, valid, reason, message, generation)
    }

    /// Create a "PartitionHealing" condition.
    pub fn partition_healing(
        healing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new(
            ConditionType::PartitionHealing,
            healing,
            reason,
            message,
            generation,
        )
    }
}

/// Condition types surfaced on both custom resources.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConditionType {
    /// All broker nodes are ready.
    Ready,
    /// The spec passed validation.
    Validated,
    /// A network partition is being healed.
    PartitionHealing,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Ready => write!(f, "Ready"),
            ConditionType::Validated => write!(f, "Validated"),
            ConditionType::PartitionHealing => write!(f, "PartitionHealing"),
        }
    }
}

/// `(namespace, name)` of a managed cluster. The unit of mutual exclusion.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl RabbitMQCustomResource {
    /// Key of this cluster, if the object has both a namespace and a name.
    pub fn cluster_key(&self) -> Option<ClusterKey> {
        let namespace = self.namespace()?;
        let name = self.metadata.name.clone()?;
        Some(ClusterKey::new(namespace, name))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_short_field_aliases() {
        let spec: RabbitMQClusterSpec = serde_json::from_value(serde_json::json!({
            "replicas": 3,
            "image": "broker:1",
            "storage": {"class": "ssd", "capacity": "10Gi"}
        }))
        .unwrap();

        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.image, "broker:1");
        assert_eq!(spec.storage_resources.storage_class_name, "ssd");
        assert_eq!(spec.storage_resources.storage, "10Gi");
        assert!(!spec.create_load_balancer);
        assert_eq!(spec.cluster_spec.high_watermark_fraction, 0.4);
    }

    #[test]
    fn test_original_field_names() {
        let spec: RabbitMQClusterSpec = serde_json::from_value(serde_json::json!({
            "rabbitMQImage": "rabbitmq:3.8",
            "initContainerImage": "busybox:1.35",
            "createLoadBalancer": true,
            "storageResources": {"storageClassName": "gp2", "storage": "5Gi"},
            "clusterSpec": {
                "highWatermarkFraction": 0.5,
                "users": [{"username": "app", "vhosts": ["/"], "tags": ["monitoring"]}]
            }
        }))
        .unwrap();

        assert_eq!(spec.replicas, 3);
        assert_eq!(spec.image, "rabbitmq:3.8");
        assert_eq!(spec.init_container_image, "busybox:1.35");
        assert!(spec.create_load_balancer);
        assert_eq!(spec.cluster_spec.users.len(), 1);
        assert_eq!(spec.cluster_spec.users[0].vhosts, vec!["/".to_string()]);

        // Serializes back under the original names
        let value = serde_json::to_value(&spec).unwrap();
        assert!(value.get("rabbitMQImage").is_some());
        assert!(value.get("storageResources").is_some());
    }

    #[test]
    fn test_shovel_defaults() {
        let shovel: ShovelSpec = serde_json::from_value(serde_json::json!({
            "name": "to-dr",
            "uuid": "1f0c",
            "source": {"queue": "orders"},
            "destination": {
                "addresses": [{"address": "dr.example.com"}],
                "secretName": "dr-creds",
                "secretNamespace": "ns"
            }
        }))
        .unwrap();

        assert_eq!(shovel.ack_mode, "on-confirm");
        assert_eq!(shovel.delete_after, "never");
        assert_eq!(shovel.prefetch_count, 1000);
        assert_eq!(shovel.reconnect_delay, 5);
        assert_eq!(shovel.source.vhost, "/");
        assert_eq!(shovel.destination.addresses[0].vhost, "/");
    }

    #[test]
    fn test_condition_status_strings() {
        let ready = Condition::ready(true, "AllNodesReady", "3/3", Some(2));
        assert_eq!(ready.r#type, "Ready");
        assert_eq!(ready.status, "True");
        assert_eq!(ready.observed_generation, Some(2));

        let healing = Condition::partition_healing(false, "NoPartition", "", None);
        assert_eq!(healing.r#type, "PartitionHealing");
        assert_eq!(healing.status, "False");
    }

    #[test]
    fn test_cluster_key() {
        let mut cr = RabbitMQCustomResource::new("mq", RabbitMQClusterSpec::default());
        assert!(cr.cluster_key().is_none());

        cr.metadata.namespace = Some("ns".to_string());
        let key = cr.cluster_key().unwrap();
        assert_eq!(key, ClusterKey::new("ns", "mq"));
        assert_eq!(key.to_string(), "ns/mq");
    }

    #[test]
    fn test_crd_metadata() {
        let crd = RabbitMQCustomResource::crd();
        assert_eq!(crd.spec.group, "indeed.com");
        assert_eq!(crd.spec.names.kind, "RabbitMQCustomResource");
        assert_eq!(crd.spec.names.plural, "rabbitmqs");
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
