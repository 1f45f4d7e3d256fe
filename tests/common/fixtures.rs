//! Test fixtures and builder patterns for the operator's custom resources.

#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rabbitmq_operator::crd::{
    AddressAndVhost, BrokerClusterSpec, DestinationShovelSpec, NetworkPartitionSpec,
    NetworkPartitionStatus, PartitionState, PolicySpec, RabbitMQClusterSpec,
    RabbitMQCustomResource, RabbitMQNetworkPartitionCustomResource, ShovelSpec,
    SourceShovelSpec, StorageResources, UserSpec,
};

/// Builder for creating RabbitMQCustomResource test fixtures.
///
/// # Example
/// ```
/// let resource = RabbitMQBuilder::new("mq")
///     .namespace("ns")
///     .replicas(3)
///     .load_balancer(true)
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct RabbitMQBuilder {
    name: String,
    namespace: Option<String>,
    spec: RabbitMQClusterSpec,
    labels: BTreeMap<String, String>,
    generation: Option<i64>,
    uid: Option<String>,
}

impl RabbitMQBuilder {
    /// A valid three-node cluster (the S1 shape).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some("ns".to_string()),
            spec: RabbitMQClusterSpec {
                replicas: 3,
                image: "broker:1".to_string(),
                storage_resources: StorageResources {
                    storage_class_name: "ssd".to_string(),
                    storage: "10Gi".to_string(),
                },
                ..Default::default()
            },
            labels: BTreeMap::new(),
            generation: Some(1),
            uid: Some("uid-1234".to_string()),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn replicas(mut self, replicas: i32) -> Self {
        self.spec.replicas = replicas;
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.spec.image = image.into();
        self
    }

    pub fn load_balancer(mut self, enabled: bool) -> Self {
        self.spec.create_load_balancer = enabled;
        self
    }

    pub fn node_port(mut self, enabled: bool) -> Self {
        self.spec.create_node_port = enabled;
        self
    }

    pub fn memory_limit(mut self, memory: impl Into<String>) -> Self {
        self.spec.compute_resources.limits.memory = Some(memory.into());
        self
    }

    pub fn high_watermark(mut self, fraction: f64) -> Self {
        self.spec.cluster_spec.high_watermark_fraction = fraction;
        self
    }

    pub fn user(mut self, username: &str, vhosts: &[&str], tags: &[&str]) -> Self {
        self.spec.cluster_spec.users.push(UserSpec {
            username: username.to_string(),
            vhosts: vhosts.iter().map(|v| v.to_string()).collect(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        });
        self
    }

    pub fn policy(mut self, policy: PolicySpec) -> Self {
        self.spec.cluster_spec.policies.push(policy);
        self
    }

    pub fn operator_policy(mut self, policy: PolicySpec) -> Self {
        self.spec.cluster_spec.operator_policies.push(policy);
        self
    }

    pub fn shovel(mut self, shovel: ShovelSpec) -> Self {
        self.spec.cluster_spec.shovels.push(shovel);
        self
    }

    pub fn cluster_spec(mut self, cluster_spec: BrokerClusterSpec) -> Self {
        self.spec.cluster_spec = cluster_spec;
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn build(self) -> RabbitMQCustomResource {
        RabbitMQCustomResource {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: self.namespace,
                labels: (!self.labels.is_empty()).then_some(self.labels),
                generation: self.generation,
                uid: self.uid,
                ..Default::default()
            },
            spec: self.spec,
            status: None,
        }
    }
}

/// A policy on the default vhost.
pub fn policy(name: &str, pattern: &str) -> PolicySpec {
    PolicySpec {
        name: name.to_string(),
        vhost: "/".to_string(),
        pattern: pattern.to_string(),
        priority: 0,
        apply_to: "queues".to_string(),
        definition: BTreeMap::from([("max-length".to_string(), serde_json::json!(1000))]),
    }
}

/// A shovel from `queue` on the default vhost to `remote:5672`.
pub fn shovel(name: &str, uuid: &str, queue: &str) -> ShovelSpec {
    ShovelSpec {
        name: name.to_string(),
        uuid: uuid.to_string(),
        source: SourceShovelSpec {
            queue: queue.to_string(),
            vhost: "/".to_string(),
        },
        destination: DestinationShovelSpec {
            addresses: vec![AddressAndVhost {
                address: "remote:5672".to_string(),
                vhost: "/".to_string(),
            }],
            secret_name: "remote-creds".to_string(),
            secret_namespace: "ns".to_string(),
            queue: None,
        },
        ack_mode: "on-confirm".to_string(),
        delete_after: "never".to_string(),
        prefetch_count: 1000,
        reconnect_delay: 5,
    }
}

/// Builder for RabbitMQNetworkPartitionCustomResource fixtures.
#[derive(Clone, Debug)]
pub struct PartitionBuilder {
    name: String,
    namespace: String,
    cluster: String,
    nodes: Vec<String>,
    status: Option<NetworkPartitionStatus>,
}

impl PartitionBuilder {
    pub fn new(name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "ns".to_string(),
            cluster: cluster.into(),
            nodes: Vec::new(),
            status: None,
        }
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.nodes.push(node.into());
        self
    }

    pub fn state(mut self, state: PartitionState) -> Self {
        self.status = Some(NetworkPartitionStatus {
            state,
            state_entered_at: Some(jiff::Timestamp::now().to_string()),
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> RabbitMQNetworkPartitionCustomResource {
        RabbitMQNetworkPartitionCustomResource {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                generation: Some(1),
                uid: Some("partition-uid".to_string()),
                ..Default::default()
            },
            spec: NetworkPartitionSpec {
                cluster_name: self.cluster,
                partitioned_nodes: self.nodes,
            },
            status: self.status,
        }
    }
}
