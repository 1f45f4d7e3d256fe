//! Custom Resource Definitions (CRDs) for rabbitmq-operator.
//!
//! - `RabbitMQCustomResource`: a RabbitMQ cluster and its broker-side objects
//! - `RabbitMQNetworkPartitionCustomResource`: a request to heal a network partition

mod network_partition;
mod rabbitmq_cluster;

pub use network_partition::*;
pub use rabbitmq_cluster::*;
