//! Broker queue checks used while draining partitioned nodes.

use tracing::{debug, warn};

use crate::client::management::{Credentials, QueueInfo, RabbitManagementApiProvider};
use crate::crd::ClusterKey;
use crate::resources::common::node_name;

/// Checks whether the queues hosted on one node are empty.
///
/// The node's own management endpoint is queried, since a partitioned node
/// may not be visible through the cluster service.
pub struct AreQueuesEmptyOperation<'a> {
    provider: &'a dyn RabbitManagementApiProvider,
    credentials: &'a Credentials,
}

impl<'a> AreQueuesEmptyOperation<'a> {
    pub fn new(provider: &'a dyn RabbitManagementApiProvider, credentials: &'a Credentials) -> Self {
        Self {
            provider,
            credentials,
        }
    }

    /// True when every queue hosted on `pod_name` has no messages.
    ///
    /// Broker errors count as not drained; the node may simply be unreachable.
    pub async fn execute(&self, key: &ClusterKey, pod_name: &str) -> bool {
        let api = match self.provider.node_api(key, pod_name, self.credentials) {
            Ok(api) => api,
            Err(e) => {
                warn!(cluster = %key, pod = %pod_name, error = %e, "Cannot build management client for node");
                return false;
            }
        };
        match api.list_queues().await {
            Ok(queues) => {
                let node = node_name(&key.name, &key.namespace, pod_name);
                let empty = queues_empty_on(&queues, &node);
                debug!(cluster = %key, pod = %pod_name, empty, "Checked node queues");
                empty
            }
            Err(e) => {
                warn!(cluster = %key, pod = %pod_name, error = %e, "Queue check failed, treating node as not drained");
                false
            }
        }
    }
}

/// Whether no queue hosted on `node` holds messages.
pub fn queues_empty_on(queues: &[QueueInfo], node: &str) -> bool {
    queues
        .iter()
        .filter(|q| q.node == node)
        .all(|q| q.messages == 0)
}
