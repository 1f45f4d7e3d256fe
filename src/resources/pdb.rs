//! PodDisruptionBudget generation for RabbitMQ clusters.
//!
//! Limits voluntary disruptions (node drains, rollouts) to one broker at a
//! time so a `pause_minority` cluster never loses its majority to evictions.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::RabbitMQCustomResource;
use crate::resources::common::{owned_metadata, pod_disruption_budget_name, pod_selector_labels};

/// At most one broker may be voluntarily unavailable.
pub const MAX_UNAVAILABLE: i32 = 1;

/// Generate the PodDisruptionBudget (`<cluster>-poddisruptionbudget`).
pub fn generate_pod_disruption_budget(resource: &RabbitMQCustomResource) -> PodDisruptionBudget {
    let cluster_name = resource.name_any();

    PodDisruptionBudget {
        metadata: owned_metadata(resource, pod_disruption_budget_name(&cluster_name)),
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(MAX_UNAVAILABLE)),
            selector: Some(LabelSelector {
                match_labels: Some(pod_selector_labels(&cluster_name)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
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
    use crate::crd::RabbitMQClusterSpec;
    use crate::resources::common::LABEL_INSTANCE;

    fn test_resource(name: &str, replicas: i32) -> RabbitMQCustomResource {
        let mut cr = RabbitMQCustomResource::new(
            name,
            RabbitMQClusterSpec {
                replicas,
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("default".to_string());
        cr.metadata.uid = Some("test-uid".to_string());
        cr
    }

    #[test]
    fn test_pdb_name_and_selector() {
        let pdb = generate_pod_disruption_budget(&test_resource("mq", 3));
        assert_eq!(pdb.metadata.name.as_deref(), Some("mq-poddisruptionbudget"));
        assert_eq!(pdb.metadata.namespace.as_deref(), Some("default"));

        let selector = pdb.spec.unwrap().selector.unwrap().match_labels.unwrap();
        assert_eq!(selector.len(), 1);
        assert_eq!(selector[LABEL_INSTANCE], "mq");
    }

    #[test]
    fn test_pdb_max_unavailable_independent_of_replicas() {
        for replicas in [1, 3, 5, 9] {
            let pdb = generate_pod_disruption_budget(&test_resource("mq", replicas));
            assert_eq!(
                pdb.spec.unwrap().max_unavailable,
                Some(IntOrString::Int(1))
            );
        }
    }

    #[test]
    fn test_pdb_owner_reference() {
        let pdb = generate_pod_disruption_budget(&test_resource("mq", 3));
        let owners = pdb.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "mq");
        assert_eq!(owners[0].uid, "test-uid");
    }
}
