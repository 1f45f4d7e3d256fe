//! Common resource generation utilities.
//!
//! Naming conventions, the fixed label set and owner references shared by
//! every object built for a RabbitMQ cluster.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::RabbitMQCustomResource;

/// Label identifying the cluster an object belongs to.
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Label identifying the operator as the manager.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Label identifying the application.
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

pub const MANAGED_BY_VALUE: &str = "rabbitmq-operator";
pub const PART_OF_VALUE: &str = "rabbitmq";

/// CR labels with this prefix are copied onto the pod template.
pub const INDEED_LABEL_PREFIX: &str = "indeed.com/";

/// Name of the volume claim template (and its pod volume).
pub const STORAGE_VOLUME_NAME: &str = "rabbitmq-storage";

pub const AMQP_PORT: i32 = 5672;
pub const MANAGEMENT_PORT: i32 = 15672;
pub const EPMD_PORT: i32 = 4369;
pub const DIST_PORT: i32 = 25672;

/// Standard labels applied to all managed resources
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_INSTANCE.to_string(), cluster_name.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (LABEL_PART_OF.to_string(), PART_OF_VALUE.to_string()),
    ])
}

/// Labels used to select the pods of one cluster
pub fn pod_selector_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_INSTANCE.to_string(), cluster_name.to_string())])
}

/// Label selector string matching every object of one cluster
pub fn instance_selector(cluster_name: &str) -> String {
    format!("{}={}", LABEL_INSTANCE, cluster_name)
}

/// Standard labels plus the CR's `indeed.com/` labels, for the pod template
pub fn pod_template_labels(resource: &RabbitMQCustomResource) -> BTreeMap<String, String> {
    let mut labels = standard_labels(&resource.name_any());
    for (key, value) in resource.labels() {
        if key.starts_with(INDEED_LABEL_PREFIX) {
            labels.insert(key.clone(), value.clone());
        }
    }
    labels
}

/// Create the controller owner reference pointing at the cluster CR
pub fn owner_reference(resource: &RabbitMQCustomResource) -> OwnerReference {
    OwnerReference {
        api_version: RabbitMQCustomResource::api_version(&()).to_string(),
        kind: RabbitMQCustomResource::kind(&()).to_string(),
        name: resource.name_any(),
        uid: resource.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata for an object owned by the cluster, carrying the standard labels
pub fn owned_metadata(resource: &RabbitMQCustomResource, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: resource.namespace(),
        labels: Some(standard_labels(&resource.name_any())),
        owner_references: Some(vec![owner_reference(resource)]),
        ..Default::default()
    }
}

pub fn admin_secret_name(cluster_name: &str) -> String {
    format!("{}-admin", cluster_name)
}

pub fn erlang_cookie_secret_name(cluster_name: &str) -> String {
    format!("{}-erlang-cookie", cluster_name)
}

pub fn user_secret_name(cluster_name: &str, username: &str) -> String {
    format!("{}-{}-user", cluster_name, username)
}

pub fn discovery_service_name(cluster_name: &str) -> String {
    format!("{}-discovery", cluster_name)
}

pub fn load_balancer_service_name(cluster_name: &str) -> String {
    format!("{}-loadbalancer", cluster_name)
}

pub fn node_port_service_name(cluster_name: &str) -> String {
    format!("{}-nodeport", cluster_name)
}

pub fn pod_disruption_budget_name(cluster_name: &str) -> String {
    format!("{}-poddisruptionbudget", cluster_name)
}

/// Fully qualified host name of one broker pod
pub fn pod_fqdn(cluster_name: &str, namespace: &str, pod_name: &str) -> String {
    format!(
        "{}.{}.{}.svc.cluster.local",
        pod_name,
        discovery_service_name(cluster_name),
        namespace
    )
}

/// Erlang node name of one broker pod (`rabbit@<fqdn>`)
pub fn node_name(cluster_name: &str, namespace: &str, pod_name: &str) -> String {
    format!("rabbit@{}", pod_fqdn(cluster_name, namespace, pod_name))
}
