//! Service generation for RabbitMQ clusters.
//!
//! Creates up to four services:
//! - **Main Service**: stable virtual IP for AMQP and management clients
//! - **Discovery Service**: headless, gives each node a stable DNS name for clustering
//! - **LoadBalancer Service**: optional external access
//! - **NodePort Service**: optional external access through node ports

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::RabbitMQCustomResource;
use crate::resources::common::{
    AMQP_PORT, DIST_PORT, EPMD_PORT, MANAGEMENT_PORT, discovery_service_name,
    load_balancer_service_name, node_port_service_name, owned_metadata, pod_selector_labels,
};

/// Generate the main ClusterIP service (`<cluster>`).
pub fn generate_main_service(resource: &RabbitMQCustomResource) -> Service {
    client_service(resource, resource.name_any(), "ClusterIP")
}

/// Generate the headless discovery service (`<cluster>-discovery`).
///
/// `publishNotReadyAddresses` lets peers resolve each other while the
/// cluster is still forming.
pub fn generate_discovery_service(resource: &RabbitMQCustomResource) -> Service {
    let cluster_name = resource.name_any();

    Service {
        metadata: owned_metadata(resource, discovery_service_name(&cluster_name)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(pod_selector_labels(&cluster_name)),
            ports: Some(vec![
                port("epmd", EPMD_PORT),
                port("amqp", AMQP_PORT),
                port("dist", DIST_PORT),
                port("management", MANAGEMENT_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the LoadBalancer service (`<cluster>-loadbalancer`).
pub fn generate_load_balancer_service(resource: &RabbitMQCustomResource) -> Service {
    client_service(
        resource,
        load_balancer_service_name(&resource.name_any()),
        "LoadBalancer",
    )
}

/// Generate the NodePort service (`<cluster>-nodeport`).
pub fn generate_node_port_service(resource: &RabbitMQCustomResource) -> Service {
    client_service(
        resource,
        node_port_service_name(&resource.name_any()),
        "NodePort",
    )
}

fn client_service(resource: &RabbitMQCustomResource, name: String, type_: &str) -> Service {
    Service {
        metadata: owned_metadata(resource, name),
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            selector: Some(pod_selector_labels(&resource.name_any())),
            ports: Some(vec![
                port("amqp", AMQP_PORT),
                port("management", MANAGEMENT_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn port(name: &str, number: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: number,
        target_port: Some(IntOrString::Int(number)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}
