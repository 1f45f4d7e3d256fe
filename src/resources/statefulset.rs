//! StatefulSet generation for RabbitMQ clusters.
//!
//! Creates a StatefulSet with:
//! - Stable network identity via the discovery service
//! - Persistent mnesia storage through the `rabbitmq-storage` claim template
//! - An init container that renders `enabled_plugins` and `rabbitmq.conf`
//! - Erlang cookie and default credentials injected from the generated secrets
//! - Datadog autodiscovery annotations keyed by the cluster name

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretKeySelector, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::{RabbitMQCustomResource, ResourceQuantities};
use crate::resources::common::{
    AMQP_PORT, DIST_PORT, EPMD_PORT, MANAGEMENT_PORT, STORAGE_VOLUME_NAME, admin_secret_name,
    discovery_service_name, erlang_cookie_secret_name, owned_metadata, pod_selector_labels,
    pod_template_labels,
};
use crate::resources::secrets::{ERLANG_COOKIE_KEY, PASSWORD_KEY, USERNAME_KEY};

/// Mount path of the broker data directory
const MNESIA_PATH: &str = "/var/lib/rabbitmq/mnesia";
/// Shared volume the init container renders configuration into
const CONFIG_VOLUME_NAME: &str = "rabbitmq-config";
const CONFIG_PATH: &str = "/etc/rabbitmq";
const CONTAINER_NAME: &str = "rabbitmq";
const TERMINATION_GRACE_PERIOD: i64 = 60;

const ENABLED_PLUGINS: &str = "[rabbitmq_management,rabbitmq_peer_discovery_k8s,rabbitmq_shovel,rabbitmq_shovel_management].";

/// Generate the StatefulSet (`<cluster>`).
pub fn generate_statefulset(resource: &RabbitMQCustomResource) -> StatefulSet {
    let cluster_name = resource.name_any();

    StatefulSet {
        metadata: owned_metadata(resource, cluster_name.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(resource.spec.replicas),
            service_name: Some(discovery_service_name(&cluster_name)),
            selector: LabelSelector {
                match_labels: Some(pod_selector_labels(&cluster_name)),
                ..Default::default()
            },
            template: generate_pod_template(resource),
            volume_claim_templates: Some(vec![generate_pvc_template(resource)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn generate_pod_template(resource: &RabbitMQCustomResource) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_template_labels(resource)),
            annotations: Some(datadog_annotations(&resource.name_any())),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            init_containers: Some(vec![generate_init_container(resource)]),
            containers: vec![generate_rabbitmq_container(resource)],
            volumes: Some(vec![Volume {
                name: CONFIG_VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
            ..Default::default()
        }),
    }
}

/// Datadog autodiscovery annotations for the RabbitMQ check.
pub fn datadog_annotations(cluster_name: &str) -> BTreeMap<String, String> {
    let prefix = format!("ad.datadoghq.com/{}", cluster_name);
    BTreeMap::from([
        (
            format!("{}.check_names", prefix),
            r#"["rabbitmq"]"#.to_string(),
        ),
        (format!("{}.init_configs", prefix), "[{}]".to_string()),
        (
            format!("{}.instances", prefix),
            r#"[{"rabbitmq_api_url":"http://%%host%%:15672/api","rabbitmq_user":"monitoring","rabbitmq_pass":"monitoring"}]"#
                .to_string(),
        ),
    ])
}

/// Render `rabbitmq.conf` for kubernetes peer discovery.
pub fn rabbitmq_conf(cluster_name: &str, namespace: &str) -> String {
    let discovery = discovery_service_name(cluster_name);
    [
        "cluster_formation.peer_discovery_backend = rabbit_peer_discovery_k8s".to_string(),
        "cluster_formation.k8s.host = kubernetes.default.svc.cluster.local".to_string(),
        "cluster_formation.k8s.address_type = hostname".to_string(),
        format!("cluster_formation.k8s.service_name = {}", discovery),
        format!(
            "cluster_formation.k8s.hostname_suffix = .{}.{}.svc.cluster.local",
            discovery, namespace
        ),
        "cluster_formation.node_cleanup.only_log_warning = true".to_string(),
        "cluster_partition_handling = pause_minority".to_string(),
        "queue_master_locator = min-masters".to_string(),
    ]
    .join("\n")
}

fn generate_init_container(resource: &RabbitMQCustomResource) -> Container {
    let namespace = resource.namespace().unwrap_or_default();
    let script = format!(
        "echo '{}' > {}/enabled_plugins && cat > {}/rabbitmq.conf <<'EOF'\n{}\nEOF",
        ENABLED_PLUGINS,
        CONFIG_PATH,
        CONFIG_PATH,
        rabbitmq_conf(&resource.name_any(), &namespace)
    );

    Container {
        name: "rabbitmq-config".to_string(),
        image: Some(resource.spec.init_container_image.clone()),
        command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME_NAME.to_string(),
            mount_path: CONFIG_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn generate_rabbitmq_container(resource: &RabbitMQCustomResource) -> Container {
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(resource.spec.image.clone()),
        ports: Some(vec![
            container_port("epmd", EPMD_PORT),
            container_port("amqp", AMQP_PORT),
            container_port("dist", DIST_PORT),
            container_port("management", MANAGEMENT_PORT),
        ]),
        env: Some(generate_env_vars(resource)),
        resources: Some(generate_resource_requirements(resource)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: STORAGE_VOLUME_NAME.to_string(),
                mount_path: MNESIA_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: CONFIG_VOLUME_NAME.to_string(),
                mount_path: CONFIG_PATH.to_string(),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(diagnostics_probe("check_port_connectivity", 20, 10)),
        liveness_probe: Some(diagnostics_probe("status", 60, 30)),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn diagnostics_probe(check: &str, initial_delay: i32, period: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "rabbitmq-diagnostics".to_string(),
                "-q".to_string(),
                check.to_string(),
            ]),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(10),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Environment derived from namespace, cluster name, limits and watermark.
fn generate_env_vars(resource: &RabbitMQCustomResource) -> Vec<EnvVar> {
    let cluster_name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_default();
    let discovery = discovery_service_name(&cluster_name);

    vec![
        EnvVar {
            name: "MY_POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        plain_env("MY_POD_NAMESPACE", namespace.clone()),
        plain_env("RABBITMQ_USE_LONGNAME", "true".to_string()),
        plain_env(
            "RABBITMQ_NODENAME",
            format!(
                "rabbit@$(MY_POD_NAME).{}.{}.svc.cluster.local",
                discovery, namespace
            ),
        ),
        plain_env("K8S_SERVICE_NAME", discovery.clone()),
        plain_env(
            "K8S_HOSTNAME_SUFFIX",
            format!(".{}.{}.svc.cluster.local", discovery, namespace),
        ),
        secret_env(
            "RABBITMQ_ERLANG_COOKIE",
            erlang_cookie_secret_name(&cluster_name),
            ERLANG_COOKIE_KEY,
        ),
        secret_env(
            "RABBITMQ_DEFAULT_USER",
            admin_secret_name(&cluster_name),
            USERNAME_KEY,
        ),
        secret_env(
            "RABBITMQ_DEFAULT_PASS",
            admin_secret_name(&cluster_name),
            PASSWORD_KEY,
        ),
        plain_env(
            "RABBITMQ_VM_MEMORY_HIGH_WATERMARK",
            high_watermark(
                resource.spec.cluster_spec.high_watermark_fraction,
                resource.spec.compute_resources.limits.memory.as_deref(),
            ),
        ),
    ]
}

fn plain_env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret_name: String, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name,
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// High watermark setting: an absolute byte count when the memory limit is
/// known (the broker cannot see cgroup limits), the relative fraction otherwise.
pub fn high_watermark(fraction: f64, memory_limit: Option<&str>) -> String {
    match memory_limit.and_then(quantity_to_bytes) {
        Some(bytes) => format!("{}", (bytes as f64 * fraction).floor() as u64),
        None => format!("{}", fraction),
    }
}

/// Parse a memory quantity such as `2Gi` or `512M` into bytes.
pub fn quantity_to_bytes(quantity: &str) -> Option<u64> {
    let split = quantity
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(quantity.len());
    let (digits, suffix) = quantity.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

fn generate_resource_requirements(resource: &RabbitMQCustomResource) -> ResourceRequirements {
    let compute = &resource.spec.compute_resources;
    ResourceRequirements {
        requests: quantities(&compute.requests),
        limits: quantities(&compute.limits),
        ..Default::default()
    }
}

fn quantities(values: &ResourceQuantities) -> Option<BTreeMap<String, Quantity>> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &values.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &values.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if map.is_empty() { None } else { Some(map) }
}

/// Generate the `rabbitmq-storage` claim template, owned by the cluster CR.
fn generate_pvc_template(resource: &RabbitMQCustomResource) -> PersistentVolumeClaim {
    let storage = &resource.spec.storage_resources;
    let mut metadata = owned_metadata(resource, STORAGE_VOLUME_NAME.to_string());
    metadata.namespace = None;

    PersistentVolumeClaim {
        metadata,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(storage.storage_class_name.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.storage.clone()),
                )])),
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
    use crate::crd::{RabbitMQClusterSpec, StorageResources};
    use crate::resources::common::LABEL_INSTANCE;

    fn test_resource(name: &str) -> RabbitMQCustomResource {
        let mut cr = RabbitMQCustomResource::new(
            name,
            RabbitMQClusterSpec {
                replicas: 3,
                image: "broker:1".to_string(),
                storage_resources: StorageResources {
                    storage_class_name: "ssd".to_string(),
                    storage: "10Gi".to_string(),
                },
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("ns".to_string());
        cr.metadata.uid = Some("uid-1".to_string());
        cr
    }

    fn env_value(sts: &StatefulSet, name: &str) -> Option<String> {
        let container = &sts.spec.as_ref()?.template.spec.as_ref()?.containers[0];
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.clone())
    }

    #[test]
    fn test_generate_statefulset() {
        let sts = generate_statefulset(&test_resource("mq"));
        assert_eq!(sts.metadata.name.as_deref(), Some("mq"));
        assert_eq!(sts.metadata.namespace.as_deref(), Some("ns"));

        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("mq-discovery"));
        assert_eq!(
            spec.selector.match_labels.unwrap(),
            BTreeMap::from([(LABEL_INSTANCE.to_string(), "mq".to_string())])
        );
    }

    #[test]
    fn test_pvc_template() {
        let sts = generate_statefulset(&test_resource("mq"));
        let templates = sts.spec.unwrap().volume_claim_templates.unwrap();
        assert_eq!(templates.len(), 1);

        let pvc = &templates[0];
        assert_eq!(pvc.metadata.name.as_deref(), Some("rabbitmq-storage"));
        assert_eq!(pvc.metadata.owner_references.as_ref().unwrap().len(), 1);

        let spec = pvc.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("ssd"));
        assert_eq!(
            spec.access_modes.as_ref().unwrap(),
            &vec!["ReadWriteOnce".to_string()]
        );
        let requests = spec.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests["storage"], Quantity("10Gi".to_string()));
    }

    #[test]
    fn test_pod_template_annotations() {
        let sts = generate_statefulset(&test_resource("orders"));
        let annotations = sts
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert_eq!(
            annotations["ad.datadoghq.com/orders.check_names"],
            r#"["rabbitmq"]"#
        );
        assert!(annotations.contains_key("ad.datadoghq.com/orders.instances"));
        assert!(annotations.contains_key("ad.datadoghq.com/orders.init_configs"));
    }

    #[test]
    fn test_env_vars() {
        let sts = generate_statefulset(&test_resource("mq"));
        assert_eq!(
            env_value(&sts, "RABBITMQ_NODENAME").as_deref(),
            Some("rabbit@$(MY_POD_NAME).mq-discovery.ns.svc.cluster.local")
        );
        assert_eq!(env_value(&sts, "K8S_SERVICE_NAME").as_deref(), Some("mq-discovery"));
        // No memory limit: relative fraction
        assert_eq!(
            env_value(&sts, "RABBITMQ_VM_MEMORY_HIGH_WATERMARK").as_deref(),
            Some("0.4")
        );
    }

    #[test]
    fn test_high_watermark_with_memory_limit() {
        assert_eq!(high_watermark(0.5, Some("2Gi")), "1073741824");
        assert_eq!(high_watermark(0.4, Some("1000M")), "400000000");
        assert_eq!(high_watermark(0.4, Some("weird")), "0.4");
        assert_eq!(high_watermark(1.0, None), "1");
    }

    #[test]
    fn test_quantity_to_bytes() {
        assert_eq!(quantity_to_bytes("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(quantity_to_bytes("1k"), Some(1000));
        assert_eq!(quantity_to_bytes("42"), Some(42));
        assert_eq!(quantity_to_bytes("1.5Gi"), None);
        assert_eq!(quantity_to_bytes(""), None);
    }

    #[test]
    fn test_rabbitmq_conf() {
        let conf = rabbitmq_conf("mq", "ns");
        assert!(conf.contains("cluster_formation.k8s.service_name = mq-discovery"));
        assert!(conf.contains("hostname_suffix = .mq-discovery.ns.svc.cluster.local"));
        assert!(conf.contains("cluster_partition_handling = pause_minority"));
    }
}
