//! Validation logic for RabbitMQ cluster specs.
//!
//! Validators run in a fixed order and accumulate messages rather than
//! stopping at the first problem, so a rejected spec reports everything wrong
//! with it at once:
//! - Name length and replica count
//! - Image, storage and compute resource quantities
//! - High watermark fraction
//! - Users, policies, operator policies and shovels

use std::collections::HashSet;
use std::sync::LazyLock;

use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::{PolicySpec, RabbitMQCustomResource};

/// Maximum name length to leave room for suffixes like -poddisruptionbudget
pub const MAX_NAME_LENGTH: usize = 50;

/// Minimum number of broker nodes
pub const MIN_REPLICAS: i32 = 1;

/// Values accepted by the broker for a policy's `apply-to`
pub const APPLY_TO_VALUES: [&str; 3] = ["all", "queues", "exchanges"];

/// Values accepted by the broker for a shovel's `ack-mode`
pub const ACK_MODES: [&str; 3] = ["on-confirm", "on-publish", "no-ack"];

type Validator = fn(&RabbitMQCustomResource, &mut Vec<String>);

/// Every validator, in the order they run
const VALIDATORS: [Validator; 10] = [
    validate_name_length,
    validate_replicas,
    validate_image,
    validate_storage,
    validate_compute_resources,
    validate_high_watermark,
    validate_users,
    validate_policies,
    validate_operator_policies,
    validate_shovels,
];

/// Collect every validation message for a cluster spec
pub fn validation_messages(resource: &RabbitMQCustomResource) -> Vec<String> {
    let mut messages = Vec::new();
    for validator in VALIDATORS {
        validator(resource, &mut messages);
    }
    messages
}

/// Validate the resource spec
pub fn validate_spec(resource: &RabbitMQCustomResource) -> Result<()> {
    let messages = validation_messages(resource);
    if messages.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(messages))
    }
}

fn validate_name_length(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    let name = resource.name_any();
    if name.len() > MAX_NAME_LENGTH {
        messages.push(format!(
            "name '{}' exceeds maximum length of {} characters",
            name, MAX_NAME_LENGTH
        ));
    }
}

fn validate_replicas(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    let replicas = resource.spec.replicas;
    if replicas < MIN_REPLICAS {
        messages.push(format!(
            "replica count {} is below minimum {}",
            replicas, MIN_REPLICAS
        ));
    }
}

fn validate_image(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    if resource.spec.image.trim().is_empty() {
        messages.push("rabbitMQImage must not be empty".to_string());
    }
    if resource.spec.init_container_image.trim().is_empty() {
        messages.push("initContainerImage must not be empty".to_string());
    }
}

fn validate_storage(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    let storage = &resource.spec.storage_resources;
    if storage.storage_class_name.trim().is_empty() {
        messages.push("storageResources.storageClassName must not be empty".to_string());
    }
    if !is_valid_storage_size(&storage.storage) {
        messages.push(format!(
            "invalid storage size '{}'. Expected format: <number><unit> where unit is Ki, Mi, Gi, Ti, Pi, or Ei (e.g., 10Gi)",
            storage.storage
        ));
    }
}

fn validate_compute_resources(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    let compute = &resource.spec.compute_resources;
    for (which, quantities) in [("requests", &compute.requests), ("limits", &compute.limits)] {
        if let Some(cpu) = &quantities.cpu
            && !is_valid_cpu(cpu)
        {
            messages.push(format!(
                "invalid CPU {} '{}'. Expected format: <number>m or <decimal> (e.g., 100m, 0.5, 1)",
                which, cpu
            ));
        }
        if let Some(memory) = &quantities.memory
            && !is_valid_memory(memory)
        {
            messages.push(format!(
                "invalid memory {} '{}'. Expected format: <number><unit> where unit is Ki, Mi, Gi, Ti, k, M, G or T (e.g., 256Mi)",
                which, memory
            ));
        }
    }
}

fn validate_high_watermark(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    let fraction = resource.spec.cluster_spec.high_watermark_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
        messages.push(format!(
            "highWatermarkFraction {} must be in (0, 1]",
            fraction
        ));
    }
}

fn validate_users(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for user in &resource.spec.cluster_spec.users {
        if user.username.trim().is_empty() {
            messages.push("user with empty username".to_string());
            continue;
        }
        if !seen.insert(user.username.as_str()) {
            messages.push(format!("duplicate user '{}'", user.username));
        }
        if user.vhosts.iter().any(|v| v.is_empty()) {
            messages.push(format!("user '{}' lists an empty vhost", user.username));
        }
    }
}

fn validate_policies(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    validate_policy_list("policy", &resource.spec.cluster_spec.policies, messages);
}

fn validate_operator_policies(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    validate_policy_list(
        "operator policy",
        &resource.spec.cluster_spec.operator_policies,
        messages,
    );
}

fn validate_policy_list(kind: &str, policies: &[PolicySpec], messages: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for policy in policies {
        if policy.name.trim().is_empty() || policy.vhost.is_empty() {
            messages.push(format!("{} with empty name or vhost", kind));
            continue;
        }
        if !seen.insert((policy.vhost.as_str(), policy.name.as_str())) {
            messages.push(format!(
                "duplicate {} '{}' in vhost '{}'",
                kind, policy.name, policy.vhost
            ));
        }
        if policy.pattern.is_empty() {
            messages.push(format!("{} '{}' has an empty pattern", kind, policy.name));
        }
        if !APPLY_TO_VALUES.contains(&policy.apply_to.as_str()) {
            messages.push(format!(
                "{} '{}' has unknown applyTo '{}' (expected one of {})",
                kind,
                policy.name,
                policy.apply_to,
                APPLY_TO_VALUES.join(", ")
            ));
        }
        if policy.definition.is_empty() {
            messages.push(format!("{} '{}' has an empty definition", kind, policy.name));
        }
    }
}

fn validate_shovels(resource: &RabbitMQCustomResource, messages: &mut Vec<String>) {
    let mut seen = HashSet::new();
    // The broker keys shovel parameters by (vhost, name)
    let mut addresses = HashSet::new();
    for shovel in &resource.spec.cluster_spec.shovels {
        let label = if shovel.name.is_empty() {
            shovel.uuid.as_str()
        } else {
            shovel.name.as_str()
        };
        if shovel.name.trim().is_empty() {
            messages.push("shovel with empty name".to_string());
        }
        if shovel.uuid.trim().is_empty() {
            messages.push(format!("shovel '{}' has an empty uuid", label));
        } else if !seen.insert(shovel.uuid.as_str()) {
            messages.push(format!("duplicate shovel uuid '{}'", shovel.uuid));
        }
        if !shovel.name.trim().is_empty()
            && !addresses.insert((shovel.source.vhost.as_str(), shovel.name.as_str()))
        {
            messages.push(format!(
                "duplicate shovel '{}' in vhost '{}'",
                shovel.name, shovel.source.vhost
            ));
        }
        if shovel.source.queue.is_empty() || shovel.source.vhost.is_empty() {
            messages.push(format!(
                "shovel '{}' needs a source queue and vhost",
                label
            ));
        }
        let destination = &shovel.destination;
        if destination.addresses.is_empty()
            || destination.addresses.iter().any(|a| a.address.trim().is_empty())
        {
            messages.push(format!(
                "shovel '{}' needs at least one non-empty destination address",
                label
            ));
        }
        if destination.secret_name.is_empty() || destination.secret_namespace.is_empty() {
            messages.push(format!(
                "shovel '{}' needs destination secretName and secretNamespace",
                label
            ));
        }
        if !ACK_MODES.contains(&shovel.ack_mode.as_str()) {
            messages.push(format!(
                "shovel '{}' has unknown ackMode '{}' (expected one of {})",
                label,
                shovel.ack_mode,
                ACK_MODES.join(", ")
            ));
        }
    }
}

/// Check if a storage size string is valid
fn is_valid_storage_size(size: &str) -> bool {
    // Pattern: ^([0-9]+)(Ki|Mi|Gi|Ti|Pi|Ei)?$
    static STORAGE_RE: LazyLock<Option<regex::Regex>> =
        LazyLock::new(|| regex::Regex::new(r"^([0-9]+)(Ki|Mi|Gi|Ti|Pi|Ei)?$").ok());
    STORAGE_RE.as_ref().is_some_and(|re| re.is_match(size))
}

/// Check if a CPU string is valid
fn is_valid_cpu(cpu: &str) -> bool {
    // Pattern: ^([0-9]+m?|[0-9]*\.[0-9]+)$
    static CPU_RE: LazyLock<Option<regex::Regex>> =
        LazyLock::new(|| regex::Regex::new(r"^([0-9]+m?|[0-9]*\.[0-9]+)$").ok());
    CPU_RE.as_ref().is_some_and(|re| re.is_match(cpu))
}

/// Check if a memory string is valid
fn is_valid_memory(memory: &str) -> bool {
    static MEMORY_RE: LazyLock<Option<regex::Regex>> =
        LazyLock::new(|| regex::Regex::new(r"^([0-9]+)(Ki|Mi|Gi|Ti|k|M|G|T)?$").ok());
    MEMORY_RE.as_ref().is_some_and(|re| re.is_match(memory))
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
    use crate::crd::{
        AddressAndVhost, DestinationShovelSpec, RabbitMQClusterSpec, ResourceQuantities,
        ShovelSpec, SourceShovelSpec, StorageResources, UserSpec,
    };
    use std::collections::BTreeMap;

    fn valid_resource() -> RabbitMQCustomResource {
        RabbitMQCustomResource::new(
            "mq",
            RabbitMQClusterSpec {
                image: "rabbitmq:3.8".to_string(),
                storage_resources: StorageResources {
                    storage_class_name: "ssd".to_string(),
                    storage: "10Gi".to_string(),
                },
                ..Default::default()
            },
        )
    }

    fn policy(name: &str) -> PolicySpec {
        PolicySpec {
            name: name.to_string(),
            vhost: "/".to_string(),
            pattern: ".*".to_string(),
            priority: 0,
            apply_to: "queues".to_string(),
            definition: BTreeMap::from([("ha-mode".to_string(), serde_json::json!("all"))]),
        }
    }

    fn shovel(uuid: &str) -> ShovelSpec {
        ShovelSpec {
            name: format!("shovel-{}", uuid),
            uuid: uuid.to_string(),
            source: SourceShovelSpec {
                queue: "orders".to_string(),
                vhost: "/".to_string(),
            },
            destination: DestinationShovelSpec {
                addresses: vec![AddressAndVhost {
                    address: "dr.example.com".to_string(),
                    vhost: "/".to_string(),
                }],
                secret_name: "dr".to_string(),
                secret_namespace: "ns".to_string(),
                queue: None,
            },
            ack_mode: "on-confirm".to_string(),
            delete_after: "never".to_string(),
            prefetch_count: 1000,
            reconnect_delay: 5,
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(validate_spec(&valid_resource()).is_ok());
    }

    #[test]
    fn test_messages_accumulate_in_order() {
        let mut resource = valid_resource();
        resource.spec.replicas = 0;
        resource.spec.image = String::new();
        resource.spec.cluster_spec.high_watermark_fraction = 1.5;

        let messages = validation_messages(&resource);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].contains("replica count 0"));
        assert!(messages[1].contains("rabbitMQImage"));
        assert!(messages[2].contains("highWatermarkFraction"));

        match validate_spec(&resource) {
            Err(Error::Validation { messages }) => assert_eq!(messages.len(), 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_name_length() {
        let resource = RabbitMQCustomResource::new(&"a".repeat(51), valid_resource().spec);
        assert_eq!(validation_messages(&resource).len(), 1);
    }

    #[test]
    fn test_storage_and_compute_quantities() {
        let mut resource = valid_resource();
        resource.spec.storage_resources.storage = "10GB".to_string();
        resource.spec.compute_resources.limits = ResourceQuantities {
            cpu: Some("two".to_string()),
            memory: Some("2Gi".to_string()),
        };
        resource.spec.compute_resources.requests = ResourceQuantities {
            cpu: Some("500m".to_string()),
            memory: Some("1.5Gi".to_string()),
        };
        let messages = validation_messages(&resource);
        assert_eq!(messages.len(), 3, "{:?}", messages);
    }

    #[test]
    fn test_high_watermark_bounds() {
        let mut resource = valid_resource();
        resource.spec.cluster_spec.high_watermark_fraction = 1.0;
        assert!(validate_spec(&resource).is_ok());
        resource.spec.cluster_spec.high_watermark_fraction = 0.0;
        assert!(validate_spec(&resource).is_err());
        resource.spec.cluster_spec.high_watermark_fraction = f64::NAN;
        assert!(validate_spec(&resource).is_err());
    }

    #[test]
    fn test_duplicate_users() {
        let mut resource = valid_resource();
        let user = UserSpec {
            username: "app".to_string(),
            vhosts: vec!["/".to_string()],
            tags: vec![],
        };
        resource.spec.cluster_spec.users = vec![user.clone(), user];
        let messages = validation_messages(&resource);
        assert_eq!(messages, vec!["duplicate user 'app'".to_string()]);
    }

    #[test]
    fn test_policies() {
        let mut resource = valid_resource();
        let mut bad = policy("bad");
        bad.apply_to = "streams".to_string();
        bad.definition.clear();
        resource.spec.cluster_spec.policies = vec![policy("ha"), policy("ha"), bad];
        let messages = validation_messages(&resource);
        assert_eq!(messages.len(), 3, "{:?}", messages);
        assert!(messages[0].contains("duplicate policy 'ha'"));

        // Same (vhost, name) in the other list is fine
        let mut resource = valid_resource();
        resource.spec.cluster_spec.policies = vec![policy("ha")];
        resource.spec.cluster_spec.operator_policies = vec![policy("ha")];
        assert!(validate_spec(&resource).is_ok());
    }

    #[test]
    fn test_shovels() {
        let mut resource = valid_resource();
        resource.spec.cluster_spec.shovels = vec![shovel("u1"), shovel("u2")];
        assert!(validate_spec(&resource).is_ok());

        let mut dup = shovel("u1");
        dup.ack_mode = "sometimes".to_string();
        dup.destination.secret_namespace = String::new();
        resource.spec.cluster_spec.shovels.push(dup);
        let messages = validation_messages(&resource);
        assert_eq!(messages.len(), 4, "{:?}", messages);
        assert!(messages[0].contains("duplicate shovel uuid 'u1'"));
        assert!(messages[1].contains("duplicate shovel 'shovel-u1' in vhost '/'"));
    }

    #[test]
    fn test_shovel_names_unique_per_vhost() {
        let mut resource = valid_resource();
        let mut renamed = shovel("u2");
        renamed.name = "shovel-u1".to_string();
        resource.spec.cluster_spec.shovels = vec![shovel("u1"), renamed.clone()];
        assert_eq!(
            validation_messages(&resource),
            vec!["duplicate shovel 'shovel-u1' in vhost '/'".to_string()]
        );

        // The same name in another vhost is a different broker object
        renamed.source.vhost = "orders".to_string();
        resource.spec.cluster_spec.shovels = vec![shovel("u1"), renamed];
        assert!(validate_spec(&resource).is_ok());
    }
}
