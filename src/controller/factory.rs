//! Desired-state projection of a RabbitMQ cluster.
//!
//! [`build`] turns a cluster CR into every object the operator manages for it.
//! It performs no I/O: existing secrets are passed in through [`SecretsLookup`]
//! so generated credentials stay stable, and random values come from the
//! injected [`RandomStringGenerator`].

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::client::Credentials;
use crate::controller::error::{Error, Result};
use crate::controller::validation::validate_spec;
use crate::crd::{ClusterKey, PolicySpec, RabbitMQCustomResource, ShovelSpec};
use crate::resources::common::{admin_secret_name, erlang_cookie_secret_name, user_secret_name};
use crate::resources::pdb::generate_pod_disruption_budget;
use crate::resources::secrets::{
    ERLANG_COOKIE_LENGTH, PASSWORD_KEY, PASSWORD_LENGTH, USERNAME_KEY,
    generate_admin_secret, generate_erlang_cookie_secret, generate_user_secret, secret_value,
};
use crate::resources::services::{
    generate_discovery_service, generate_load_balancer_service, generate_main_service,
    generate_node_port_service,
};
use crate::resources::statefulset::generate_statefulset;

/// Source of random strings for credentials.
pub trait RandomStringGenerator: Send + Sync {
    fn generate(&self, length: usize) -> String;
}

/// `[A-Za-z0-9]` strings from the thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlphanumericGenerator;

impl RandomStringGenerator for AlphanumericGenerator {
    fn generate(&self, length: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }
}

/// Secrets that already exist in the cluster's namespace, by name.
pub trait SecretsLookup: Send + Sync {
    fn get(&self, name: &str) -> Option<&Secret>;
}

impl SecretsLookup for BTreeMap<String, Secret> {
    fn get(&self, name: &str) -> Option<&Secret> {
        BTreeMap::get(self, name)
    }
}

/// Collaborators of [`build`].
#[derive(Clone, Copy)]
pub struct Deps<'a> {
    pub secrets: &'a dyn SecretsLookup,
    pub random: &'a dyn RandomStringGenerator,
}

/// A secret together with whether it was generated by this build.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSecret {
    pub secret: Secret,
    /// True when no secret existed and the credentials are new
    pub generated: bool,
}

impl ResolvedSecret {
    pub fn name(&self) -> String {
        self.secret.name_any()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        secret_value(&self.secret, key)
    }

    /// Username and password stored in the secret.
    pub fn credentials(&self) -> Result<Credentials> {
        let username = self
            .value(USERNAME_KEY)
            .ok_or_else(|| Error::MissingField(format!("{}.data.{}", self.name(), USERNAME_KEY)))?;
        let password = self
            .value(PASSWORD_KEY)
            .ok_or_else(|| Error::MissingField(format!("{}.data.{}", self.name(), PASSWORD_KEY)))?;
        Ok(Credentials::new(username, password))
    }
}

/// A broker user and the secret holding its password.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredUser {
    pub username: String,
    pub vhosts: Vec<String>,
    pub tags: Vec<String>,
    pub secret: ResolvedSecret,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DesiredServices {
    pub main: Service,
    pub discovery: Service,
    pub load_balancer: Option<Service>,
    pub node_port: Option<Service>,
}

/// Everything the operator manages for one cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredCluster {
    pub key: ClusterKey,
    pub admin: ResolvedSecret,
    pub erlang_cookie: ResolvedSecret,
    pub users: Vec<DesiredUser>,
    pub services: DesiredServices,
    pub statefulset: StatefulSet,
    pub pdb: PodDisruptionBudget,
    pub policies: Vec<PolicySpec>,
    pub operator_policies: Vec<PolicySpec>,
    pub shovels: Vec<ShovelSpec>,
}

impl DesiredCluster {
    /// Every secret in creation order: admin, erlang cookie, then users.
    pub fn secrets(&self) -> impl Iterator<Item = &ResolvedSecret> {
        [&self.admin, &self.erlang_cookie]
            .into_iter()
            .chain(self.users.iter().map(|u| &u.secret))
    }
}

/// Validate the cluster CR and project it into its desired objects.
pub fn build(resource: &RabbitMQCustomResource, deps: &Deps<'_>) -> Result<DesiredCluster> {
    validate_spec(resource)?;

    let key = resource
        .cluster_key()
        .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
    let name = resource.name_any();

    let admin = resolve_secret(deps, admin_secret_name(&name), || {
        generate_admin_secret(resource, &deps.random.generate(PASSWORD_LENGTH))
    });
    let erlang_cookie = resolve_secret(deps, erlang_cookie_secret_name(&name), || {
        generate_erlang_cookie_secret(resource, &deps.random.generate(ERLANG_COOKIE_LENGTH))
    });

    let users = resource
        .spec
        .cluster_spec
        .users
        .iter()
        .map(|user| DesiredUser {
            username: user.username.clone(),
            vhosts: user.vhosts.clone(),
            tags: user.tags.clone(),
            secret: resolve_secret(deps, user_secret_name(&name, &user.username), || {
                generate_user_secret(
                    resource,
                    &user.username,
                    &deps.random.generate(PASSWORD_LENGTH),
                )
            }),
        })
        .collect();

    let services = DesiredServices {
        main: generate_main_service(resource),
        discovery: generate_discovery_service(resource),
        load_balancer: resource
            .spec
            .create_load_balancer
            .then(|| generate_load_balancer_service(resource)),
        node_port: resource
            .spec
            .create_node_port
            .then(|| generate_node_port_service(resource)),
    };

    Ok(DesiredCluster {
        key,
        admin,
        erlang_cookie,
        users,
        services,
        statefulset: generate_statefulset(resource),
        pdb: generate_pod_disruption_budget(resource),
        policies: resource.spec.cluster_spec.policies.clone(),
        operator_policies: resource.spec.cluster_spec.operator_policies.clone(),
        shovels: resource.spec.cluster_spec.shovels.clone(),
    })
}

fn resolve_secret(
    deps: &Deps<'_>,
    name: String,
    generate: impl FnOnce() -> Secret,
) -> ResolvedSecret {
    match deps.secrets.get(&name) {
        Some(existing) => ResolvedSecret {
            secret: existing.clone(),
            generated: false,
        },
        None => ResolvedSecret {
            secret: generate(),
            generated: true,
        },
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
    use crate::crd::{RabbitMQClusterSpec, StorageResources, UserSpec};
    use crate::resources::secrets::ERLANG_COOKIE_KEY;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns "r0", "r1", ... padded to the requested length.
    #[derive(Default)]
    struct CountingGenerator(AtomicUsize);

    impl RandomStringGenerator for CountingGenerator {
        fn generate(&self, length: usize) -> String {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            format!("{:0>width$}", format!("r{}", n), width = length)
        }
    }

    fn cluster() -> RabbitMQCustomResource {
        let mut resource = RabbitMQCustomResource::new(
            "mq",
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
        resource.metadata.namespace = Some("ns".to_string());
        resource.metadata.uid = Some("uid-1".to_string());
        resource
    }

    #[test]
    fn test_alphanumeric_generator() {
        let value = AlphanumericGenerator.generate(PASSWORD_LENGTH);
        assert_eq!(value.len(), PASSWORD_LENGTH);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_build_generates_missing_secrets() {
        let existing = BTreeMap::new();
        let random = CountingGenerator::default();
        let deps = Deps {
            secrets: &existing,
            random: &random,
        };

        let desired = build(&cluster(), &deps).unwrap();
        assert_eq!(desired.key, ClusterKey::new("ns", "mq"));
        assert!(desired.admin.generated);
        assert!(desired.erlang_cookie.generated);
        assert_eq!(desired.admin.name(), "mq-admin");
        assert_eq!(desired.erlang_cookie.name(), "mq-erlang-cookie");
        assert_eq!(
            desired.erlang_cookie.value(ERLANG_COOKIE_KEY).unwrap().len(),
            ERLANG_COOKIE_LENGTH
        );
        let creds = desired.admin.credentials().unwrap();
        assert_eq!(creds.username, "rabbit");
        assert_eq!(creds.password.len(), PASSWORD_LENGTH);
        assert!(desired.services.load_balancer.is_none());
        assert!(desired.services.node_port.is_none());
    }

    #[test]
    fn test_build_reuses_existing_secrets() {
        let first = {
            let existing = BTreeMap::new();
            let random = CountingGenerator::default();
            build(
                &cluster(),
                &Deps {
                    secrets: &existing,
                    random: &random,
                },
            )
            .unwrap()
        };

        let existing: BTreeMap<String, Secret> = first
            .secrets()
            .map(|s| (s.name(), s.secret.clone()))
            .collect();
        let random = CountingGenerator(AtomicUsize::new(100));
        let second = build(
            &cluster(),
            &Deps {
                secrets: &existing,
                random: &random,
            },
        )
        .unwrap();

        assert!(!second.admin.generated);
        assert_eq!(second.admin.secret, first.admin.secret);
        assert_eq!(second.erlang_cookie.secret, first.erlang_cookie.secret);
        assert_eq!(random.0.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_build_users_and_optional_services() {
        let mut resource = cluster();
        resource.spec.create_load_balancer = true;
        resource.spec.create_node_port = true;
        resource.spec.cluster_spec.users = vec![UserSpec {
            username: "app".to_string(),
            vhosts: vec!["/".to_string()],
            tags: vec!["monitoring".to_string()],
        }];
        let existing = BTreeMap::new();
        let random = CountingGenerator::default();
        let desired = build(
            &resource,
            &Deps {
                secrets: &existing,
                random: &random,
            },
        )
        .unwrap();

        assert_eq!(desired.users.len(), 1);
        assert_eq!(desired.users[0].secret.name(), "mq-app-user");
        assert_eq!(
            desired.users[0].secret.value(USERNAME_KEY).as_deref(),
            Some("app")
        );
        assert_eq!(desired.secrets().count(), 3);
        assert_eq!(
            desired.services.load_balancer.unwrap().name_any(),
            "mq-loadbalancer"
        );
        assert_eq!(desired.services.node_port.unwrap().name_any(), "mq-nodeport");
    }

    #[test]
    fn test_build_rejects_invalid_spec() {
        let mut resource = cluster();
        resource.spec.replicas = 0;
        let existing = BTreeMap::new();
        let random = CountingGenerator::default();
        let result = build(
            &resource,
            &Deps {
                secrets: &existing,
                random: &random,
            },
        );
        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(random.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_build_requires_namespace() {
        let mut resource = cluster();
        resource.metadata.namespace = None;
        let existing = BTreeMap::new();
        let random = CountingGenerator::default();
        let result = build(
            &resource,
            &Deps {
                secrets: &existing,
                random: &random,
            },
        );
        assert!(matches!(result, Err(Error::MissingField(_))));
    }
}
