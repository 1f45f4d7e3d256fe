//! Reconciliation of RabbitMQ clusters.
//!
//! One pass projects the cluster CR into its desired objects, converges the
//! Kubernetes side (secrets, services, StatefulSet, PDB, PVC metadata), then
//! runs the broker-side child reconcilers and records the outcome in the CR
//! status. Every step is idempotent; the next event or sweep retries failures.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::client::kube_api::ObjectApi;
use crate::client::management::PolicyKind;
use crate::controller::common::{SPEC_HASH_ANNOTATION, holds_desired, spec_hash};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::factory::{self, DesiredCluster, Deps, ResolvedSecret};
use crate::controller::policy_reconciler::reconcile_policies;
use crate::controller::shovel_reconciler::reconcile_shovels;
use crate::controller::status::{ConditionBuilder, is_condition_false};
use crate::controller::user_reconciler::reconcile_users;
use crate::crd::{
    ClusterKey, ConditionType, ManagedBrokerObjects, RabbitMQCustomResource,
    RabbitMQNetworkPartitionCustomResource,
};
use crate::resources::common::{
    admin_secret_name, erlang_cookie_secret_name, instance_selector, load_balancer_service_name,
    node_port_service_name, owner_reference, standard_labels, user_secret_name,
};

/// Reconcile the cluster identified by `key`.
pub async fn reconcile_cluster(key: ClusterKey, ctx: Arc<Context>) -> Result<()> {
    let Some(resource) = ctx.apis.clusters.get(&key.namespace, &key.name).await? else {
        debug!(cluster = %key, "Cluster no longer exists, nothing to reconcile");
        return Ok(());
    };
    if resource.metadata.deletion_timestamp.is_some() {
        debug!(cluster = %key, "Cluster is being deleted, skipping");
        return Ok(());
    }

    debug!(cluster = %key, "Reconciling RabbitMQ cluster");

    let existing = fetch_existing_secrets(&ctx, &resource, &key.namespace).await?;
    let built = factory::build(
        &resource,
        &Deps {
            secrets: &existing,
            random: ctx.random.as_ref(),
        },
    );
    let mut desired = match built {
        Ok(desired) => desired,
        Err(Error::Validation { messages }) if rejection_recorded(&resource) => {
            debug!(cluster = %key, "Spec already rejected for this generation");
            return Err(Error::validation(messages));
        }
        Err(Error::Validation { messages }) => {
            error!(cluster = %key, messages = ?messages, "Cluster spec failed validation");
            ctx.publish_warning_event(
                &resource,
                "ValidationFailed",
                "Validating",
                Some(messages.join("; ")),
            )
            .await;
            update_invalid_status(&ctx, &resource, &messages).await?;
            return Err(Error::validation(messages));
        }
        Err(e) => return Err(e),
    };

    ensure_secrets(&ctx, &key.namespace, &mut desired).await?;
    apply_services(&ctx, &key, &desired).await?;

    let partition_active = partition_in_progress(&ctx, &key).await?;
    let statefulset = apply_statefulset(&ctx, &key, &desired, partition_active).await?;
    if statefulset.is_none() {
        ctx.publish_normal_event(
            &resource,
            "Created",
            "CreateResources",
            Some(format!("Created StatefulSet {}", key.name)),
        )
        .await;
    }

    apply_hashed(ctx.apis.pdbs.as_ref(), &key.namespace, desired.pdb.clone()).await?;
    converge_pvc_metadata(&ctx, &resource, &key.namespace).await?;

    let previous = resource
        .status
        .as_ref()
        .map(|s| s.managed_objects.clone())
        .unwrap_or_default();
    let (managed, failures) = reconcile_children(&ctx, &key, &desired, &previous).await;

    let ready = statefulset
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .map(|s| s.ready_replicas.unwrap_or(0))
        .unwrap_or(0);
    update_status(&ctx, &resource, ready, partition_active, &managed, &failures).await?;

    if let Some(health) = &ctx.health_state {
        health.metrics.set_cluster_replicas(
            &key.namespace,
            &key.name,
            i64::from(resource.spec.replicas),
            i64::from(ready),
        );
    }

    if failures.is_empty() {
        debug!(cluster = %key, "Reconcile complete");
        Ok(())
    } else {
        ctx.publish_warning_event(
            &resource,
            "BrokerSyncFailed",
            "Reconciling",
            Some(failures.join("; ")),
        )
        .await;
        Err(Error::ChildrenFailed { failures })
    }
}

/// Whether the current generation was already reported as invalid.
fn rejection_recorded(resource: &RabbitMQCustomResource) -> bool {
    resource.status.as_ref().is_some_and(|status| {
        status.observed_generation.is_some()
            && status.observed_generation == resource.metadata.generation
            && is_condition_false(&status.conditions, ConditionType::Validated)
    })
}

/// Look up every secret the factory may need, by its deterministic name.
async fn fetch_existing_secrets(
    ctx: &Context,
    resource: &RabbitMQCustomResource,
    namespace: &str,
) -> Result<BTreeMap<String, Secret>> {
    let cluster = resource.name_any();
    let names = [admin_secret_name(&cluster), erlang_cookie_secret_name(&cluster)]
        .into_iter()
        .chain(
            resource
                .spec
                .cluster_spec
                .users
                .iter()
                .map(|u| user_secret_name(&cluster, &u.username)),
        );

    let mut existing = BTreeMap::new();
    for name in names {
        if let Some(secret) = ctx.apis.secrets.get(namespace, &name).await? {
            existing.insert(name, secret);
        }
    }
    Ok(existing)
}

/// Create generated secrets. Existing secrets are never written.
async fn ensure_secrets(ctx: &Context, namespace: &str, desired: &mut DesiredCluster) -> Result<()> {
    ensure_secret(ctx, namespace, &mut desired.admin).await?;
    ensure_secret(ctx, namespace, &mut desired.erlang_cookie).await?;
    for user in &mut desired.users {
        ensure_secret(ctx, namespace, &mut user.secret).await?;
    }
    Ok(())
}

async fn ensure_secret(ctx: &Context, namespace: &str, resolved: &mut ResolvedSecret) -> Result<()> {
    if !resolved.generated {
        return Ok(());
    }
    let name = resolved.name();
    match ctx.apis.secrets.create(namespace, &resolved.secret).await {
        Ok(_) => {
            info!(secret = %name, namespace = %namespace, "Created secret");
            Ok(())
        }
        Err(Error::AlreadyExists(_)) => {
            // Lost a race with another writer; the stored credentials win.
            warn!(secret = %name, namespace = %namespace, "Secret appeared concurrently, using stored value");
            let stored = ctx
                .apis
                .secrets
                .get(namespace, &name)
                .await?
                .ok_or_else(|| Error::Transient(format!("secret {} vanished after conflict", name)))?;
            *resolved = ResolvedSecret {
                secret: stored,
                generated: false,
            };
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn apply_services(ctx: &Context, key: &ClusterKey, desired: &DesiredCluster) -> Result<()> {
    let services = ctx.apis.services.as_ref();
    let ns = &key.namespace;
    apply_hashed(services, ns, desired.services.main.clone()).await?;
    apply_hashed(services, ns, desired.services.discovery.clone()).await?;

    apply_optional_service(
        services,
        ns,
        &load_balancer_service_name(&key.name),
        desired.services.load_balancer.as_ref(),
    )
    .await?;
    apply_optional_service(
        services,
        ns,
        &node_port_service_name(&key.name),
        desired.services.node_port.as_ref(),
    )
    .await
}

async fn apply_optional_service(
    api: &dyn ObjectApi<Service>,
    namespace: &str,
    name: &str,
    desired: Option<&Service>,
) -> Result<()> {
    match desired {
        Some(service) => {
            apply_hashed(api, namespace, service.clone()).await?;
        }
        None => {
            if api.delete(namespace, name).await? {
                info!(service = %name, namespace = %namespace, "Deleted disabled service");
            }
        }
    }
    Ok(())
}

/// Whether a partition recovery that still needs the replica count is running.
async fn partition_in_progress(ctx: &Context, key: &ClusterKey) -> Result<bool> {
    let partitions = ctx.apis.partitions.list(&key.namespace, None).await?;
    Ok(partitions.iter().any(|p| is_active_partition_of(p, &key.name)))
}

/// Rejected requests never act on the cluster, so they do not count.
pub(crate) fn is_active_partition_of(
    partition: &RabbitMQNetworkPartitionCustomResource,
    cluster_name: &str,
) -> bool {
    let rejected = partition
        .status
        .as_ref()
        .is_some_and(|s| is_condition_false(&s.conditions, ConditionType::Validated));
    partition.spec.cluster_name == cluster_name
        && partition.metadata.deletion_timestamp.is_none()
        && !partition.state().is_terminal()
        && !rejected
}

/// Apply the StatefulSet; returns the live object seen before the apply.
///
/// The spec-hash covers the spec's replica count. While a partition recovery
/// is running the desired object carries the live replica count instead, so
/// the partition reconciler's scaling is left alone.
async fn apply_statefulset(
    ctx: &Context,
    key: &ClusterKey,
    desired: &DesiredCluster,
    partition_active: bool,
) -> Result<Option<StatefulSet>> {
    let api = ctx.apis.statefulsets.as_ref();
    let mut statefulset = desired.statefulset.clone();
    let hash = spec_hash(&statefulset)?;
    let live = api.get(&key.namespace, &key.name).await?;

    let live_replicas = live
        .as_ref()
        .and_then(|s| s.spec.as_ref())
        .and_then(|s| s.replicas);
    if partition_active && let Some(replicas) = live_replicas {
        debug!(cluster = %key, replicas, "Partition recovery in progress, keeping live replica count");
        if let Some(spec) = statefulset.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
    }
    let desired_replicas = statefulset.spec.as_ref().and_then(|s| s.replicas);

    if !needs_apply(live.as_ref(), &statefulset, &hash)? {
        debug!(cluster = %key, "StatefulSet unchanged");
        return Ok(live);
    }

    statefulset
        .annotations_mut()
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
    api.apply(&key.namespace, &key.name, &statefulset).await?;
    info!(cluster = %key, replicas = ?desired_replicas, "Applied StatefulSet");
    Ok(live)
}

/// Whether the live object was applied from a different desired state.
pub fn hash_changed<K: Resource>(live: Option<&K>, hash: &str) -> bool {
    live.and_then(|l| l.annotations().get(SPEC_HASH_ANNOTATION))
        .map(String::as_str)
        != Some(hash)
}

/// An object is re-applied when its desired state changed or someone edited
/// the live copy away from it.
fn needs_apply<K: Resource + Serialize>(live: Option<&K>, desired: &K, hash: &str) -> Result<bool> {
    match live {
        Some(live) if !hash_changed(Some(live), hash) => Ok(!holds_desired(live, desired)?),
        _ => Ok(true),
    }
}

/// Server-side apply `object` unless the live copy carries the same spec-hash
/// and still holds every desired field. Returns whether a request was sent.
pub async fn apply_hashed<K>(api: &dyn ObjectApi<K>, namespace: &str, mut object: K) -> Result<bool>
where
    K: Resource + Serialize + Clone + Send + Sync + 'static,
{
    let name = object.name_any();
    let hash = spec_hash(&object)?;
    let live = api.get(namespace, &name).await?;
    if !needs_apply(live.as_ref(), &object, &hash)? {
        return Ok(false);
    }
    object
        .annotations_mut()
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
    api.apply(namespace, &name, &object).await?;
    debug!(name = %name, namespace = %namespace, "Applied object");
    Ok(true)
}

/// Give the StatefulSet's PVCs the standard labels and an owner reference to the CR.
async fn converge_pvc_metadata(
    ctx: &Context,
    resource: &RabbitMQCustomResource,
    namespace: &str,
) -> Result<()> {
    let cluster = resource.name_any();
    let labels = standard_labels(&cluster);
    let owner = owner_reference(resource);

    for pvc in ctx
        .apis
        .pvcs
        .list(namespace, Some(&instance_selector(&cluster)))
        .await?
    {
        let owned = pvc.owner_references().iter().any(|o| o.uid == owner.uid);
        let labelled = labels.iter().all(|(k, v)| pvc.labels().get(k) == Some(v));
        if owned && labelled {
            continue;
        }

        let mut owners = pvc.owner_references().to_vec();
        if !owned {
            let mut reference = owner.clone();
            // Only one owner may be the controller
            if owners.iter().any(|o| o.controller == Some(true)) {
                reference.controller = None;
            }
            owners.push(reference);
        }
        let name = pvc.name_any();
        ctx.apis
            .pvcs
            .patch_merge(
                namespace,
                &name,
                json!({ "metadata": { "labels": labels, "ownerReferences": owners } }),
            )
            .await?;
        debug!(pvc = %name, namespace = %namespace, "Updated PVC labels and owner");
    }
    Ok(())
}

/// Run users, policies, operator policies and shovels in that order.
///
/// Each child runs even when an earlier one failed. A failed child keeps its
/// previous ownership record.
async fn reconcile_children(
    ctx: &Context,
    key: &ClusterKey,
    desired: &DesiredCluster,
    previous: &ManagedBrokerObjects,
) -> (ManagedBrokerObjects, Vec<String>) {
    let mut managed = previous.clone();
    let mut failures = Vec::new();

    let api = match desired
        .admin
        .credentials()
        .and_then(|c| ctx.management.cluster_api(key, &c).map_err(Error::from))
    {
        Ok(api) => api,
        Err(e) => {
            warn!(cluster = %key, error = %e, "Cannot reach management API");
            failures.push(format!("management: {}", e));
            return (managed, failures);
        }
    };
    let api = api.as_ref();

    if let Err(e) = reconcile_users(api, &desired.users).await {
        warn!(cluster = %key, error = %e, "User reconciliation failed");
        failures.push(format!("users: {}", e));
    }

    match reconcile_policies(api, PolicyKind::Policy, &desired.policies, &previous.policies).await
    {
        Ok(record) => managed.policies = record,
        Err(e) => {
            warn!(cluster = %key, error = %e, "Policy reconciliation failed");
            failures.push(format!("policies: {}", e));
        }
    }

    match reconcile_policies(
        api,
        PolicyKind::OperatorPolicy,
        &desired.operator_policies,
        &previous.operator_policies,
    )
    .await
    {
        Ok(record) => managed.operator_policies = record,
        Err(e) => {
            warn!(cluster = %key, error = %e, "Operator policy reconciliation failed");
            failures.push(format!("operator policies: {}", e));
        }
    }

    match reconcile_shovels(
        api,
        ctx.apis.secrets.as_ref(),
        &desired.shovels,
        &previous.shovels,
    )
    .await
    {
        Ok(sync) => {
            managed.shovels = sync.record;
            failures.extend(sync.failures.into_iter().map(|f| format!("shovels: {}", f)));
        }
        Err(e) => {
            warn!(cluster = %key, error = %e, "Shovel reconciliation failed");
            failures.push(format!("shovels: {}", e));
        }
    }

    (managed, failures)
}

async fn update_status(
    ctx: &Context,
    resource: &RabbitMQCustomResource,
    ready_replicas: i32,
    partition_active: bool,
    managed: &ManagedBrokerObjects,
    failures: &[String],
) -> Result<()> {
    let generation = resource.metadata.generation;
    let desired_replicas = resource.spec.replicas;
    let existing = resource
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    let mut builder = ConditionBuilder::from_existing(existing);
    builder.validated(true, "SpecValid", "Spec passed validation", generation);
    if ready_replicas < desired_replicas {
        builder.ready(
            false,
            "WaitingForReplicas",
            &format!("{}/{} replicas ready", ready_replicas, desired_replicas),
            generation,
        );
    } else if !failures.is_empty() {
        builder.ready(false, "BrokerSyncFailed", &failures.join("; "), generation);
    } else {
        builder.ready(true, "AllReplicasReady", "All replicas are ready", generation);
    }
    if partition_active {
        builder.partition_healing(
            true,
            "PartitionRecovery",
            "A network partition recovery is in progress",
            generation,
        );
    } else {
        builder.partition_healing(false, "NoPartition", "No partition recovery running", generation);
    }

    let patch = json!({
        "status": {
            "conditions": builder.build(),
            "observedGeneration": generation,
            "readyReplicas": ready_replicas,
            "managedObjects": managed,
        }
    });
    let name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_default();
    ctx.apis.clusters.patch_status(&namespace, &name, patch).await?;
    Ok(())
}

async fn update_invalid_status(
    ctx: &Context,
    resource: &RabbitMQCustomResource,
    messages: &[String],
) -> Result<()> {
    let generation = resource.metadata.generation;
    let existing = resource
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    let mut builder = ConditionBuilder::from_existing(existing);
    builder
        .validated(false, "ValidationFailed", &messages.join("; "), generation)
        .ready(false, "InvalidSpec", "Spec failed validation", generation);

    let patch = json!({
        "status": {
            "conditions": builder.build(),
            "observedGeneration": generation,
        }
    });
    let name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_default();
    ctx.apis.clusters.patch_status(&namespace, &name, patch).await?;
    Ok(())
}
