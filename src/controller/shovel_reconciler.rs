//! Dynamic shovel convergence.
//!
//! Shovels are identified by their `uuid`; the broker addresses them by
//! `(vhost, name)`, so a renamed shovel is created under its new name and the
//! old parameter removed. Destination credentials are read from the secret the
//! shovel spec references. A shovel that cannot be applied is reported and
//! skipped; the rest of the pass goes on.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use serde_json::Value;
use tracing::{info, warn};

use crate::client::kube_api::ObjectApi;
use crate::client::management::{
    Credentials, RabbitManagementApi, ShovelDefinition, amqp_uri, local_amqp_uri,
};
use crate::controller::error::{Error, Result};
use crate::crd::{ManagedShovel, ShovelSpec};
use crate::resources::secrets::{PASSWORD_KEY, USERNAME_KEY, secret_value};

/// Protocol of both ends of every shovel
pub const SHOVEL_PROTOCOL: &str = "amqp091";

/// Outcome of one shovel pass.
#[derive(Debug, Default, PartialEq)]
pub struct ShovelSync {
    /// Shovels owned by the operator after the pass
    pub record: Vec<ManagedShovel>,
    /// One message per shovel that could not be converged
    pub failures: Vec<String>,
}

/// Shovel parameter value for a spec and its destination credentials.
pub fn shovel_definition(shovel: &ShovelSpec, credentials: &Credentials) -> Result<ShovelDefinition> {
    let dest_uri = shovel
        .destination
        .addresses
        .iter()
        .map(|a| amqp_uri(&a.address, &a.vhost, credentials))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ShovelDefinition {
        src_protocol: SHOVEL_PROTOCOL.to_string(),
        src_uri: local_amqp_uri(&shovel.source.vhost)?,
        src_queue: shovel.source.queue.clone(),
        dest_protocol: SHOVEL_PROTOCOL.to_string(),
        dest_uri,
        dest_queue: shovel
            .destination
            .queue
            .clone()
            .unwrap_or_else(|| shovel.source.queue.clone()),
        ack_mode: shovel.ack_mode.clone(),
        src_prefetch_count: shovel.prefetch_count,
        reconnect_delay: shovel.reconnect_delay,
        src_delete_after: shovel.delete_after.clone(),
    })
}

async fn destination_credentials(
    secrets: &dyn ObjectApi<Secret>,
    shovel: &ShovelSpec,
) -> Result<Credentials> {
    let destination = &shovel.destination;
    let secret = secrets
        .get(&destination.secret_namespace, &destination.secret_name)
        .await?
        .ok_or_else(|| {
            Error::MissingField(format!(
                "secret {}/{} for shovel {}",
                destination.secret_namespace, destination.secret_name, shovel.name
            ))
        })?;
    let field = |key: &str| {
        secret_value(&secret, key).ok_or_else(|| {
            Error::MissingField(format!(
                "{}/{}.data.{}",
                destination.secret_namespace, destination.secret_name, key
            ))
        })
    };
    Ok(Credentials::new(field(USERNAME_KEY)?, field(PASSWORD_KEY)?))
}

/// Converge shovels and return the new ownership record.
///
/// Only a failure to list the live shovels fails the whole pass. A shovel
/// that fails keeps whatever the operator owned for its uuid, so it is never
/// deleted as stale because of a transient error.
pub async fn reconcile_shovels(
    api: &dyn RabbitManagementApi,
    secrets: &dyn ObjectApi<Secret>,
    desired: &[ShovelSpec],
    managed: &[ManagedShovel],
) -> Result<ShovelSync> {
    let live: BTreeMap<(String, String), Value> = api
        .list_shovels()
        .await?
        .into_iter()
        .map(|p| ((p.vhost, p.name), p.value))
        .collect();

    let mut record = BTreeSet::new();
    let mut failures = Vec::new();
    for shovel in desired {
        let key = (shovel.source.vhost.clone(), shovel.name.clone());
        match apply_shovel(api, secrets, shovel, live.get(&key)).await {
            Ok(()) => {
                record.insert(ManagedShovel {
                    uuid: shovel.uuid.clone(),
                    vhost: key.0,
                    name: key.1,
                });
            }
            Err(e) => {
                warn!(shovel = %shovel.name, uuid = %shovel.uuid, error = %e, "Shovel not applied");
                failures.push(format!("{}: {}", shovel.name, e));
                record.extend(managed.iter().filter(|m| m.uuid == shovel.uuid).cloned());
            }
        }
    }

    let wanted: BTreeSet<(String, String)> = record
        .iter()
        .map(|s| (s.vhost.clone(), s.name.clone()))
        .collect();
    for stale in managed
        .iter()
        .filter(|s| !wanted.contains(&(s.vhost.clone(), s.name.clone())))
    {
        if !live.contains_key(&(stale.vhost.clone(), stale.name.clone())) {
            continue;
        }
        info!(shovel = %stale.name, uuid = %stale.uuid, vhost = %stale.vhost, "Deleting shovel");
        if let Err(e) = api.delete_shovel(&stale.vhost, &stale.name).await {
            warn!(shovel = %stale.name, error = %e, "Stale shovel not deleted");
            failures.push(format!("{}: {}", stale.name, e));
            record.insert(stale.clone());
        }
    }

    Ok(ShovelSync {
        record: record.into_iter().collect(),
        failures,
    })
}

async fn apply_shovel(
    api: &dyn RabbitManagementApi,
    secrets: &dyn ObjectApi<Secret>,
    shovel: &ShovelSpec,
    live: Option<&Value>,
) -> Result<()> {
    let credentials = destination_credentials(secrets, shovel).await?;
    let definition = shovel_definition(shovel, &credentials)?;
    if live != Some(&serde_json::to_value(&definition)?) {
        info!(shovel = %shovel.name, uuid = %shovel.uuid, vhost = %shovel.source.vhost, "Applying shovel");
        api.put_shovel(&shovel.source.vhost, &shovel.name, &definition)
            .await?;
    }
    Ok(())
}
