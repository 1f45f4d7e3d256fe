//! Policy and operator policy convergence.
//!
//! Both kinds are keyed by `(vhost, name)`. Deletions are limited to keys the
//! operator recorded as its own in the cluster status, so policies created by
//! hand on the broker survive.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::client::management::{PolicyBody, PolicyKind, RabbitManagementApi};
use crate::controller::error::Result;
use crate::crd::{BrokerObjectRef, PolicySpec};

/// Request body for one declared policy.
pub fn policy_body(policy: &PolicySpec) -> PolicyBody {
    PolicyBody {
        pattern: policy.pattern.clone(),
        definition: policy.definition.clone(),
        priority: policy.priority,
        apply_to: policy.apply_to.clone(),
    }
}

/// Converge policies of `kind` and return the new ownership record.
///
/// `managed` is the record from the previous successful run.
pub async fn reconcile_policies(
    api: &dyn RabbitManagementApi,
    kind: PolicyKind,
    desired: &[PolicySpec],
    managed: &[BrokerObjectRef],
) -> Result<Vec<BrokerObjectRef>> {
    let live: BTreeMap<BrokerObjectRef, PolicyBody> = api
        .list_policies(kind)
        .await?
        .into_iter()
        .map(|p| {
            (
                BrokerObjectRef {
                    vhost: p.vhost,
                    name: p.name,
                },
                p.body,
            )
        })
        .collect();

    let mut wanted = BTreeSet::new();
    for policy in desired {
        let key = BrokerObjectRef {
            vhost: policy.vhost.clone(),
            name: policy.name.clone(),
        };
        let body = policy_body(policy);
        if live.get(&key) != Some(&body) {
            info!(kind = %kind, vhost = %key.vhost, name = %key.name, "Applying policy");
            api.put_policy(kind, &key.vhost, &key.name, &body).await?;
        }
        wanted.insert(key);
    }

    for stale in managed.iter().filter(|r| !wanted.contains(*r)) {
        if live.contains_key(stale) {
            info!(kind = %kind, vhost = %stale.vhost, name = %stale.name, "Deleting policy");
            api.delete_policy(kind, &stale.vhost, &stale.name).await?;
        }
    }

    Ok(wanted.into_iter().collect())
}
