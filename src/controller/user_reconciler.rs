//! Broker user convergence.
//!
//! Users listed in the cluster spec are created or updated, and granted full
//! permissions on their vhosts. Users the spec does not mention are left
//! alone since they may have been created outside the operator.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::client::management::{PermissionBody, RabbitManagementApi, UserUpdate};
use crate::controller::error::Result;
use crate::controller::factory::DesiredUser;

/// Converge every desired user, stopping at the first broker error.
pub async fn reconcile_users(api: &dyn RabbitManagementApi, users: &[DesiredUser]) -> Result<()> {
    for user in users {
        reconcile_user(api, user).await?;
    }
    Ok(())
}

async fn reconcile_user(api: &dyn RabbitManagementApi, user: &DesiredUser) -> Result<()> {
    let credentials = user.secret.credentials()?;

    match api.get_user(&user.username).await? {
        None => {
            info!(user = %user.username, "Creating broker user");
            api.put_user(
                &user.username,
                &UserUpdate::with_password(&credentials.password, &user.tags),
            )
            .await?;
        }
        Some(_) if user.secret.generated => {
            info!(user = %user.username, "Resetting broker user password from new secret");
            api.put_user(
                &user.username,
                &UserUpdate::with_password(&credentials.password, &user.tags),
            )
            .await?;
        }
        Some(existing) => {
            if !same_tags(&existing.tags, &user.tags) {
                info!(user = %user.username, tags = ?user.tags, "Updating broker user tags");
                api.put_user(&user.username, &UserUpdate::keeping_hash(&existing, &user.tags))
                    .await?;
            }
        }
    }

    reconcile_permissions(api, user).await
}

async fn reconcile_permissions(api: &dyn RabbitManagementApi, user: &DesiredUser) -> Result<()> {
    let full = PermissionBody::full();
    let current = api.list_user_permissions(&user.username).await?;

    for vhost in &user.vhosts {
        let granted = current.iter().any(|p| {
            &p.vhost == vhost
                && p.configure == full.configure
                && p.write == full.write
                && p.read == full.read
        });
        if granted {
            continue;
        }
        debug!(user = %user.username, vhost = %vhost, "Granting vhost permissions");
        api.put_vhost(vhost).await?;
        api.put_permission(vhost, &user.username, &full).await?;
    }

    let wanted: HashSet<&str> = user.vhosts.iter().map(String::as_str).collect();
    for permission in current.iter().filter(|p| !wanted.contains(p.vhost.as_str())) {
        info!(user = %user.username, vhost = %permission.vhost, "Revoking vhost permissions");
        api.delete_permission(&permission.vhost, &user.username).await?;
    }
    Ok(())
}

fn same_tags(current: &[String], desired: &[String]) -> bool {
    let current: HashSet<&str> = current.iter().map(String::as_str).collect();
    let desired: HashSet<&str> = desired.iter().map(String::as_str).collect();
    current == desired
}
