//! Secret generation for RabbitMQ clusters.
//!
//! Builds the admin credentials, the erlang cookie shared by all nodes and
//! one credentials secret per declared user. The random values are supplied
//! by the caller so these builders stay deterministic.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use crate::crd::RabbitMQCustomResource;
use crate::resources::common::{
    admin_secret_name, erlang_cookie_secret_name, owned_metadata, user_secret_name,
};

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const ERLANG_COOKIE_KEY: &str = "cookie";

/// Default user created by the broker image from the admin secret.
pub const ADMIN_USERNAME: &str = "rabbit";

pub const PASSWORD_LENGTH: usize = 30;
pub const ERLANG_COOKIE_LENGTH: usize = 50;

/// Generate the admin credentials secret (`<cluster>-admin`).
pub fn generate_admin_secret(resource: &RabbitMQCustomResource, password: &str) -> Secret {
    credentials_secret(
        resource,
        admin_secret_name(&resource.name_any()),
        ADMIN_USERNAME,
        password,
    )
}

/// Generate the erlang cookie secret (`<cluster>-erlang-cookie`).
pub fn generate_erlang_cookie_secret(resource: &RabbitMQCustomResource, cookie: &str) -> Secret {
    Secret {
        metadata: owned_metadata(resource, erlang_cookie_secret_name(&resource.name_any())),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            ERLANG_COOKIE_KEY.to_string(),
            ByteString(cookie.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Generate the credentials secret of one broker user (`<cluster>-<user>-user`).
pub fn generate_user_secret(
    resource: &RabbitMQCustomResource,
    username: &str,
    password: &str,
) -> Secret {
    credentials_secret(
        resource,
        user_secret_name(&resource.name_any(), username),
        username,
        password,
    )
}

fn credentials_secret(
    resource: &RabbitMQCustomResource,
    name: String,
    username: &str,
    password: &str,
) -> Secret {
    Secret {
        metadata: owned_metadata(resource, name),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            (
                USERNAME_KEY.to_string(),
                ByteString(username.as_bytes().to_vec()),
            ),
            (
                PASSWORD_KEY.to_string(),
                ByteString(password.as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    }
}

/// Read a UTF-8 value from a secret, looking at `data` then `stringData`.
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
}
