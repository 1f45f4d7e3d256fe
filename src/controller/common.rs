//! Shared controller helpers.
//!
//! Utilities used by both the cluster and the partition reconcilers.

use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::controller::error::Result;

/// Annotation carrying the hash of the last applied object.
pub const SPEC_HASH_ANNOTATION: &str = "rabbitmq.indeed.com/spec-hash";

/// Extract the pod name from an erlang node name or host name
/// (e.g., "rabbit@mq-1.mq-discovery.ns.svc.cluster.local" -> "mq-1").
pub fn extract_pod_name(node: &str) -> String {
    let host = node.rsplit_once('@').map_or(node, |(_, host)| host);
    host.split(':')
        .next()
        .and_then(|h| h.split('.').next())
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// StatefulSet ordinal of a pod belonging to `cluster_name` ("mq-2" -> 2).
pub fn pod_ordinal(cluster_name: &str, pod_name: &str) -> Option<i32> {
    pod_name
        .strip_prefix(cluster_name)?
        .strip_prefix('-')?
        .parse()
        .ok()
        .filter(|ordinal: &i32| *ordinal >= 0)
}

/// Whether a pod reports the `Ready` condition as true.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Sha256 of an object's JSON form, hex encoded.
pub fn spec_hash<T: Serialize>(object: &T) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(object)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether `live` still holds every field set in `desired`.
///
/// Fields only the live object has (server defaults, status, annotations
/// written by others) are ignored. Lists must match element for element.
pub fn holds_desired<T: Serialize>(live: &T, desired: &T) -> Result<bool> {
    Ok(contains(
        &serde_json::to_value(live)?,
        &serde_json::to_value(desired)?,
    ))
}

fn contains(live: &Value, desired: &Value) -> bool {
    match (live, desired) {
        (_, Value::Null) => true,
        (Value::Object(live), Value::Object(desired)) => desired
            .iter()
            .all(|(key, value)| value.is_null() || live.get(key).is_some_and(|l| contains(l, value))),
        (Value::Array(live), Value::Array(desired)) => {
            live.len() == desired.len() && live.iter().zip(desired).all(|(l, d)| contains(l, d))
        }
        _ => live == desired,
    }
}
