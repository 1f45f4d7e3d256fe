//! Clients for the two external systems the operator talks to.
//!
//! ## Architecture
//!
//! - `kube_api`: per-kind Kubernetes object access behind the [`ObjectApi`] trait
//! - `management`: the RabbitMQ management HTTP API behind [`RabbitManagementApi`]
//!
//! Both are traits so reconcilers can be exercised against in-memory fakes.

pub mod kube_api;
pub mod management;

pub use kube_api::{ClusterApis, KubeObjectApi, ObjectApi};
pub use management::{
    Credentials, HttpManagementApiProvider, HttpManagementClient, ManagementError, PolicyKind,
    RabbitManagementApi, RabbitManagementApiProvider,
};
