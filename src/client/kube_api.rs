//! Kubernetes object access used by the reconcilers.
//!
//! The reconcilers never hold a `kube::Client` directly. They go through
//! [`ObjectApi`], one instance per object kind, so the whole reconcile path
//! can run against in-memory fakes. [`KubeObjectApi`] is the production
//! implementation; every call is bounded by the configured API timeout.

use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::crd::{RabbitMQCustomResource, RabbitMQNetworkPartitionCustomResource};

/// Namespaced CRUD on one object kind.
#[async_trait]
pub trait ObjectApi<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Fetch an object; `None` when it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects, optionally filtered by a label selector.
    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>>;

    /// Create an object. Fails with [`Error::AlreadyExists`] on a name conflict.
    async fn create(&self, namespace: &str, object: &K) -> Result<K>;

    /// Server-side apply with the operator's field manager, forcing ownership.
    async fn apply(&self, namespace: &str, name: &str, object: &K) -> Result<K>;

    /// JSON merge patch of the main resource.
    async fn patch_merge(&self, namespace: &str, name: &str, patch: serde_json::Value)
    -> Result<K>;

    /// JSON merge patch of the status subresource.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<K>;

    /// Delete an object. Returns `false` when it was already gone.
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// [`ObjectApi`] backed by the Kubernetes API server.
pub struct KubeObjectApi<K> {
    client: Client,
    timeout: Duration,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeObjectApi<K> {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeObjectApi<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = std::result::Result<T, kube::Error>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Transient(format!(
                "{} {} timed out after {:?}",
                operation,
                K::kind(&K::DynamicType::default()),
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl<K> ObjectApi<K> for KubeObjectApi<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api = self.api(namespace);
        self.bounded("get", api.get_opt(name)).await
    }

    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>> {
        let api = self.api(namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self.bounded("list", api.list(&params)).await?;
        Ok(list.items)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K> {
        let api = self.api(namespace);
        match self
            .bounded("create", api.create(&PostParams::default(), object))
            .await
        {
            Err(Error::Kube(kube::Error::Api(e))) if e.code == 409 => Err(Error::AlreadyExists(
                object.meta().name.clone().unwrap_or_default(),
            )),
            other => other,
        }
    }

    async fn apply(&self, namespace: &str, name: &str, object: &K) -> Result<K> {
        let api = self.api(namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.bounded("apply", api.patch(name, &params, &Patch::Apply(object)))
            .await
    }

    async fn patch_merge(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<K> {
        let api = self.api(namespace);
        let params = PatchParams::default();
        self.bounded("patch", api.patch(name, &params, &Patch::Merge(&patch)))
            .await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<K> {
        let api = self.api(namespace);
        let params = PatchParams::default();
        self.bounded(
            "patch status",
            api.patch_status(name, &params, &Patch::Merge(&patch)),
        )
        .await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let api = self.api(namespace);
        match self
            .bounded("delete", api.delete(name, &DeleteParams::default()))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// One [`ObjectApi`] per kind the operator touches.
#[derive(Clone)]
pub struct ClusterApis {
    pub clusters: Arc<dyn ObjectApi<RabbitMQCustomResource>>,
    pub partitions: Arc<dyn ObjectApi<RabbitMQNetworkPartitionCustomResource>>,
    pub secrets: Arc<dyn ObjectApi<Secret>>,
    pub services: Arc<dyn ObjectApi<Service>>,
    pub statefulsets: Arc<dyn ObjectApi<StatefulSet>>,
    pub pods: Arc<dyn ObjectApi<Pod>>,
    pub pvcs: Arc<dyn ObjectApi<PersistentVolumeClaim>>,
    pub pdbs: Arc<dyn ObjectApi<PodDisruptionBudget>>,
}

impl ClusterApis {
    /// Build the production bundle sharing one client.
    pub fn from_client(client: Client, timeout: Duration) -> Self {
        Self {
            clusters: Arc::new(KubeObjectApi::new(client.clone(), timeout)),
            partitions: Arc::new(KubeObjectApi::new(client.clone(), timeout)),
            secrets: Arc::new(KubeObjectApi::new(client.clone(), timeout)),
            services: Arc::new(KubeObjectApi::new(client.clone(), timeout)),
            statefulsets: Arc::new(KubeObjectApi::new(client.clone(), timeout)),
            pods: Arc::new(KubeObjectApi::new(client.clone(), timeout)),
            pvcs: Arc::new(KubeObjectApi::new(client.clone(), timeout)),
            pdbs: Arc::new(KubeObjectApi::new(client, timeout)),
        }
    }
}
