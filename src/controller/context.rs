//! Shared context for the reconcilers.
//!
//! The Context struct holds the shared collaborators passed to every
//! reconcile: Kubernetes object access, the management API provider, the
//! random-string source, timing configuration and the event publisher.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::client::{ClusterApis, RabbitManagementApiProvider};
use crate::config::OperatorConfig;
use crate::controller::factory::RandomStringGenerator;
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "rabbitmq-operator";

/// Publishes Kubernetes events about custom resources.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        object: ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Events recorded through the API server.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        object: ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        if let Err(e) = self
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}

/// Shared context for the reconcilers
#[derive(Clone)]
pub struct Context {
    pub apis: ClusterApis,
    pub management: Arc<dyn RabbitManagementApiProvider>,
    pub random: Arc<dyn RandomStringGenerator>,
    pub events: Arc<dyn EventPublisher>,
    pub config: OperatorConfig,
    /// Optional health state for metrics
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Publish a normal event for a resource
    pub async fn publish_normal_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(
                resource.object_ref(&()),
                EventType::Normal,
                reason,
                action,
                note,
            )
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(
                resource.object_ref(&()),
                EventType::Warning,
                reason,
                action,
                note,
            )
            .await;
    }
}
