//! Composition root.
//!
//! Builds every collaborator once at startup and wires the watches, the
//! sweeps and the health server to a single orchestrator.

use std::sync::Arc;
use std::time::Duration;

use kube::api::ListParams;
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::{ClusterApis, HttpManagementApiProvider};
use crate::config::OperatorConfig;
use crate::controller::context::{Context, KubeEventPublisher};
use crate::controller::error::{Error, Result};
use crate::controller::executor::ClusterAwareExecutor;
use crate::controller::factory::AlphanumericGenerator;
use crate::controller::named_locks::NamedLocks;
use crate::controller::orchestrator::ReconciliationOrchestrator;
use crate::controller::watch::{Dispatcher, run_cluster_watch, run_partition_watch, run_sweeps};
use crate::crd::{RabbitMQCustomResource, RabbitMQNetworkPartitionCustomResource};
use crate::health::{HealthState, run_health_server};

/// The running operator.
pub struct App {
    client: Client,
    dispatcher: Dispatcher,
    health_state: Arc<HealthState>,
}

impl App {
    /// Wire the operator against `client`.
    ///
    /// Fails with [`Error::Fatal`] when the management HTTP client cannot be built.
    pub fn new(client: Client, config: OperatorConfig) -> Result<Self> {
        let health_state = Arc::new(HealthState::new());
        let management = HttpManagementApiProvider::new(config.api_timeout)
            .map_err(|e| Error::Fatal(format!("cannot build management client: {e}")))?;

        let ctx = Arc::new(Context {
            apis: ClusterApis::from_client(client.clone(), config.api_timeout),
            management: Arc::new(management),
            random: Arc::new(AlphanumericGenerator),
            events: Arc::new(KubeEventPublisher::new(client.clone())),
            config: config.clone(),
            health_state: Some(health_state.clone()),
        });

        let executor = ClusterAwareExecutor::new(config.reconcile_workers, NamedLocks::new());
        let orchestrator = ReconciliationOrchestrator::new(executor, Some(health_state.clone()));

        Ok(Self {
            client,
            dispatcher: Dispatcher::new(orchestrator, ctx),
            health_state,
        })
    }

    /// Build from the default kube client and the environment.
    pub async fn from_env() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Fatal(format!("cannot create Kubernetes client: {e}")))?;
        let config = OperatorConfig::from_env(client.default_namespace());
        Self::new(client, config)
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.dispatcher.context().config
    }

    pub fn health_state(&self) -> &Arc<HealthState> {
        &self.health_state
    }

    /// Confirm both CRDs are installed before anything is started.
    pub async fn preflight(&self) -> Result<()> {
        let namespace = &self.config().namespace;
        let params = ListParams::default().limit(1);

        let clusters: Api<RabbitMQCustomResource> =
            Api::namespaced(self.client.clone(), namespace);
        clusters.list(&params).await.map_err(|e| crd_error("RabbitMQCustomResource", e))?;

        let partitions: Api<RabbitMQNetworkPartitionCustomResource> =
            Api::namespaced(self.client.clone(), namespace);
        partitions
            .list(&params)
            .await
            .map_err(|e| crd_error("RabbitMQNetworkPartitionCustomResource", e))?;

        info!(namespace = %namespace, "Custom resource definitions found");
        Ok(())
    }

    /// Start the health server, both watches and the periodic sweeps.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        let namespace = self.config().namespace.clone();
        let port = self.config().health_port;
        info!(namespace = %namespace, "Starting rabbitmq-operator controllers");

        let health = {
            let state = self.health_state.clone();
            tokio::spawn(async move {
                if let Err(e) = run_health_server(state, port).await {
                    error!("Health server error: {}", e);
                }
            })
        };
        let cluster_watch = tokio::spawn(run_cluster_watch(
            Api::namespaced(self.client.clone(), &namespace),
            self.dispatcher.clone(),
        ));
        let partition_watch = tokio::spawn(run_partition_watch(
            Api::namespaced(self.client.clone(), &namespace),
            self.dispatcher.clone(),
        ));
        let sweeps = tokio::spawn(run_sweeps(self.dispatcher.clone()));

        self.health_state.set_ready(true).await;
        vec![health, cluster_watch, partition_watch, sweeps]
    }

    /// Stop accepting work and wait up to `grace` for in-flight reconciles.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>, grace: Duration) {
        self.health_state.set_ready(false).await;
        info!("Marked operator as not ready");

        // Watches and sweeps stop feeding the orchestrator first.
        for handle in handles {
            handle.abort();
        }

        let inflight = self.dispatcher.orchestrator().inflight();
        info!(inflight, grace_secs = grace.as_secs(), "Waiting for in-flight reconciliations");
        if !self.dispatcher.orchestrator().wait_idle(grace).await {
            warn!(
                inflight = self.dispatcher.orchestrator().inflight(),
                "Grace period elapsed with reconciliations still running"
            );
        }
    }
}

fn crd_error(kind: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ref response) if response.code == 404 => {
            Error::Fatal(format!("{kind} CRD is not installed"))
        }
        other => Error::Fatal(format!("cannot list {kind}: {other}")),
    }
}
