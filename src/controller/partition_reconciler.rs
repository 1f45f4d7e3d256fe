//! Reconciliation of network partition recovery requests.
//!
//! Runs under the owning cluster's lock and drives the recovery state machine
//! until it reaches `Done`, fails, or hits an API error. State is written to the
//! partition CR status after every transition so a restarted operator resumes
//! where it stopped; timeouts count from the persisted `stateEnteredAt`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::management::Credentials;
use crate::controller::common::{extract_pod_name, is_pod_ready, pod_ordinal};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::partition_state_machine::{
    PartitionStateMachine, PartitionTransition, PartitionTransitionContext,
    determine_partition_event,
};
use crate::controller::queue_operations::AreQueuesEmptyOperation;
use crate::controller::status::ConditionBuilder;
use crate::crd::{
    ClusterKey, NetworkPartitionStatus, PartitionState, RabbitMQCustomResource,
    RabbitMQNetworkPartitionCustomResource,
};
use crate::resources::common::admin_secret_name;
use crate::resources::secrets::{PASSWORD_KEY, USERNAME_KEY, secret_value};

/// Pod names of the partitioned nodes, sorted and without duplicates.
pub fn partitioned_pods(partition: &RabbitMQNetworkPartitionCustomResource) -> Vec<String> {
    let mut pods: Vec<String> = partition
        .spec
        .partitioned_nodes
        .iter()
        .map(|n| extract_pod_name(n))
        .collect();
    pods.sort();
    pods.dedup();
    pods
}

/// Collect every reason the partition request cannot be acted on.
pub fn validate_partition(
    partition: &RabbitMQNetworkPartitionCustomResource,
    cluster: Option<&RabbitMQCustomResource>,
) -> Vec<String> {
    let mut messages = Vec::new();
    let cluster_name = &partition.spec.cluster_name;
    let pods = partitioned_pods(partition);

    if partition.spec.partitioned_nodes.is_empty() {
        messages.push("partitionedNodes must not be empty".to_string());
    }

    let Some(cluster) = cluster else {
        messages.push(format!("cluster '{}' does not exist", cluster_name));
        return messages;
    };
    let replicas = cluster.spec.replicas;

    for pod in &pods {
        match pod_ordinal(cluster_name, pod) {
            Some(ordinal) if ordinal < replicas => {}
            _ => messages.push(format!(
                "node '{}' is not a pod of cluster '{}'",
                pod, cluster_name
            )),
        }
    }
    if !pods.is_empty() && pods.len() >= usize::try_from(replicas).unwrap_or(0) {
        messages.push(format!(
            "{} partitioned nodes must be fewer than the cluster's {} replicas",
            pods.len(),
            replicas
        ));
    }
    messages
}

/// Recovery of one partition CR, bound to its cluster.
struct Recovery {
    ctx: Arc<Context>,
    key: ClusterKey,
    partition: RabbitMQNetworkPartitionCustomResource,
    cluster: RabbitMQCustomResource,
    pods: Vec<String>,
    machine: PartitionStateMachine,
    state: PartitionState,
    /// When the current state was entered, on the tokio clock
    entered: Instant,
    forced: bool,
}

/// Reconcile the partition CR `name` belonging to cluster `key`.
pub async fn reconcile_partition(key: ClusterKey, name: String, ctx: Arc<Context>) -> Result<()> {
    let Some(partition) = ctx.apis.partitions.get(&key.namespace, &name).await? else {
        debug!(partition = %name, cluster = %key, "Partition no longer exists");
        return Ok(());
    };
    if partition.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }

    let state = partition.state();
    if state.is_terminal() {
        delete_partition(&ctx, &key, &name).await?;
        return Ok(());
    }

    let cluster = ctx.apis.clusters.get(&key.namespace, &key.name).await?;
    let messages = validate_partition(&partition, cluster.as_ref());
    let cluster = match cluster {
        Some(cluster) if messages.is_empty() => cluster,
        _ => {
            error!(partition = %name, cluster = %key, messages = ?messages, "Partition request is invalid");
            ctx.publish_warning_event(
                &partition,
                "ValidationFailed",
                "Validating",
                Some(messages.join("; ")),
            )
            .await;
            update_invalid_status(&ctx, &key, &partition, &messages).await?;
            return Err(Error::validation(messages));
        }
    };

    let status = partition.status.clone().unwrap_or_default();
    let mut recovery = Recovery {
        pods: partitioned_pods(&partition),
        entered: resume_instant(status.state_entered_at.as_deref()),
        forced: status.forced,
        ctx,
        key,
        partition,
        cluster,
        machine: PartitionStateMachine::new(),
        state,
    };
    if status.state_entered_at.is_none() {
        // First pass: record Observed with a timestamp before acting
        recovery.persist(None).await?;
    }
    recovery.run().await
}

/// Map a persisted RFC 3339 timestamp onto the tokio clock.
fn resume_instant(entered_at: Option<&str>) -> Instant {
    let now = Instant::now();
    let Some(entered) = entered_at.and_then(|s| s.parse::<jiff::Timestamp>().ok()) else {
        return now;
    };
    let elapsed = jiff::Timestamp::now().duration_since(entered);
    let elapsed = Duration::try_from(elapsed).unwrap_or(Duration::ZERO);
    now.checked_sub(elapsed).unwrap_or(now)
}

impl Recovery {
    fn name(&self) -> String {
        kube::ResourceExt::name_any(&self.partition)
    }

    async fn run(&mut self) -> Result<()> {
        info!(partition = %self.name(), cluster = %self.key, state = %self.state, pods = ?self.pods, "Reconciling network partition");
        let credentials = self.admin_credentials().await?;

        loop {
            let mut observed = PartitionTransitionContext::default();
            match self.state {
                PartitionState::Observed | PartitionState::Failed => {}
                PartitionState::Drain => {
                    observed.queues_drained = self.queues_drained(&credentials).await;
                    observed.drain_timed_out =
                        self.entered.elapsed() >= self.ctx.config.drain_timeout;
                }
                PartitionState::Evict | PartitionState::Forced => {
                    self.evict().await?;
                    observed.nodes_evicted = true;
                }
                PartitionState::Restart => {
                    self.restore_replicas().await?;
                    observed.nodes_rejoined = self.nodes_rejoined().await?;
                    observed.restart_timed_out =
                        self.entered.elapsed() >= self.ctx.config.restart_timeout;
                }
                PartitionState::Done => {
                    return delete_partition(&self.ctx, &self.key, &self.name()).await;
                }
            }

            let Some(event) = determine_partition_event(self.state, &observed) else {
                debug!(partition = %self.name(), state = %self.state, "Waiting");
                tokio::time::sleep(self.ctx.config.partition_poll_interval).await;
                continue;
            };
            let Some(transition) = self.machine.transition(self.state, event, &observed) else {
                return Err(Error::Transient(format!(
                    "no transition from {} on {}",
                    self.state, event
                )));
            };
            self.apply(transition).await?;

            if transition.to == PartitionState::Failed {
                return Err(Error::PartitionTimeout {
                    name: self.name(),
                    state: PartitionState::Restart,
                });
            }
        }
    }

    async fn apply(&mut self, transition: PartitionTransition) -> Result<()> {
        let name = self.name();
        let from = transition.from;
        self.state = transition.to;
        self.entered = Instant::now();

        match transition.to {
            PartitionState::Forced => {
                self.forced = true;
                warn!(partition = %name, cluster = %self.key, pods = ?self.pods, "Drain timed out, evicting nodes with messages still queued");
                self.ctx
                    .publish_warning_event(
                        &self.partition,
                        "ForcedEviction",
                        "Evicting",
                        Some(format!(
                            "Queues on {} did not drain; messages may be lost",
                            self.pods.join(", ")
                        )),
                    )
                    .await;
            }
            PartitionState::Failed => {
                error!(partition = %name, cluster = %self.key, "Partitioned nodes did not rejoin in time");
                self.ctx
                    .publish_warning_event(
                        &self.partition,
                        "RecoveryFailed",
                        "Restarting",
                        Some(transition.description.to_string()),
                    )
                    .await;
            }
            _ => {
                info!(partition = %name, cluster = %self.key, from = %from, to = %transition.to, event = %transition.event, "Partition state transition");
                self.ctx
                    .publish_normal_event(
                        &self.partition,
                        "StateChanged",
                        "Reconciling",
                        Some(format!("{} -> {}: {}", from, transition.to, transition.description)),
                    )
                    .await;
            }
        }

        if let Some(health) = &self.ctx.health_state {
            health
                .metrics
                .record_partition_transition(&transition.to.to_string());
        }
        self.persist(Some(transition.description)).await
    }

    /// Write the current state to the partition status.
    async fn persist(&mut self, message: Option<&str>) -> Result<()> {
        let generation = self.partition.metadata.generation;
        let existing = self
            .partition
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();

        let mut builder = ConditionBuilder::from_existing(existing);
        builder.validated(true, "RequestValid", "Partition request is valid", generation);
        match self.state {
            PartitionState::Done => builder.partition_healing(
                false,
                "Recovered",
                "All nodes rejoined",
                generation,
            ),
            PartitionState::Failed => builder.partition_healing(
                false,
                "RejoinTimedOut",
                "Nodes did not rejoin in time",
                generation,
            ),
            _ if self.forced => builder.partition_healing(
                true,
                "ForcedEviction",
                "Nodes evicted before their queues drained",
                generation,
            ),
            state => builder.partition_healing(
                true,
                "Recovering",
                &format!("Recovery in state {}", state),
                generation,
            ),
        };

        let status = NetworkPartitionStatus {
            state: self.state,
            state_entered_at: Some(jiff::Timestamp::now().to_string()),
            forced: self.forced,
            message: message.map(str::to_string),
            conditions: builder.build(),
            observed_generation: generation,
        };
        let updated = self
            .ctx
            .apis
            .partitions
            .patch_status(&self.key.namespace, &self.name(), json!({ "status": status }))
            .await?;
        self.partition.status = updated.status.or(Some(status));
        Ok(())
    }

    async fn admin_credentials(&self) -> Result<Credentials> {
        let name = admin_secret_name(&self.key.name);
        let secret = self
            .ctx
            .apis
            .secrets
            .get(&self.key.namespace, &name)
            .await?
            .ok_or_else(|| Error::MissingField(format!("secret {}", name)))?;
        let field = |k: &str| {
            secret_value(&secret, k)
                .ok_or_else(|| Error::MissingField(format!("{}.data.{}", name, k)))
        };
        Ok(Credentials::new(field(USERNAME_KEY)?, field(PASSWORD_KEY)?))
    }

    async fn queues_drained(&self, credentials: &Credentials) -> bool {
        let operation = AreQueuesEmptyOperation::new(self.ctx.management.as_ref(), credentials);
        for pod in &self.pods {
            if !operation.execute(&self.key, pod).await {
                return false;
            }
        }
        true
    }

    fn desired_replicas(&self) -> i32 {
        self.cluster.spec.replicas
    }

    /// Scale down by the number of partitioned nodes and delete their pods.
    async fn evict(&self) -> Result<()> {
        let reduced = self.desired_replicas() - i32::try_from(self.pods.len()).unwrap_or(0);
        info!(cluster = %self.key, replicas = reduced, pods = ?self.pods, "Evicting partitioned nodes");
        self.ctx
            .apis
            .statefulsets
            .patch_merge(
                &self.key.namespace,
                &self.key.name,
                json!({ "spec": { "replicas": reduced } }),
            )
            .await?;
        for pod in &self.pods {
            if self.ctx.apis.pods.delete(&self.key.namespace, pod).await? {
                debug!(cluster = %self.key, pod = %pod, "Deleted partitioned pod");
            }
        }
        Ok(())
    }

    /// Put the StatefulSet back to the cluster's replica count.
    async fn restore_replicas(&self) -> Result<()> {
        let desired = self.desired_replicas();
        let current = self
            .ctx
            .apis
            .statefulsets
            .get(&self.key.namespace, &self.key.name)
            .await?
            .and_then(|s| s.spec)
            .and_then(|s| s.replicas);
        if current != Some(desired) {
            info!(cluster = %self.key, replicas = desired, "Restoring replicas");
            self.ctx
                .apis
                .statefulsets
                .patch_merge(
                    &self.key.namespace,
                    &self.key.name,
                    json!({ "spec": { "replicas": desired } }),
                )
                .await?;
        }
        Ok(())
    }

    /// All replicas Ready and every partitioned pod back and Ready.
    async fn nodes_rejoined(&self) -> Result<bool> {
        let Some(statefulset) = self
            .ctx
            .apis
            .statefulsets
            .get(&self.key.namespace, &self.key.name)
            .await?
        else {
            return Ok(false);
        };
        let generation = statefulset.metadata.generation;
        let Some(status) = statefulset.status else {
            return Ok(false);
        };
        // Status written before the restore does not count
        if generation.is_some() && status.observed_generation < generation {
            return Ok(false);
        }
        if status.ready_replicas.unwrap_or(0) < self.desired_replicas() {
            return Ok(false);
        }
        for pod in &self.pods {
            match self.ctx.apis.pods.get(&self.key.namespace, pod).await? {
                Some(p) if p.metadata.deletion_timestamp.is_none() && is_pod_ready(&p) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

async fn delete_partition(ctx: &Context, key: &ClusterKey, name: &str) -> Result<()> {
    if ctx.apis.partitions.delete(&key.namespace, name).await? {
        info!(partition = %name, cluster = %key, "Partition recovered, deleted request");
    }
    Ok(())
}

async fn update_invalid_status(
    ctx: &Context,
    key: &ClusterKey,
    partition: &RabbitMQNetworkPartitionCustomResource,
    messages: &[String],
) -> Result<()> {
    let generation = partition.metadata.generation;
    let mut status = partition.status.clone().unwrap_or_default();
    let mut builder = ConditionBuilder::from_existing(&status.conditions);
    builder.validated(false, "ValidationFailed", &messages.join("; "), generation);
    status.conditions = builder.build();
    status.message = Some(messages.join("; "));
    status.observed_generation = generation;

    ctx.apis
        .partitions
        .patch_status(
            &key.namespace,
            &kube::ResourceExt::name_any(partition),
            json!({ "status": status }),
        )
        .await?;
    Ok(())
}
