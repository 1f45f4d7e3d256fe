//! Operator configuration.
//!
//! Only the watched namespace comes from the environment. Pool sizes, sweep
//! timing and partition timeouts are fixed defaults; tests build their own
//! `OperatorConfig` with short durations.

use std::time::Duration;

/// Namespace file mounted into every pod with a service account.
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Environment variable naming the watched namespace.
pub const NAMESPACE_ENV: &str = "NAMESPACE";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace whose custom resources are watched and swept
    pub namespace: String,
    /// Workers of the cluster-aware executor
    pub reconcile_workers: usize,
    /// Sweeps allowed to run at the same time
    pub sweep_workers: usize,
    pub sweep_initial_delay: Duration,
    pub sweep_period: Duration,
    /// Bound on every Kubernetes and management API call
    pub api_timeout: Duration,
    /// Time allowed for partitioned nodes to drain their queues
    pub drain_timeout: Duration,
    /// Time allowed for evicted nodes to rejoin
    pub restart_timeout: Duration,
    pub partition_poll_interval: Duration,
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            reconcile_workers: 4,
            sweep_workers: 4,
            sweep_initial_delay: Duration::from_secs(10),
            sweep_period: Duration::from_secs(60),
            api_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5 * 60),
            restart_timeout: Duration::from_secs(10 * 60),
            partition_poll_interval: Duration::from_secs(5),
            health_port: 8080,
        }
    }
}

impl OperatorConfig {
    /// Defaults plus the namespace from the environment, falling back to the
    /// service account namespace and then to the kube client's default.
    pub fn from_env(client_default_namespace: &str) -> Self {
        let namespace = detect_namespace(
            std::env::var(NAMESPACE_ENV).ok(),
            std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE).ok(),
            client_default_namespace,
        );
        Self {
            namespace,
            ..Self::default()
        }
    }
}

/// Pick the first non-blank candidate.
pub fn detect_namespace(
    explicit: Option<String>,
    service_account: Option<String>,
    client_default: &str,
) -> String {
    [explicit, service_account]
        .into_iter()
        .flatten()
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| client_default.to_string())
}
