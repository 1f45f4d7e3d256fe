//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::client::management::ManagementError;
use crate::crd::PartitionState;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Spec rejected; not retried until the spec changes
    #[error("Validation failed: {}", messages.join("; "))]
    Validation { messages: Vec<String> },

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Management API failure
    #[error("Broker management API error: {0}")]
    Broker(#[from] ManagementError),

    /// The partition state machine ran out of time in a waiting state
    #[error("Partition {name} timed out in state {state}")]
    PartitionTimeout { name: String, state: PartitionState },

    /// Create of an object that already exists
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// One or more child reconcilers failed; the others still ran
    #[error("Child reconcilers failed: {}", failures.join("; "))]
    ChildrenFailed { failures: Vec<String> },

    /// Startup misconfiguration; the process exits non-zero
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build a validation error from accumulated messages
    pub fn validation(messages: Vec<String>) -> Self {
        Error::Validation { messages }
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error indicates a write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error should be retried by the next event or sweep
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, conflicts, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Transient(_)
            | Error::Broker(_)
            | Error::PartitionTimeout { .. }
            | Error::ChildrenFailed { .. }
            | Error::AlreadyExists(_) => true,
            Error::Validation { .. } | Error::MissingField(_) | Error::Fatal(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Short label used for the error metric
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::MissingField(_) => "missing_field",
            Error::Validation { .. } => "validation",
            Error::Transient(_) => "transient",
            Error::Broker(_) => "broker",
            Error::PartitionTimeout { .. } => "partition_timeout",
            Error::AlreadyExists(_) => "already_exists",
            Error::ChildrenFailed { .. } => "children_failed",
            Error::Fatal(_) => "fatal",
            Error::Serialization(_) => "serialization",
        }
    }

    /// Get the recommended retry delay for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(3600)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
