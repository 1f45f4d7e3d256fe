//! Controller module for rabbitmq-operator.
//!
//! Contains the reconcilers, the partition state machine, validation,
//! error handling, status management and the scheduling layer that feeds
//! reconciles from watches and periodic sweeps.
//!
//! Two custom resources are reconciled:
//! - RabbitMQCustomResource (cluster_* and the child reconcilers)
//! - RabbitMQNetworkPartitionCustomResource (partition_* modules)

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod status;

// Scheduling
pub mod executor;
pub mod named_locks;
pub mod orchestrator;
pub mod watch;

// RabbitMQCustomResource controller
pub mod cluster_reconciler;
pub mod factory;
pub mod policy_reconciler;
pub mod shovel_reconciler;
pub mod user_reconciler;
pub mod validation;

// RabbitMQNetworkPartitionCustomResource controller
pub mod partition_reconciler;
pub mod partition_state_machine;
pub mod queue_operations;
