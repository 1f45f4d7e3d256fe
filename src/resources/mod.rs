//! Resource generation module.
//!
//! Contains the pure builders for Kubernetes objects owned by a
//! `RabbitMQCustomResource`.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | Secrets | Admin credentials, erlang cookie, per-user credentials |
//! | Main Service | AMQP and management endpoint |
//! | Discovery Service | Headless, peer discovery (publishNotReadyAddresses) |
//! | LoadBalancer / NodePort Service | Optional external access |
//! | StatefulSet | Stable pod identity and mnesia storage per broker |
//! | PodDisruptionBudget | One voluntary disruption at a time |

pub mod common;
pub mod pdb;
pub mod secrets;
pub mod services;
pub mod statefulset;

pub use common::{owner_reference, standard_labels};
