//! rabbitmq-operator library crate
//!
//! This module exports the controllers, CRD definitions, resource generators
//! and the clients used to reach Kubernetes and the RabbitMQ management API.

pub mod app;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use app::App;
pub use config::OperatorConfig;
pub use controller::error::{Error, Result};
pub use health::HealthState;
