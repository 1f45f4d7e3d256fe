//! rabbitmq-operator - A Kubernetes operator for RabbitMQ clusters.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Builds the operator and checks that its CRDs are installed
//! - Starts the watches, sweeps and health server
//! - Drains in-flight reconciliations on SIGTERM or SIGINT

use std::process::ExitCode;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info};

use rabbitmq_operator::App;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!("Starting rabbitmq-operator");

    let app = match App::from_env().await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Failed to start operator");
            return ExitCode::FAILURE;
        }
    };
    info!(namespace = %app.config().namespace, "Connected to Kubernetes cluster");

    if let Err(e) = app.preflight().await {
        error!(error = %e, "Preflight check failed");
        return ExitCode::FAILURE;
    }

    let handles = app.start().await;

    shutdown_signal().await;
    info!("Received shutdown signal, initiating graceful shutdown...");
    app.shutdown(handles, Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS))
        .await;

    info!("Operator stopped");
    ExitCode::SUCCESS
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rabbitmq_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the operator cannot shut down
/// gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
