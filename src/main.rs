//! 3scale Kubernetes Operator
//!
//! Main entry point for the operator. Reads configuration, sets up the
//! Kubernetes client and runs the controllers for the capability and
//! backup CRDs.

use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use threescale_operator::{
    config::OperatorConfig,
    controllers::{self, Context},
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("Starting 3scale Operator");

    let config = OperatorConfig::from_env()?;
    let metrics_port = config.metrics_port;

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Create shared context
    let context = Arc::new(Context::new(client.clone(), config));

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    // Run all controllers concurrently
    let backend_controller = controllers::run_backend_controller(client.clone(), context.clone());
    let product_controller = controllers::run_product_controller(client.clone(), context.clone());
    let binding_controller = controllers::run_binding_controller(client.clone(), context.clone());
    let backup_controller = controllers::run_backup_controller(client.clone(), context.clone());
    let restore_controller = controllers::run_restore_controller(client.clone(), context.clone());

    // Handle graceful shutdown
    tokio::select! {
        _ = backend_controller => {
            error!("Backend controller exited unexpectedly");
        }
        _ = product_controller => {
            error!("Product controller exited unexpectedly");
        }
        _ = binding_controller => {
            error!("Binding controller exited unexpectedly");
        }
        _ = backup_controller => {
            error!("Backup controller exited unexpectedly");
        }
        _ = restore_controller => {
            error!("Restore controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    info!("3scale Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
