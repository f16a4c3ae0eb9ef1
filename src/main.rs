//! Database Kubernetes Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client,
//! verifies the Database CRD is reachable, and runs the reconciliation loop
//! until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use database_operator::{
    adapters::KubeClusterApi,
    cluster::ClusterApi,
    config::OperatorConfig,
    controllers::{self, Context},
    metrics,
    status::KubeStatusSink,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    let config = OperatorConfig::parse();
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        "Starting Database Operator"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let cluster: Arc<dyn ClusterApi> =
        Arc::new(KubeClusterApi::new(client.clone(), config.namespace.clone()));

    // Verify CRD is installed and the API is reachable
    cluster
        .list_databases()
        .await
        .context("Database CRD not reachable; is it installed?")?;

    if config.credential_seed.is_none() {
        warn!("No credential seed configured, using a random seed for this run");
    }
    let credentials = Arc::new(config.credentials()?);

    // Create shared context
    let context = Arc::new(Context::new(
        cluster.clone(),
        credentials,
        Arc::new(KubeStatusSink::new(client)),
    ));

    let shutdown = CancellationToken::new();

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_port, shutdown.clone()));
    info!("Metrics server starting on port {}", config.metrics_port);

    let mut controller = tokio::spawn(controllers::run_database_controller(
        cluster,
        context,
        config.dispatcher(),
        config.watch_backoff(),
        shutdown.clone(),
    ));

    // Handle graceful shutdown
    let controller_done = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
            false
        }
        result = &mut controller => {
            error!(result = ?result, "Database controller exited unexpectedly");
            true
        }
    };
    shutdown.cancel();
    metrics::OPERATOR_HEALTH.set(0.0);

    if !controller_done {
        if let Err(e) = controller.await {
            error!(error = %e, "Database controller task failed");
        }
    }
    match metrics_handle.await {
        Ok(Err(e)) => error!(error = %e, "Metrics server failed"),
        Err(e) => error!(error = %e, "Metrics server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Database Operator stopped");
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
            error!(error = %e, "Failed to install CTRL+C handler");
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
