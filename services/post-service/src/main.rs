use anyhow::{Context, Result};
use post_service::{
    start_api_server, AppState, Config, ContentFilter, IngestionOrchestrator, JwtService,
    QueryOrchestrator, Reconciler, Stores,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Around post service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let stores = Stores::connect(&config)
        .await
        .context("Failed to connect backing stores")?;

    let ingestion = Arc::new(IngestionOrchestrator::new(
        stores.clone(),
        config.s3.bucket.clone(),
        config.search.index.clone(),
    ));

    let query = Arc::new(
        QueryOrchestrator::new(
            stores.index.clone(),
            ContentFilter::new(&config.filter),
            &config.search,
        )
        .context("Invalid search configuration")?,
    );

    let api_state = AppState {
        ingestion,
        query,
        jwt: Arc::new(JwtService::new(&config.auth.jwt_secret)),
        stores: stores.clone(),
        bucket: config.s3.bucket.clone(),
    };

    let shutdown = CancellationToken::new();

    // Spawn reconciliation task
    let reconcile_handle = if config.reconcile.enabled {
        let reconciler = Reconciler::new(
            stores.clone(),
            config.s3.bucket.clone(),
            config.search.index.clone(),
            std::time::Duration::from_secs(config.reconcile.grace_period_secs),
        );
        let interval = config.reconcile_interval();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            reconciler.run(interval, token).await;
        }))
    } else {
        info!("Reconciliation disabled");
        None
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let token = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, token).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Post service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down post service");

    shutdown.cancel();

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }
    if let Some(handle) = reconcile_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Reconciliation task failed");
        }
    }

    info!("Post service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
