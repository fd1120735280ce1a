use anyhow::{Context, Result};
use image_service::{
    start_api_server, AppState, Config, FileStore, ImageService, ImageStore, PgImageStore,
    Reconciler, YoloAnalyzer,
};
use std::sync::Arc;
use tokio::signal;
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
        "Starting Image Detection Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let pg_store = Arc::new(
        PgImageStore::connect(&config.database)
            .await
            .context("Failed to initialize image store")?,
    );

    if config.database.run_migrations {
        pg_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let store: Arc<dyn ImageStore> = pg_store.clone();
    let analyzer = Arc::new(YoloAnalyzer::new(config.analyzer.clone()));
    let files = FileStore::new(&config.storage.images_dir);

    info!(
        images_dir = %files.root().display(),
        analyzer = %config.analyzer.script.display(),
        "Storage and analyzer configured"
    );

    let service = Arc::new(ImageService::new(store.clone(), analyzer, files));
    let api_state = AppState::new(service, &config.api, config.storage.max_upload_bytes)
        .context("Failed to build API state")?;

    // Spawn reconciler task
    let reconcile_handle = if config.reconcile.enabled {
        let reconciler = Reconciler::new(store.clone(), config.stale_after());
        let interval = config.reconcile_interval();
        Some(tokio::spawn(reconciler.run(interval)))
    } else {
        info!("Reconciler disabled");
        None
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Image service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down image service");

    // Abort tasks
    if let Some(handle) = reconcile_handle {
        handle.abort();
    }
    api_handle.abort();

    pg_store.close().await;

    info!("Image service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
