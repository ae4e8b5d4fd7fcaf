use anyhow::Context;
use common::TelemetryGuard;
use inference::OrtDetector;
use server::{AppState, ServerConfig, WorkerPool, net, router};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;

    let _telemetry = TelemetryGuard::init_or_logging(
        "rice-server",
        config.otel_endpoint.as_deref(),
        config.environment,
    )?;

    tracing::info!(
        config = ?config,
        "Loaded configuration"
    );

    let supervisor_config = config.supervisor.clone();
    let detector_config = config.detector.clone();
    let pool = tokio::task::spawn_blocking(move || {
        WorkerPool::start(supervisor_config, move || OrtDetector::load(&detector_config))
    })
    .await?
    .context("Failed to start workers - check MODEL_PATH and LABELS_PATH")?;
    let pool = Arc::new(pool);

    let state = AppState::new(Arc::clone(&pool), config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        url = %net::public_url(local_addr),
        bind = %local_addr,
        workers = config.supervisor.workers,
        "Rice quality detection server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, shutting down workers");
    tokio::task::spawn_blocking(move || pool.shutdown()).await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
