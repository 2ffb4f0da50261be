use anyhow::Result;
use std::sync::Arc;

use nutrivision_node::{api, config, metrics, pipeline::PipelineOrchestrator};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting nutrition analysis node...");

    metrics::init_metrics();
    tracing::info!("Metrics system initialized");

    let config = config::Config::load()?;
    tokio::fs::create_dir_all(&config.storage.data_dir).await?;

    let pipeline = Arc::new(PipelineOrchestrator::from_config(&config).await?);
    let stats = pipeline.resource_stats();
    tracing::info!(
        max_image_bytes = stats.limits.max_image_bytes,
        max_concurrent_analyses = stats.limits.max_concurrent_analyses,
        "Pipeline initialized"
    );

    let app = api::create_server(pipeline, config.storage.images_dir());

    tracing::info!("API listening on http://{}:{}", config.api_host, config.api_port);
    tracing::info!("  POST /api/users/{{user_id}}/analyses - submit a photo (multipart field `image`)");
    tracing::info!("  GET  /api/users/{{user_id}}/history  - records for ?date=YYYY-MM-DD");
    tracing::info!("  GET  /images/...                    - stored images");
    tracing::info!("  GET  /health, /metrics");

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.api_host, config.api_port)).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
