//! chanidx server binary

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chanidx::api::{create_router, AppState};
use chanidx::channels::SyncMetadataMapper;
use chanidx::config::{AppConfig, LogFormat};
use chanidx::index::{
    BucketStableSequence, ChangeIndex, ChangeNotifier, ChangeReceiver, IndexKeys, KvChangeIndex,
};
use chanidx::storage::{create_bucket, Bucket, BucketConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;

    init_tracing(&config)?;

    config.validate().context("invalid configuration")?;

    let bucket_config = config
        .bucket_runtime()
        .context("invalid bucket configuration")?;
    // nothing outside this process can advance the stable sequence of a memory bucket
    let owns_stable_sequence = matches!(bucket_config, BucketConfig::Memory);
    let bucket: Arc<dyn Bucket> = Arc::from(create_bucket(bucket_config).await?);

    let node_id = config.node_id();
    tracing::info!(%node_id, "Starting chanidx node");

    let options = config.index_options();
    let keys = IndexKeys::new(options.key_prefix.clone());
    let stable_source = Arc::new(BucketStableSequence::new(
        bucket.clone(),
        keys.stable_sequence_key(),
    ));
    tracing::info!(
        key = stable_source.key(),
        writable = owns_stable_sequence,
        "Reading stable sequence from bucket"
    );

    let (notifier, changes) = ChangeNotifier::channel(options.notify_queue_capacity);
    tokio::spawn(log_notifications(changes));

    let index = Arc::new(KvChangeIndex::new(
        bucket.clone(),
        Arc::new(SyncMetadataMapper),
    ));
    index
        .init(0, stable_source.clone(), notifier, options)
        .await
        .context("failed to initialise change index")?;

    let mut state = AppState::new(index.clone(), node_id);
    if owns_stable_sequence {
        state = state.with_stable_writer(stable_source);
    }
    let router = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!(%addr, "Listening for HTTP traffic");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    index.stop();
    tracing::info!("chanidx node stopped");

    Ok(())
}

/// Drain change notifications; feeds subscribe through the HTTP API
async fn log_notifications(mut changes: ChangeReceiver) {
    while let Some(channels) = changes.recv().await {
        tracing::debug!(?channels, "Channels advanced");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("chanidx=info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    Ok(())
}
