//! Process bootstrap shared by the notistream binaries.

use std::sync::Arc;

use tokio::sync::watch;

use notistream_common::config::AppConfig;
use notistream_store::{RedisStore, Stores};

/// JSON logs filtered by `RUST_LOG`, falling back to `default_filter`.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .json()
        .init();
}

/// Connect to Redis and expose it through all three store contracts.
///
/// This is the only fatal step at startup: a worker that cannot reach the
/// server at all exits non-zero.
pub async fn connect(config: &AppConfig) -> anyhow::Result<Stores> {
    let store = RedisStore::connect(&config.redis_url).await?;
    Ok(Stores::shared(Arc::new(store)))
}

/// A shutdown flag that flips to `true` on Ctrl+C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Received shutdown signal, stopping gracefully...");
        let _ = tx.send(true);
    });
    rx
}
