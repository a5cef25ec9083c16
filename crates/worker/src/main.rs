use std::sync::Arc;

use notistream_common::config::AppConfig;
use notistream_notifier::processor::{LogProcessor, NotificationProcessor, WebhookProcessor};
use notistream_notifier::setup::init_stream;
use notistream_notifier::worker::NotificationWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    notistream_worker::init_tracing("notistream_worker=info,notistream_notifier=info");

    tracing::info!("Notistream worker starting...");

    let config = AppConfig::from_env()?;
    let stores = notistream_worker::connect(&config).await?;

    init_stream(stores.log.as_ref(), &config.stream_name, &config.group_name).await?;

    let processor: Arc<dyn NotificationProcessor> = match &config.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Delivering notifications to webhook");
            Arc::new(WebhookProcessor::new(url.clone())?)
        }
        None => {
            tracing::info!("No webhook configured, notifications are only logged");
            Arc::new(LogProcessor)
        }
    };

    let worker = NotificationWorker::from_config(&config, &stores, processor);
    worker.run(notistream_worker::shutdown_on_ctrl_c()).await;

    tracing::info!("Notistream worker stopped.");
    Ok(())
}
