//! Moves due retries from the delay queue back onto the notification stream.
//!
//! Runs as its own process; any number of promoters may share one queue.

use notistream_common::config::AppConfig;
use notistream_notifier::promoter::RetryPromoter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    notistream_worker::init_tracing("notistream_worker=info,notistream_notifier=info");

    let config = AppConfig::from_env()?;
    let stores = notistream_worker::connect(&config).await?;

    let promoter = RetryPromoter::from_config(stores.delay.clone(), stores.log.clone(), &config);
    promoter.run(notistream_worker::shutdown_on_ctrl_c()).await;

    Ok(())
}
