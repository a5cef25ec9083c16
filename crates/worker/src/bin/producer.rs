//! Publishes sample `USER_REGISTERED` events.
//!
//! ```bash
//! cargo run --bin producer          # one event
//! cargo run --bin producer -- 25    # 25 events
//! ```

use notistream_common::config::AppConfig;
use notistream_notifier::producer::{EventProducer, sample_registration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    notistream_worker::init_tracing("notistream_worker=info,notistream_notifier=info");

    let count = match std::env::args().nth(1) {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|e| anyhow::anyhow!("invalid event count '{raw}': {e}"))?,
        None => 1,
    };

    let config = AppConfig::from_env()?;
    let stores = notistream_worker::connect(&config).await?;
    let producer = EventProducer::from_config(stores.log.clone(), &config);

    for n in 0..count {
        let event = sample_registration(&format!("user{n}@example.com"));
        producer.publish(&event).await?;
    }

    tracing::info!(count, stream = %config.stream_name, "Events published");
    Ok(())
}
