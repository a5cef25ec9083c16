//! Prints the consumer group's pending summary.

use notistream_common::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    notistream_worker::init_tracing("notistream_worker=warn");

    let config = AppConfig::from_env()?;
    let stores = notistream_worker::connect(&config).await?;

    let summary = stores
        .log
        .pending_summary(&config.stream_name, &config.group_name)
        .await?;

    println!(
        "Pending on {} / {}: {}",
        config.stream_name, config.group_name, summary.count
    );
    if let (Some(min), Some(max)) = (&summary.min_id, &summary.max_id) {
        println!("  id range: {min} .. {max}");
    }
    for (consumer, count) in &summary.consumers {
        println!("  {consumer}: {count}");
    }

    Ok(())
}
