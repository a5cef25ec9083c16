//! Reclaimer: recovers entries left pending by crashed or stalled workers.
//!
//! An entry delivered to a consumer stays in the group's pending list until
//! acknowledged. Once it has been idle for `min_idle`, any live worker may
//! claim it and run it through the normal pipeline.

use std::sync::Arc;
use std::time::Duration;

use notistream_common::config::AppConfig;
use notistream_common::error::Result;
use notistream_common::types::LogEntry;
use notistream_store::LogStore;

/// Scan the pending list from its head on every pass.
const SCAN_FROM_START: &str = "0-0";

pub struct Reclaimer {
    log: Arc<dyn LogStore>,
    stream: String,
    group: String,
    min_idle: Duration,
    batch_size: usize,
}

impl Reclaimer {
    pub fn new(
        log: Arc<dyn LogStore>,
        stream: impl Into<String>,
        group: impl Into<String>,
        min_idle: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            log,
            stream: stream.into(),
            group: group.into(),
            min_idle,
            batch_size,
        }
    }

    pub fn from_config(log: Arc<dyn LogStore>, config: &AppConfig) -> Self {
        Self::new(
            log,
            config.stream_name.clone(),
            config.group_name.clone(),
            config.min_idle_time(),
            config.reclaim_batch_size,
        )
    }

    /// Claim up to one batch of stale entries onto `consumer`.
    ///
    /// An empty result is the normal case.
    pub async fn reclaim(&self, consumer: &str) -> Result<Vec<LogEntry>> {
        let batch = self
            .log
            .autoclaim(
                &self.stream,
                &self.group,
                consumer,
                self.min_idle,
                SCAN_FROM_START,
                self.batch_size,
            )
            .await?;

        if !batch.entries.is_empty() {
            tracing::info!(
                consumer,
                reclaimed = batch.entries.len(),
                min_idle_ms = self.min_idle.as_millis() as u64,
                "Reclaimed stuck messages"
            );
        }

        Ok(batch.entries)
    }
}
