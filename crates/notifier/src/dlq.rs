//! Dead letter escalation.
//!
//! An event whose retry budget is spent is appended to the dead-letter
//! stream with the exact field set of the log entry that delivered it. Nothing in the pipeline reads that stream again;
//! entries there are for an operator or an out-of-band consumer.

use std::sync::Arc;

use notistream_common::config::AppConfig;
use notistream_common::error::Result;
use notistream_common::types::{Event, Fields};
use notistream_store::LogStore;

pub struct DeadLetterEscalator {
    log: Arc<dyn LogStore>,
    dlq_stream: String,
}

impl DeadLetterEscalator {
    pub fn new(log: Arc<dyn LogStore>, dlq_stream: impl Into<String>) -> Self {
        Self {
            log,
            dlq_stream: dlq_stream.into(),
        }
    }

    pub fn from_config(log: Arc<dyn LogStore>, config: &AppConfig) -> Self {
        Self::new(log, config.dlq_stream.clone())
    }

    /// Append the delivered `fields` of `event` to the dead-letter stream
    /// and return the new entry id.
    ///
    /// `reason` only goes to the log line.
    pub async fn escalate(&self, event: &Event, fields: &Fields, reason: &str) -> Result<String> {
        let entry_id = self.log.append(&self.dlq_stream, fields).await?;

        tracing::error!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            dlq_stream = %self.dlq_stream,
            dlq_entry_id = %entry_id,
            reason,
            "Moved to DLQ after exhausting retries"
        );

        Ok(entry_id)
    }
}
