//! Publishing events onto the notification stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use notistream_common::config::AppConfig;
use notistream_common::error::Result;
use notistream_common::types::Event;
use notistream_store::LogStore;

pub struct EventProducer {
    log: Arc<dyn LogStore>,
    stream: String,
}

impl EventProducer {
    pub fn new(log: Arc<dyn LogStore>, stream: impl Into<String>) -> Self {
        Self {
            log,
            stream: stream.into(),
        }
    }

    pub fn from_config(log: Arc<dyn LogStore>, config: &AppConfig) -> Self {
        Self::new(log, config.stream_name.clone())
    }

    /// Append `event` and return the stream entry id.
    pub async fn publish(&self, event: &Event) -> Result<String> {
        let entry_id = self.log.append(&self.stream, &event.to_fields()).await?;

        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            entry_id = %entry_id,
            stream = %self.stream,
            "Event published"
        );

        Ok(entry_id)
    }
}

/// A `USER_REGISTERED` event for a fixed test address.
pub fn sample_registration(email: &str) -> Event {
    let mut payload = BTreeMap::new();
    payload.insert("email".to_string(), email.to_string());
    Event::new("USER_REGISTERED", payload)
}
