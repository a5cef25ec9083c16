//! Business processing of a notification event.
//!
//! The worker only knows that processing succeeded or failed; any `Err` is a
//! business failure and drives the retry/DLQ path.

use std::time::Duration;

use async_trait::async_trait;

use notistream_common::types::Event;

#[async_trait]
pub trait NotificationProcessor: Send + Sync {
    async fn process(&self, event: &Event) -> anyhow::Result<()>;
}

/// Records the event in the log and succeeds.
#[derive(Debug, Default)]
pub struct LogProcessor;

#[async_trait]
impl NotificationProcessor for LogProcessor {
    async fn process(&self, event: &Event) -> anyhow::Result<()> {
        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            retry_count = event.retry_count,
            payload = ?event.payload,
            "Event processed"
        );
        Ok(())
    }
}

/// Delivers the event as JSON to an HTTP endpoint.
///
/// Transport errors and non-2xx responses are business failures.
pub struct WebhookProcessor {
    client: reqwest::Client,
    url: String,
}

impl WebhookProcessor {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationProcessor for WebhookProcessor {
    async fn process(&self, event: &Event) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", event.event_id.to_string())
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook {} responded with {}", self.url, status);
        }

        tracing::info!(
            event_id = %event.event_id,
            status = status.as_u16(),
            "Notification delivered to webhook"
        );
        Ok(())
    }
}
