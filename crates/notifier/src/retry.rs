//! Retry scheduler: parks a failed event in the delay queue.
//!
//! The scheduler never writes to the notification stream; the retry
//! promoter moves due entries back, so redelivery cadence is independent of
//! how fast workers fail.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use notistream_common::config::AppConfig;
use notistream_common::error::{AppError, Result};
use notistream_common::types::{Event, RetryEntry};
use notistream_store::DelayStore;

use crate::backoff::BackoffPolicy;

pub struct RetryScheduler {
    delay: Arc<dyn DelayStore>,
    queue: String,
    policy: BackoffPolicy,
    max_retries: u32,
}

impl RetryScheduler {
    pub fn new(
        delay: Arc<dyn DelayStore>,
        queue: impl Into<String>,
        policy: BackoffPolicy,
        max_retries: u32,
    ) -> Self {
        Self {
            delay,
            queue: queue.into(),
            policy,
            max_retries,
        }
    }

    pub fn from_config(delay: Arc<dyn DelayStore>, config: &AppConfig) -> Self {
        Self::new(
            delay,
            config.retry_queue.clone(),
            BackoffPolicy::from_config(config),
            config.max_retries,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether `event` still has retry budget left.
    pub fn can_retry(&self, event: &Event) -> bool {
        event.retry_count < self.max_retries
    }

    pub async fn schedule(&self, event: &Event) -> Result<RetryEntry> {
        self.schedule_at(event, Utc::now()).await
    }

    /// Schedule the next attempt of `event` relative to `now`.
    ///
    /// The delay is computed from the failed attempt's `retry_count`; the
    /// stored event carries the incremented count.
    pub async fn schedule_at(&self, event: &Event, now: DateTime<Utc>) -> Result<RetryEntry> {
        if !self.can_retry(event) {
            return Err(AppError::RetryExhausted {
                event_id: event.event_id.to_string(),
                retry_count: event.retry_count,
            });
        }

        let delay = self.policy.delay(event.retry_count);
        let delay_chrono = chrono::Duration::from_std(delay)
            .map_err(|e| AppError::Internal(format!("retry delay out of range: {e}")))?;

        let entry = RetryEntry {
            due_at: now + delay_chrono,
            event: event.next_attempt(),
        };

        self.delay
            .insert(&self.queue, entry.score(), &entry.to_value()?)
            .await?;

        tracing::warn!(
            event_id = %event.event_id,
            retry_count = entry.event.retry_count,
            max_retries = self.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );

        Ok(entry)
    }
}
