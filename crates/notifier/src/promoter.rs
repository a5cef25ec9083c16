//! Retry promoter: moves due retries from the delay queue back onto the
//! notification stream.
//!
//! Removing the exact member from the queue is what claims it: when several
//! promoters see the same due entry, only the one whose removal succeeds
//! appends it. If the append then fails, the member is put back with its
//! original score so the next pass tries again. A retry may be duplicated by
//! that path but never dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use notistream_common::config::AppConfig;
use notistream_common::error::Result;
use notistream_common::types::RetryEntry;
use notistream_store::{DelayStore, LogStore};

/// Counts from one promotion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionReport {
    /// Re-appended to the notification stream.
    pub promoted: usize,
    /// Removed by a concurrent promoter first.
    pub contended: usize,
    /// Unparseable members dropped from the queue.
    pub discarded: usize,
}

pub struct RetryPromoter {
    delay: Arc<dyn DelayStore>,
    log: Arc<dyn LogStore>,
    queue: String,
    stream: String,
    poll_interval: Duration,
}

impl RetryPromoter {
    pub fn new(
        delay: Arc<dyn DelayStore>,
        log: Arc<dyn LogStore>,
        queue: impl Into<String>,
        stream: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            delay,
            log,
            queue: queue.into(),
            stream: stream.into(),
            poll_interval,
        }
    }

    pub fn from_config(
        delay: Arc<dyn DelayStore>,
        log: Arc<dyn LogStore>,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            delay,
            log,
            config.retry_queue.clone(),
            config.stream_name.clone(),
            config.promoter_poll_interval(),
        )
    }

    pub async fn promote_due(&self) -> Result<PromotionReport> {
        self.promote_due_at(Utc::now()).await
    }

    /// Promote every retry due at or before `now`.
    pub async fn promote_due_at(&self, now: DateTime<Utc>) -> Result<PromotionReport> {
        let due = self
            .delay
            .range_by_score_up_to(&self.queue, now.timestamp_millis())
            .await?;

        let mut report = PromotionReport::default();

        for value in due {
            if !self.delay.remove_exact(&self.queue, &value).await? {
                report.contended += 1;
                continue;
            }

            let entry = match RetryEntry::from_value(&value) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(
                        queue = %self.queue,
                        error = %e,
                        payload = %value,
                        "Discarding malformed retry entry"
                    );
                    report.discarded += 1;
                    continue;
                }
            };

            match self.log.append(&self.stream, &entry.event.to_fields()).await {
                Ok(entry_id) => {
                    tracing::info!(
                        event_id = %entry.event.event_id,
                        retry_count = entry.event.retry_count,
                        entry_id = %entry_id,
                        "Retry promoted to notification stream"
                    );
                    report.promoted += 1;
                }
                Err(e) => {
                    if let Err(requeue_err) =
                        self.delay.insert(&self.queue, entry.score(), &value).await
                    {
                        tracing::error!(
                            event_id = %entry.event.event_id,
                            error = %requeue_err,
                            payload = %value,
                            "Retry entry lost: promotion and requeue both failed"
                        );
                    }
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Poll the delay queue until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            queue = %self.queue,
            stream = %self.stream,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Retry promoter started"
        );

        while !*shutdown.borrow() {
            match self.promote_due().await {
                Ok(report) if report.promoted > 0 || report.discarded > 0 => {
                    tracing::debug!(?report, "Promotion pass finished");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Promotion pass failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Retry promoter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use notistream_common::error::AppError;
    use notistream_common::types::{AutoClaimBatch, Event, Fields, LogEntry, PendingSummary};
    use notistream_store::MemoryStore;
    use std::collections::BTreeMap;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    async fn park(store: &MemoryStore, due_ms: i64) -> RetryEntry {
        let entry = RetryEntry {
            due_at: at(due_ms),
            event: Event::new("USER_REGISTERED", BTreeMap::new()).next_attempt(),
        };
        store
            .insert("retry", entry.score(), &entry.to_value().unwrap())
            .await
            .unwrap();
        entry
    }

    fn promoter(store: &Arc<MemoryStore>) -> RetryPromoter {
        RetryPromoter::new(
            store.clone(),
            store.clone(),
            "retry",
            "notifications",
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_promotes_only_due_entries() {
        let store = Arc::new(MemoryStore::new());
        let due = park(&store, 1_000).await;
        park(&store, 5_000).await;

        let report = promoter(&store).promote_due_at(at(2_000)).await.unwrap();

        assert_eq!(report.promoted, 1);
        let stream = store.entries("notifications").await;
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].event().unwrap(), due.event);
        assert_eq!(store.queue_entries("retry").await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_promoters_never_double_promote() {
        let store = Arc::new(MemoryStore::new());
        for due in 0..20 {
            park(&store, due).await;
        }

        let first = promoter(&store);
        let second = promoter(&store);
        let (a, b) = tokio::join!(
            first.promote_due_at(at(1_000)),
            second.promote_due_at(at(1_000))
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.promoted + b.promoted, 20);
        assert_eq!(store.entries("notifications").await.len(), 20);
        assert!(store.queue_entries("retry").await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_member_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.insert("retry", 10, "{not json").await.unwrap();

        let report = promoter(&store).promote_due_at(at(1_000)).await.unwrap();

        assert_eq!(report.discarded, 1);
        assert!(store.queue_entries("retry").await.is_empty());
        assert!(store.entries("notifications").await.is_empty());
    }

    /// Log store whose appends always fail.
    struct UnreachableLog;

    #[async_trait]
    impl LogStore for UnreachableLog {
        async fn append(&self, _: &str, _: &Fields) -> Result<String> {
            Err(AppError::Store("connection refused".to_string()))
        }
        async fn create_consumer_group(&self, _: &str, _: &str, _: &str, _: bool) -> Result<()> {
            Ok(())
        }
        async fn read_group(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: usize,
            _: Duration,
        ) -> Result<Vec<LogEntry>> {
            Ok(Vec::new())
        }
        async fn ack(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn autoclaim(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Duration,
            _: &str,
            _: usize,
        ) -> Result<AutoClaimBatch> {
            Ok(AutoClaimBatch::default())
        }
        async fn pending_summary(&self, _: &str, _: &str) -> Result<PendingSummary> {
            Ok(PendingSummary::default())
        }
    }

    #[tokio::test]
    async fn test_failed_append_requeues_entry() {
        let store = Arc::new(MemoryStore::new());
        let entry = park(&store, 500).await;

        let promoter = RetryPromoter::new(
            store.clone(),
            Arc::new(UnreachableLog),
            "retry",
            "notifications",
            Duration::from_millis(100),
        );

        assert!(promoter.promote_due_at(at(1_000)).await.is_err());

        let queued = store.queue_entries("retry").await;
        assert_eq!(queued, vec![(500, entry.to_value().unwrap())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        park(&store, 0).await;

        let promoter = promoter(&store);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { promoter.run(rx).await });
        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.entries("notifications").await.len(), 1);
    }
}
