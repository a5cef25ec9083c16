//! Notification worker: the consumption loop.
//!
//! Every iteration first reclaims stale entries, then blocks for new ones.
//! Each entry goes through the same pipeline: idempotency guard, business
//! processing, then either success bookkeeping or the retry/DLQ handoff.
//! The original log entry is acknowledged only after that terminal
//! handling. An infrastructure error leaves it unacknowledged, so the
//! reclaimer brings it back later.
//!
//! A reclaimed entry whose event is still locked is left pending too. Its
//! holder may be alive and will acknowledge the entry id when it finishes;
//! if the holder died, the entry keeps coming back until the lock expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use notistream_common::config::AppConfig;
use notistream_common::error::Result;
use notistream_common::types::{Event, LogEntry};
use notistream_store::{LogStore, Stores};

use crate::dlq::DeadLetterEscalator;
use crate::idempotency::{GuardDecision, IdempotencyGuard};
use crate::processor::NotificationProcessor;
use crate::reclaimer::Reclaimer;
use crate::retry::RetryScheduler;

/// Where the loop is within an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Reclaiming,
    ConsumingNew,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerPhase::Idle => write!(f, "idle"),
            WorkerPhase::Reclaiming => write!(f, "reclaiming"),
            WorkerPhase::ConsumingNew => write!(f, "consuming_new"),
        }
    }
}

/// How an entry reached the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// First delivery from a `>` read.
    New,
    /// Claimed from another consumer's pending list.
    Reclaimed,
}

/// Handling applied to one entry. Every variant except `Deferred` means the
/// entry was acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Processed,
    AlreadyProcessed,
    InFlight,
    /// Reclaimed while its event is locked; left pending.
    Deferred,
    RetryScheduled {
        retry_count: u32,
        due_at: DateTime<Utc>,
    },
    DeadLettered {
        dlq_entry_id: String,
    },
}

/// Counts from one loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub reclaimed: usize,
    pub consumed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Reclaimed entries left pending behind a live processing lock.
    pub deferred: usize,
    /// Entries left unacknowledged because of an infrastructure error.
    pub errors: usize,
}

impl IterationReport {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Processed => self.processed += 1,
            Disposition::AlreadyProcessed | Disposition::InFlight => self.skipped += 1,
            Disposition::RetryScheduled { .. } => self.retried += 1,
            Disposition::DeadLettered { .. } => self.dead_lettered += 1,
            Disposition::Deferred => self.deferred += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.reclaimed == 0 && self.consumed == 0
    }
}

/// Loop tunables, usually taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub read_batch_size: usize,
    pub block_timeout: Duration,
    pub error_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stream: config.stream_name.clone(),
            group: config.group_name.clone(),
            consumer: config.consumer_name.clone(),
            read_batch_size: config.read_batch_size,
            block_timeout: config.block_timeout(),
            error_backoff: config.worker_error_backoff(),
        }
    }
}

pub struct NotificationWorker {
    settings: WorkerSettings,
    log: Arc<dyn LogStore>,
    guard: IdempotencyGuard,
    reclaimer: Reclaimer,
    scheduler: RetryScheduler,
    escalator: DeadLetterEscalator,
    processor: Arc<dyn NotificationProcessor>,
}

impl NotificationWorker {
    pub fn new(
        settings: WorkerSettings,
        log: Arc<dyn LogStore>,
        guard: IdempotencyGuard,
        reclaimer: Reclaimer,
        scheduler: RetryScheduler,
        escalator: DeadLetterEscalator,
        processor: Arc<dyn NotificationProcessor>,
    ) -> Self {
        Self {
            settings,
            log,
            guard,
            reclaimer,
            scheduler,
            escalator,
            processor,
        }
    }

    /// Wire every collaborator from `config` against `stores`.
    pub fn from_config(
        config: &AppConfig,
        stores: &Stores,
        processor: Arc<dyn NotificationProcessor>,
    ) -> Self {
        Self::new(
            WorkerSettings::from_config(config),
            stores.log.clone(),
            IdempotencyGuard::from_config(stores.locks.clone(), config),
            Reclaimer::from_config(stores.log.clone(), config),
            RetryScheduler::from_config(stores.delay.clone(), config),
            DeadLetterEscalator::from_config(stores.log.clone(), config),
            processor,
        )
    }

    pub fn consumer(&self) -> &str {
        &self.settings.consumer
    }

    /// Run iterations until `shutdown` flips to `true`.
    ///
    /// The flag is checked between iterations, so shutdown latency is
    /// bounded by the block timeout plus the time to settle one batch.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            consumer = %self.settings.consumer,
            stream = %self.settings.stream,
            group = %self.settings.group,
            "Notification worker started"
        );

        while !*shutdown.borrow() {
            let report = self.run_once().await;

            if report.errors > 0 {
                tracing::warn!(
                    errors = report.errors,
                    backoff_ms = self.settings.error_backoff.as_millis() as u64,
                    "Iteration had infrastructure errors, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.error_backoff) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(consumer = %self.settings.consumer, "Notification worker stopped");
    }

    /// One `Reclaiming -> ConsumingNew` pass. Never fails; errors are
    /// logged and counted in the report.
    pub async fn run_once(&self) -> IterationReport {
        let mut report = IterationReport::default();

        self.enter(WorkerPhase::Reclaiming);
        match self.reclaimer.reclaim(&self.settings.consumer).await {
            Ok(entries) => {
                report.reclaimed = entries.len();
                for entry in &entries {
                    self.settle(entry, Delivery::Reclaimed, &mut report).await;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Reclaim failed");
                report.errors += 1;
            }
        }

        self.enter(WorkerPhase::ConsumingNew);
        match self
            .log
            .read_group(
                &self.settings.group,
                &self.settings.consumer,
                &self.settings.stream,
                self.settings.read_batch_size,
                self.settings.block_timeout,
            )
            .await
        {
            Ok(entries) => {
                report.consumed = entries.len();
                for entry in &entries {
                    self.settle(entry, Delivery::New, &mut report).await;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Reading new entries failed");
                report.errors += 1;
            }
        }

        self.enter(WorkerPhase::Idle);
        report
    }

    fn enter(&self, phase: WorkerPhase) {
        tracing::trace!(consumer = %self.settings.consumer, %phase, "Worker phase");
    }

    async fn settle(&self, entry: &LogEntry, delivery: Delivery, report: &mut IterationReport) {
        match self.handle_entry(entry, delivery).await {
            Ok(disposition) => report.record(&disposition),
            Err(e) => {
                tracing::error!(
                    entry_id = %entry.id,
                    error = %e,
                    "Entry handling aborted, left unacknowledged"
                );
                report.errors += 1;
            }
        }
    }

    /// Run one entry through the pipeline and acknowledge it.
    ///
    /// `Err` means an infrastructure failure and the entry was not
    /// acknowledged. Business failures are never returned as `Err`.
    pub async fn handle_entry(&self, entry: &LogEntry, delivery: Delivery) -> Result<Disposition> {
        let event = entry.event()?;

        let disposition = match self.guard.should_process(&event.event_id).await? {
            GuardDecision::AlreadyProcessed => Disposition::AlreadyProcessed,
            GuardDecision::InFlight if delivery == Delivery::Reclaimed => {
                tracing::info!(
                    entry_id = %entry.id,
                    event_id = %event.event_id,
                    "Reclaimed entry is still locked, left pending"
                );
                return Ok(Disposition::Deferred);
            }
            GuardDecision::InFlight => Disposition::InFlight,
            GuardDecision::Acquired => self.process_owned(entry, &event).await?,
        };

        self.log
            .ack(&self.settings.stream, &self.settings.group, &entry.id)
            .await?;

        tracing::debug!(
            entry_id = %entry.id,
            event_id = %event.event_id,
            ?disposition,
            "Entry acknowledged"
        );

        Ok(disposition)
    }

    /// Process an event whose lock the caller holds.
    async fn process_owned(&self, entry: &LogEntry, event: &Event) -> Result<Disposition> {
        match self.processor.process(event).await {
            Ok(()) => {
                self.guard.complete(&event.event_id).await?;
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    retry_count = event.retry_count,
                    "Notification processed"
                );
                Ok(Disposition::Processed)
            }
            Err(failure) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    retry_count = event.retry_count,
                    error = %failure,
                    "Notification processing failed"
                );
                self.guard.release(&event.event_id).await?;

                if self.scheduler.can_retry(event) {
                    let scheduled = self.scheduler.schedule(event).await?;
                    Ok(Disposition::RetryScheduled {
                        retry_count: scheduled.event.retry_count,
                        due_at: scheduled.due_at,
                    })
                } else {
                    let dlq_entry_id = self
                        .escalator
                        .escalate(event, &entry.fields, &format!("{failure:#}"))
                        .await?;
                    Ok(Disposition::DeadLettered { dlq_entry_id })
                }
            }
        }
    }
}
