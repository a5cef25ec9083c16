//! Idempotency guard: at most one business-logic execution per event id.
//!
//! Two keys per event:
//! - `processing:{eventId}`: held while a worker owns the event, created
//!   with set-if-absent so only one racing worker wins
//! - `processed:{eventId}`: written after success; any later delivery of the
//!   event (redelivery, reclaim, retry) is acknowledged and skipped
//!
//! On success the lock is deleted before the marker is written. In the gap
//! neither key exists, so a duplicate could slip through; the log entry is
//! still unacknowledged at that point and the window is accepted.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use notistream_common::config::AppConfig;
use notistream_common::error::Result;
use notistream_store::LockStore;

/// Outcome of [`IdempotencyGuard::should_process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// The caller holds the processing lock and must run the event.
    Acquired,
    /// The event was already processed successfully.
    AlreadyProcessed,
    /// Another worker is processing the event right now.
    InFlight,
}

impl GuardDecision {
    pub fn should_process(self) -> bool {
        self == GuardDecision::Acquired
    }
}

impl std::fmt::Display for GuardDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardDecision::Acquired => write!(f, "acquired"),
            GuardDecision::AlreadyProcessed => write!(f, "already_processed"),
            GuardDecision::InFlight => write!(f, "in_flight"),
        }
    }
}

pub fn processing_key(event_id: &Uuid) -> String {
    format!("processing:{}", event_id)
}

pub fn processed_key(event_id: &Uuid) -> String {
    format!("processed:{}", event_id)
}

/// Lock-store backed idempotency guard.
pub struct IdempotencyGuard {
    locks: Arc<dyn LockStore>,
    /// Written as the lock value so operators can see who holds an event.
    holder: String,
    lock_ttl: Duration,
    processed_ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(
        locks: Arc<dyn LockStore>,
        holder: impl Into<String>,
        lock_ttl: Duration,
        processed_ttl: Duration,
    ) -> Self {
        Self {
            locks,
            holder: holder.into(),
            lock_ttl,
            processed_ttl,
        }
    }

    pub fn from_config(locks: Arc<dyn LockStore>, config: &AppConfig) -> Self {
        Self::new(
            locks,
            config.consumer_name.clone(),
            config.lock_ttl(),
            config.processed_ttl(),
        )
    }

    /// Decide whether the caller may process `event_id`.
    ///
    /// Checks the processed marker first, then tries to take the processing
    /// lock with set-if-absent.
    pub async fn should_process(&self, event_id: &Uuid) -> Result<GuardDecision> {
        if self.locks.exists(&processed_key(event_id)).await? {
            tracing::debug!(event_id = %event_id, "Event already processed");
            return Ok(GuardDecision::AlreadyProcessed);
        }

        let acquired = self
            .locks
            .set_if_absent(&processing_key(event_id), &self.holder, self.lock_ttl)
            .await?;

        if !acquired {
            tracing::debug!(event_id = %event_id, "Duplicate skipped, event in flight");
            return Ok(GuardDecision::InFlight);
        }

        Ok(GuardDecision::Acquired)
    }

    /// Success path: release the lock, then write the processed marker.
    pub async fn complete(&self, event_id: &Uuid) -> Result<()> {
        self.locks.delete(&processing_key(event_id)).await?;
        self.locks
            .set(&processed_key(event_id), "1", self.processed_ttl)
            .await?;
        Ok(())
    }

    /// Failure path: release the lock without marking the event processed.
    pub async fn release(&self, event_id: &Uuid) -> Result<()> {
        self.locks.delete(&processing_key(event_id)).await
    }

    pub async fn is_processed(&self, event_id: &Uuid) -> Result<bool> {
        self.locks.exists(&processed_key(event_id)).await
    }
}
