//! Store contracts the delivery pipeline is built on.
//!
//! Three leaf collaborators, each behind an async trait so workers receive
//! them by injection:
//! - [`LogStore`]: ordered log with consumer groups (Redis Streams)
//! - [`DelayStore`]: score-ordered queue for scheduled retries (sorted set)
//! - [`LockStore`]: expiring keys for idempotency locks and markers
//!
//! [`RedisStore`] implements all three against a live server;
//! [`MemoryStore`] mirrors the same semantics in process for tests and
//! local runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use notistream_common::error::Result;
use notistream_common::types::{AutoClaimBatch, Fields, LogEntry, PendingSummary};

pub mod memory;
pub mod redis_store;

pub use crate::memory::MemoryStore;
pub use crate::redis_store::RedisStore;

/// Append-only ordered log with consumer-group delivery.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append an entry and return its generated id.
    async fn append(&self, stream: &str, fields: &Fields) -> Result<String>;

    /// Create a consumer group positioned at `start_id` (`0` = from the
    /// beginning, `$` = only new entries).
    ///
    /// Fails with `AppError::GroupExists` when the group is already there.
    async fn create_consumer_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        create_stream: bool,
    ) -> Result<()>;

    /// Read up to `count` never-delivered entries (`>`) for `consumer`,
    /// waiting at most `block` for one to arrive. A timeout yields an empty
    /// list.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledge an entry. Returns `false` when it was not pending.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<bool>;

    /// Transfer up to `count` pending entries idle for at least `min_idle`
    /// to `consumer`, scanning the pending list from `cursor`.
    async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> Result<AutoClaimBatch>;

    async fn pending_summary(&self, stream: &str, group: &str) -> Result<PendingSummary>;
}

/// Score-ordered queue. Members are unique per queue.
#[async_trait]
pub trait DelayStore: Send + Sync {
    async fn insert(&self, queue: &str, score: i64, value: &str) -> Result<()>;

    /// All members with `score <= max`, lowest score first.
    async fn range_by_score_up_to(&self, queue: &str, max: i64) -> Result<Vec<String>>;

    /// Remove `value` if present. Exactly one concurrent caller observes
    /// `true` for a given member.
    async fn remove_exact(&self, queue: &str, value: &str) -> Result<bool>;
}

/// Expiring key-value store used for mutual exclusion.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically create `key` unless it exists. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Unconditionally set `key`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

/// The three store handles a pipeline component may need.
#[derive(Clone)]
pub struct Stores {
    pub log: Arc<dyn LogStore>,
    pub delay: Arc<dyn DelayStore>,
    pub locks: Arc<dyn LockStore>,
}

impl Stores {
    /// Use one backend for all three contracts.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: LogStore + DelayStore + LockStore + 'static,
    {
        Self {
            log: store.clone(),
            delay: store.clone(),
            locks: store,
        }
    }
}
