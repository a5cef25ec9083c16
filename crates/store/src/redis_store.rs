//! Redis-backed stores.
//!
//! - Log: Streams (`XADD`, `XGROUP CREATE`, `XREADGROUP`, `XACK`,
//!   `XAUTOCLAIM`, `XPENDING`)
//! - Delay: sorted set (`ZADD`, `ZRANGEBYSCORE`, `ZREM`)
//! - Locks: plain keys (`SET NX EX`, `EXISTS`, `DEL`, `SET EX`)
//!
//! `XAUTOCLAIM` replies are parsed in the Redis 7 three-element form.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamId, StreamPendingReply, StreamRangeReply, StreamReadOptions, StreamReadReply,
};

use notistream_common::error::{AppError, Result};
use notistream_common::types::{AutoClaimBatch, Fields, LogEntry, PendingSummary};

use crate::{DelayStore, LockStore, LogStore};

/// Store handle over a shared Redis connection manager.
///
/// Cloning is cheap; every call works on its own clone of the manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Open a connection manager for `redis_url`.
    ///
    /// The manager reconnects on its own after transient failures; an error
    /// here means the server could not be reached at all.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis");
        Ok(Self::new(conn))
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn to_entry(stream_id: StreamId) -> Result<LogEntry> {
    let mut fields = Fields::new();
    for (key, value) in stream_id.map.iter() {
        let value: String = redis::from_redis_value(value)?;
        fields.insert(key.clone(), value);
    }
    Ok(LogEntry::new(stream_id.id, fields))
}

#[async_trait]
impl LogStore for RedisStore {
    async fn append(&self, stream: &str, fields: &Fields) -> Result<String> {
        let mut conn = self.conn();
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();

        let id: String = conn.xadd(stream, "*", &items).await?;

        tracing::debug!(stream, entry_id = %id, "Appended stream entry");
        Ok(id)
    }

    async fn create_consumer_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        create_stream: bool,
    ) -> Result<()> {
        let mut conn = self.conn();

        let result: redis::RedisResult<()> = if create_stream {
            conn.xgroup_create_mkstream(stream, group, start_id).await
        } else {
            conn.xgroup_create(stream, group, start_id).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Err(AppError::GroupExists(format!(
                "{group} on {stream}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn();

        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // BLOCK 0 would wait forever.
        if !block.is_zero() {
            options = options.block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));
        }

        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &options).await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for stream_id in key.ids {
                entries.push(to_entry(stream_id)?);
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let acked: i64 = conn.xack(stream, group, &[entry_id]).await?;
        Ok(acked > 0)
    }

    async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> Result<AutoClaimBatch> {
        let mut conn = self.conn();

        // XAUTOCLAIM key group consumer min-idle-time start COUNT count
        // Reply: [next-cursor, [[id, [field, value, ...]], ...], [deleted-id, ...]]
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(to_millis(min_idle))
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let (Some(cursor_value), Some(claimed_value)) = (reply.first(), reply.get(1)) else {
            return Err(AppError::Store(format!(
                "unexpected XAUTOCLAIM reply with {} elements",
                reply.len()
            )));
        };

        let next_cursor: String = redis::from_redis_value(cursor_value)?;
        let claimed: StreamRangeReply = redis::from_redis_value(claimed_value)?;

        let entries = claimed
            .ids
            .into_iter()
            .map(to_entry)
            .collect::<Result<Vec<_>>>()?;

        Ok(AutoClaimBatch {
            next_cursor,
            entries,
        })
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> Result<PendingSummary> {
        let mut conn = self.conn();
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;

        match reply {
            StreamPendingReply::Empty => Ok(PendingSummary::default()),
            StreamPendingReply::Data(data) => Ok(PendingSummary {
                count: data.count as u64,
                min_id: Some(data.start_id),
                max_id: Some(data.end_id),
                consumers: data
                    .consumers
                    .into_iter()
                    .map(|consumer| (consumer.name, consumer.pending as u64))
                    .collect(),
            }),
        }
    }
}

#[async_trait]
impl DelayStore for RedisStore {
    async fn insert(&self, queue: &str, score: i64, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.zadd(queue, value, score).await?;
        Ok(())
    }

    async fn range_by_score_up_to(&self, queue: &str, max: i64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let values: Vec<String> = conn.zrangebyscore(queue, "-inf", max).await?;
        Ok(values)
    }

    async fn remove_exact(&self, queue: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.zrem(queue, value).await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();

        // SET key value NX EX ttl
        // Returns Some("OK") if the key was set, None if it already existed
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
