//! In-process stores with Redis semantics.
//!
//! Consumer groups track a delivery cursor plus a pending list with
//! per-entry owner and delivery instant, so idle-based claiming behaves like
//! `XAUTOCLAIM`. Time comes from `tokio::time::Instant`, which lets tests
//! drive idle thresholds and key expiry with a paused clock.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use notistream_common::error::{AppError, Result};
use notistream_common::types::{AutoClaimBatch, Fields, LogEntry, PendingSummary};

use crate::{DelayStore, LockStore, LogStore};

/// Upper bound used when a blocking read asks for an unrepresentable wait.
const MAX_BLOCK: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Highest sequence handed out by a `>` read.
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    last_seq: u64,
    entries: BTreeMap<u64, Fields>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug)]
struct KeyEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamState>,
    queues: HashMap<String, HashMap<String, i64>>,
    keys: HashMap<String, KeyEntry>,
}

impl State {
    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut StreamState> {
        match self.streams.get_mut(stream) {
            Some(state) if state.groups.contains_key(group) => Ok(state),
            _ => Err(no_group(stream, group)),
        }
    }

    fn live_key(&mut self, key: &str, now: Instant) -> Option<&KeyEntry> {
        if self
            .keys
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            self.keys.remove(key);
        }
        self.keys.get(key)
    }
}

fn no_group(stream: &str, group: &str) -> AppError {
    AppError::Store(format!(
        "NOGROUP No such key '{stream}' or consumer group '{group}'"
    ))
}

fn format_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

/// In-memory implementation of every store contract.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    appended: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry currently in `stream`, oldest first.
    pub async fn entries(&self, stream: &str) -> Vec<LogEntry> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(seq, fields)| LogEntry::new(format_id(*seq), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every `(score, member)` of `queue`, lowest score first.
    pub async fn queue_entries(&self, queue: &str) -> Vec<(i64, String)> {
        let state = self.state.lock().await;
        let mut members: Vec<(i64, String)> = state
            .queues
            .get(queue)
            .map(|q| q.iter().map(|(value, score)| (*score, value.clone())).collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Current value of a live key.
    pub async fn key_value(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        state
            .live_key(key, Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// How many times the pending entry `entry_id` has been delivered, if it
    /// is pending.
    pub async fn delivery_count(&self, stream: &str, group: &str, entry_id: &str) -> Option<u64> {
        let state = self.state.lock().await;
        let seq = parse_id(entry_id)?;
        state
            .streams
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&seq)
            .map(|pending| pending.delivery_count)
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(&self, stream: &str, fields: &Fields) -> Result<String> {
        let id = {
            let mut state = self.state.lock().await;
            let stream_state = state.streams.entry(stream.to_string()).or_default();
            stream_state.last_seq += 1;
            let seq = stream_state.last_seq;
            stream_state.entries.insert(seq, fields.clone());
            format_id(seq)
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_consumer_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        create_stream: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        if !state.streams.contains_key(stream) {
            if !create_stream {
                return Err(AppError::Store(
                    "ERR The XGROUP subcommand requires the key to exist".to_string(),
                ));
            }
            state.streams.insert(stream.to_string(), StreamState::default());
        }

        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Err(AppError::Internal(format!("stream {stream} vanished")));
        };

        if stream_state.groups.contains_key(group) {
            return Err(AppError::GroupExists(format!("{group} on {stream}")));
        }

        let last_delivered = match start_id {
            "$" => stream_state.last_seq,
            other => parse_id(other)
                .ok_or_else(|| AppError::Store(format!("ERR Invalid stream ID '{other}'")))?,
        };

        stream_state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block.min(MAX_BLOCK);

        loop {
            // Registered before checking, so an append racing with the check
            // still wakes this reader.
            let notified = self.appended.notified();

            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let StreamState {
                    entries, groups, ..
                } = state.group_mut(stream, group)?;
                let Some(group_state) = groups.get_mut(group) else {
                    return Err(no_group(stream, group));
                };

                let delivered: Vec<LogEntry> = entries
                    .range(group_state.last_delivered + 1..)
                    .take(count)
                    .map(|(seq, fields)| LogEntry::new(format_id(*seq), fields.clone()))
                    .collect();

                for entry in &delivered {
                    let seq = parse_id(&entry.id).unwrap_or_default();
                    group_state.last_delivered = group_state.last_delivered.max(seq);
                    group_state.pending.insert(
                        seq,
                        PendingEntry {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            delivery_count: 1,
                        },
                    );
                }

                if !delivered.is_empty() || block.is_zero() {
                    return Ok(delivered);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(seq) = parse_id(entry_id) else {
            return Ok(false);
        };

        Ok(state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&seq))
            .is_some())
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
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let start = parse_id(cursor).unwrap_or_default();

        let StreamState {
            entries, groups, ..
        } = state.group_mut(stream, group)?;
        let Some(group_state) = groups.get_mut(group) else {
            return Err(no_group(stream, group));
        };

        let candidates: Vec<u64> = group_state.pending.range(start..).map(|(seq, _)| *seq).collect();

        let mut claimed = Vec::new();
        let mut next_cursor = format_id(0);

        for seq in candidates {
            if claimed.len() >= count {
                next_cursor = format_id(seq);
                break;
            }

            let Some(fields) = entries.get(&seq) else {
                // Deleted from the stream: dropped from the pending list.
                group_state.pending.remove(&seq);
                continue;
            };

            let Some(pending) = group_state.pending.get_mut(&seq) else {
                continue;
            };

            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }

            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(LogEntry::new(format_id(seq), fields.clone()));
        }

        Ok(AutoClaimBatch {
            next_cursor,
            entries: claimed,
        })
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> Result<PendingSummary> {
        let mut state = self.state.lock().await;
        let stream_state = state.group_mut(stream, group)?;
        let Some(group_state) = stream_state.groups.get(group) else {
            return Err(no_group(stream, group));
        };

        let mut consumers = BTreeMap::new();
        for pending in group_state.pending.values() {
            *consumers.entry(pending.consumer.clone()).or_insert(0) += 1;
        }

        Ok(PendingSummary {
            count: group_state.pending.len() as u64,
            min_id: group_state.pending.keys().next().map(|seq| format_id(*seq)),
            max_id: group_state.pending.keys().next_back().map(|seq| format_id(*seq)),
            consumers,
        })
    }
}

#[async_trait]
impl DelayStore for MemoryStore {
    async fn insert(&self, queue: &str, score: i64, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .insert(value.to_string(), score);
        Ok(())
    }

    async fn range_by_score_up_to(&self, queue: &str, max: i64) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut due: Vec<(i64, &String)> = state
            .queues
            .get(queue)
            .map(|q| {
                q.iter()
                    .filter(|(_, score)| **score <= max)
                    .map(|(value, score)| (*score, value))
                    .collect()
            })
            .unwrap_or_default();
        due.sort();
        Ok(due.into_iter().map(|(_, value)| value.clone()).collect())
    }

    async fn remove_exact(&self, queue: &str, value: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .queues
            .get_mut(queue)
            .and_then(|q| q.remove(value))
            .is_some())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if state.live_key(key, now).is_some() {
            return Ok(false);
        }

        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.live_key(key, Instant::now()).is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.keys.remove(key);
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "notifications";
    const GROUP: &str = "workers";

    fn fields(event_id: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("eventId".to_string(), event_id.to_string());
        fields
    }

    async fn store_with_group() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_consumer_group(STREAM, GROUP, "0", true)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_group_twice_reports_exists() {
        let store = store_with_group().await;
        let err = store
            .create_consumer_group(STREAM, GROUP, "0", true)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::GroupExists(_)));
    }

    #[tokio::test]
    async fn test_create_group_without_stream_fails() {
        let store = MemoryStore::new();
        let err = store
            .create_consumer_group(STREAM, GROUP, "0", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
    }

    #[tokio::test]
    async fn test_read_group_delivers_each_entry_once() {
        let store = store_with_group().await;
        store.append(STREAM, &fields("a")).await.unwrap();
        store.append(STREAM, &fields("b")).await.unwrap();

        let first = store
            .read_group(GROUP, "c1", STREAM, 1, Duration::ZERO)
            .await
            .unwrap();
        let second = store
            .read_group(GROUP, "c2", STREAM, 10, Duration::ZERO)
            .await
            .unwrap();
        let third = store
            .read_group(GROUP, "c1", STREAM, 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].fields["eventId"], "a");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].fields["eventId"], "b");
        assert!(third.is_empty());

        let summary = store.pending_summary(STREAM, GROUP).await.unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.consumers["c1"], 1);
        assert_eq!(summary.consumers["c2"], 1);
        assert_eq!(summary.min_id.as_deref(), Some(first[0].id.as_str()));
        assert_eq!(summary.max_id.as_deref(), Some(second[0].id.as_str()));
    }

    #[tokio::test]
    async fn test_group_starting_at_tail_skips_history() {
        let store = MemoryStore::new();
        store.append(STREAM, &fields("old")).await.unwrap();
        store
            .create_consumer_group(STREAM, GROUP, "$", false)
            .await
            .unwrap();
        store.append(STREAM, &fields("new")).await.unwrap();

        let read = store
            .read_group(GROUP, "c1", STREAM, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].fields["eventId"], "new");
    }

    #[tokio::test]
    async fn test_read_group_without_group_fails() {
        let store = MemoryStore::new();
        store.append(STREAM, &fields("a")).await.unwrap();
        let err = store
            .read_group(GROUP, "c1", STREAM, 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOGROUP"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out_empty() {
        let store = store_with_group().await;
        let started = Instant::now();
        let read = store
            .read_group(GROUP, "c1", STREAM, 1, Duration::from_millis(5_000))
            .await
            .unwrap();
        assert!(read.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_wakes_on_append() {
        let store = std::sync::Arc::new(store_with_group().await);

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_group(GROUP, "c1", STREAM, 1, Duration::from_secs(60))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        store.append(STREAM, &fields("late")).await.unwrap();

        let read = reader.await.unwrap().unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].fields["eventId"], "late");
    }

    #[tokio::test]
    async fn test_ack_clears_pending() {
        let store = store_with_group().await;
        let id = store.append(STREAM, &fields("a")).await.unwrap();
        store
            .read_group(GROUP, "c1", STREAM, 1, Duration::ZERO)
            .await
            .unwrap();

        assert!(store.ack(STREAM, GROUP, &id).await.unwrap());
        assert!(!store.ack(STREAM, GROUP, &id).await.unwrap());
        assert_eq!(store.pending_summary(STREAM, GROUP).await.unwrap().count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoclaim_respects_idle_threshold() {
        let store = store_with_group().await;
        let id = store.append(STREAM, &fields("a")).await.unwrap();
        store
            .read_group(GROUP, "crashed", STREAM, 1, Duration::ZERO)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(9_999)).await;
        let early = store
            .autoclaim(STREAM, GROUP, "rescuer", Duration::from_secs(10), "0-0", 10)
            .await
            .unwrap();
        assert!(early.entries.is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        let batch = store
            .autoclaim(STREAM, GROUP, "rescuer", Duration::from_secs(10), "0-0", 10)
            .await
            .unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].id, id);
        assert_eq!(batch.next_cursor, "0-0");
        assert_eq!(store.delivery_count(STREAM, GROUP, &id).await, Some(2));

        let summary = store.pending_summary(STREAM, GROUP).await.unwrap();
        assert_eq!(summary.consumers.get("rescuer"), Some(&1));
        assert_eq!(summary.consumers.get("crashed"), None);

        // Claiming resets the idle clock.
        let again = store
            .autoclaim(STREAM, GROUP, "other", Duration::from_secs(10), "0-0", 10)
            .await
            .unwrap();
        assert!(again.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoclaim_is_bounded_by_count() {
        let store = store_with_group().await;
        for i in 0..5 {
            store.append(STREAM, &fields(&i.to_string())).await.unwrap();
        }
        store
            .read_group(GROUP, "crashed", STREAM, 5, Duration::ZERO)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let batch = store
            .autoclaim(STREAM, GROUP, "rescuer", Duration::from_secs(10), "0-0", 2)
            .await
            .unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.next_cursor, "3-0");
    }

    #[tokio::test]
    async fn test_delay_queue_orders_by_score_and_removes_once() {
        let store = MemoryStore::new();
        store.insert("retry", 300, "late").await.unwrap();
        store.insert("retry", 100, "early").await.unwrap();
        store.insert("retry", 200, "middle").await.unwrap();

        let due = store.range_by_score_up_to("retry", 200).await.unwrap();
        assert_eq!(due, vec!["early".to_string(), "middle".to_string()]);

        assert!(store.remove_exact("retry", "early").await.unwrap());
        assert!(!store.remove_exact("retry", "early").await.unwrap());
        assert_eq!(store.queue_entries("retry").await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_and_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_if_absent("processing:1", "w1", ttl).await.unwrap());
        assert!(!store.set_if_absent("processing:1", "w2", ttl).await.unwrap());
        assert_eq!(store.key_value("processing:1").await.as_deref(), Some("w1"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!store.exists("processing:1").await.unwrap());
        assert!(store.set_if_absent("processing:1", "w2", ttl).await.unwrap());

        store.delete("processing:1").await.unwrap();
        assert!(!store.exists("processing:1").await.unwrap());

        store.set("processed:1", "1", ttl).await.unwrap();
        store.set("processed:1", "1", ttl).await.unwrap();
        assert!(store.exists("processed:1").await.unwrap());
    }
}
