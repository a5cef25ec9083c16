use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Flat string field map carried by a log entry.
pub type Fields = BTreeMap<String, String>;

/// Reserved field names of the event wire form. Every other field of a log
/// entry belongs to the event payload.
pub mod field {
    pub const EVENT_ID: &str = "eventId";
    pub const EVENT_TYPE: &str = "eventType";
    pub const RETRY_COUNT: &str = "retryCount";
    pub const CREATED_AT: &str = "createdAt";

    pub const RESERVED: [&str; 4] = [EVENT_ID, EVENT_TYPE, RETRY_COUNT, CREATED_AT];
}

/// A notification event travelling through the pipeline.
///
/// Identity is `event_id`. Only `retry_count` ever changes, and only through
/// [`Event::next_attempt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: BTreeMap<String, String>,
    pub retry_count: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create a fresh event with a random id and `retry_count = 0`.
    pub fn new(event_type: impl Into<String>, payload: BTreeMap<String, String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            retry_count: 0,
            // Millisecond precision, matching the wire form.
            created_at: Utc
                .timestamp_millis_opt(Utc::now().timestamp_millis())
                .single()
                .unwrap_or_else(Utc::now),
        }
    }

    /// Copy of this event for the next delivery attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Encode into the flat string field set appended to a stream.
    ///
    /// Reserved fields are written last, so a payload key colliding with one
    /// of them cannot override the event's identity or retry count.
    pub fn to_fields(&self) -> Fields {
        let mut fields = self.payload.clone();
        fields.insert(field::EVENT_ID.to_string(), self.event_id.to_string());
        fields.insert(field::EVENT_TYPE.to_string(), self.event_type.clone());
        fields.insert(field::RETRY_COUNT.to_string(), self.retry_count.to_string());
        fields.insert(
            field::CREATED_AT.to_string(),
            self.created_at.timestamp_millis().to_string(),
        );
        fields
    }

    /// Decode from a stream entry's field set.
    ///
    /// A missing `retryCount` means the event was never retried, as produced
    /// by older publishers. Every other reserved field is mandatory.
    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let event_id = required(fields, field::EVENT_ID)?;
        let event_id = Uuid::parse_str(event_id)
            .map_err(|e| AppError::MalformedEntry(format!("invalid eventId '{event_id}': {e}")))?;

        let event_type = required(fields, field::EVENT_TYPE)?.to_string();

        let retry_count = match fields.get(field::RETRY_COUNT) {
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                AppError::MalformedEntry(format!("invalid retryCount '{raw}'"))
            })?,
            None => 0,
        };

        let created_raw = required(fields, field::CREATED_AT)?;
        let created_at = created_raw
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| {
                AppError::MalformedEntry(format!("invalid createdAt '{created_raw}'"))
            })?;

        let payload = fields
            .iter()
            .filter(|(key, _)| !field::RESERVED.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            event_id,
            event_type,
            payload,
            retry_count,
            created_at,
        })
    }
}

fn required<'a>(fields: &'a Fields, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| AppError::MalformedEntry(format!("missing field '{name}'")))
}

/// One record of an ordered log, as handed out by a consumer-group read or
/// a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: String,
    pub fields: Fields,
}

impl LogEntry {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn event(&self) -> Result<Event> {
        Event::from_fields(&self.fields)
    }
}

/// Result of one autoclaim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoClaimBatch {
    /// Cursor to resume scanning the pending list from; `0-0` once the scan
    /// wrapped around.
    pub next_cursor: String,
    pub entries: Vec<LogEntry>,
}

/// Summary of the entries delivered to a group but not yet acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub count: u64,
    pub min_id: Option<String>,
    pub max_id: Option<String>,
    pub consumers: BTreeMap<String, u64>,
}

/// A scheduled retry, stored in the delay queue scored by `due_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub due_at: DateTime<Utc>,
    pub event: Event,
}

impl RetryEntry {
    /// Sorted-set score: due time in epoch milliseconds.
    pub fn score(&self) -> i64 {
        self.due_at.timestamp_millis()
    }

    /// Serialized member stored in the delay queue. The due time is part of
    /// the value, so two retries of the same event never share a member.
    pub fn to_value(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_value(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }
}
