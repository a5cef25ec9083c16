use thiserror::Error;

/// Common error types used across the pipeline.
///
/// Every variant here is an infrastructure-level fault from the worker's
/// point of view: the entry being handled is left unacknowledged so it is
/// picked up again by the reclaimer. Business processing failures are not
/// represented here; processors report them through `anyhow`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    #[error("Consumer group already exists: {0}")]
    GroupExists(String),

    #[error("Retry budget exhausted for event {event_id} (retry_count = {retry_count})")]
    RetryExhausted { event_id: String, retry_count: u32 },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
