use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string
    pub redis_url: String,

    /// Notification stream consumed by the worker pool
    pub stream_name: String,

    /// Consumer group shared by every worker
    pub group_name: String,

    /// This worker's consumer name inside the group
    pub consumer_name: String,

    /// Dead-letter stream for events that exhausted their retries
    pub dlq_stream: String,

    /// Sorted set holding scheduled retries, scored by due time (ms)
    pub retry_queue: String,

    /// Retry attempts before an event is dead-lettered (default: 3)
    pub max_retries: u32,

    /// Idle time after which a pending entry may be reclaimed (default: 10000)
    pub min_idle_time_ms: u64,

    /// Maximum entries claimed per reclaim pass (default: 10)
    pub reclaim_batch_size: usize,

    /// Maximum new entries per blocking read (default: 1)
    pub read_batch_size: usize,

    /// Blocking read timeout in milliseconds (default: 5000)
    pub block_timeout_ms: u64,

    /// First retry delay in milliseconds, doubled per attempt (default: 1000)
    pub backoff_base_ms: u64,

    /// Upper bound on any retry delay in milliseconds (default: 300000)
    pub backoff_cap_ms: u64,

    /// Retry promoter polling period in milliseconds (default: 1000)
    pub promoter_poll_interval_ms: u64,

    /// Pause after an infrastructure error before the next iteration (default: 1000)
    pub worker_error_backoff_ms: u64,

    /// TTL of the `processing:{eventId}` lock in seconds (default: 86400)
    pub lock_ttl_secs: u64,

    /// TTL of the `processed:{eventId}` marker in seconds (default: 86400)
    pub processed_ttl_secs: u64,

    /// Webhook endpoint notifications are POSTed to; logging only when unset
    pub webhook_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "notifications".to_string(),
            group_name: "notification-workers".to_string(),
            consumer_name: "worker-1".to_string(),
            dlq_stream: "notifications:dlq".to_string(),
            retry_queue: "notifications:retry".to_string(),
            max_retries: 3,
            min_idle_time_ms: 10_000,
            reclaim_batch_size: 10,
            read_batch_size: 1,
            block_timeout_ms: 5_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            promoter_poll_interval_ms: 1_000,
            worker_error_backoff_ms: 1_000,
            lock_ttl_secs: 86_400,
            processed_ttl_secs: 86_400,
            webhook_url: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let config = Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("NOTIFY_STREAM").unwrap_or(defaults.stream_name),
            group_name: std::env::var("NOTIFY_GROUP").unwrap_or(defaults.group_name),
            consumer_name: std::env::var("NOTIFY_CONSUMER").unwrap_or(defaults.consumer_name),
            dlq_stream: std::env::var("NOTIFY_DLQ_STREAM").unwrap_or(defaults.dlq_stream),
            retry_queue: std::env::var("NOTIFY_RETRY_QUEUE").unwrap_or(defaults.retry_queue),
            max_retries: parse_var("MAX_RETRIES", defaults.max_retries)?,
            min_idle_time_ms: parse_var("MIN_IDLE_TIME_MS", defaults.min_idle_time_ms)?,
            reclaim_batch_size: parse_var("RECLAIM_BATCH_SIZE", defaults.reclaim_batch_size)?,
            read_batch_size: parse_var("READ_BATCH_SIZE", defaults.read_batch_size)?,
            block_timeout_ms: parse_var("BLOCK_TIMEOUT_MS", defaults.block_timeout_ms)?,
            backoff_base_ms: parse_var("BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_cap_ms: parse_var("BACKOFF_CAP_MS", defaults.backoff_cap_ms)?,
            promoter_poll_interval_ms: parse_var(
                "PROMOTER_POLL_INTERVAL_MS",
                defaults.promoter_poll_interval_ms,
            )?,
            worker_error_backoff_ms: parse_var(
                "WORKER_ERROR_BACKOFF_MS",
                defaults.worker_error_backoff_ms,
            )?,
            lock_ttl_secs: parse_var("LOCK_TTL_SECS", defaults.lock_ttl_secs)?,
            processed_ttl_secs: parse_var("PROCESSED_TTL_SECS", defaults.processed_ttl_secs)?,
            webhook_url: std::env::var("NOTIFY_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_batch_size == 0 {
            anyhow::bail!("READ_BATCH_SIZE must be at least 1");
        }
        if self.reclaim_batch_size == 0 {
            anyhow::bail!("RECLAIM_BATCH_SIZE must be at least 1");
        }
        // A zero block turns the consumer loop into a busy poll.
        if self.block_timeout_ms == 0 {
            anyhow::bail!("BLOCK_TIMEOUT_MS must be at least 1");
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            anyhow::bail!("BACKOFF_CAP_MS must not be lower than BACKOFF_BASE_MS");
        }
        if self.stream_name == self.dlq_stream {
            anyhow::bail!("NOTIFY_DLQ_STREAM must differ from NOTIFY_STREAM");
        }
        Ok(())
    }

    pub fn min_idle_time(&self) -> Duration {
        Duration::from_millis(self.min_idle_time_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn promoter_poll_interval(&self) -> Duration {
        Duration::from_millis(self.promoter_poll_interval_ms)
    }

    pub fn worker_error_backoff(&self) -> Duration {
        Duration::from_millis(self.worker_error_backoff_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn processed_ttl(&self) -> Duration {
        Duration::from_secs(self.processed_ttl_secs)
    }
}

/// Read `key` and parse it, falling back to `default` when unset.
fn parse_var<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.min_idle_time(), Duration::from_secs(10));
        assert_eq!(config.reclaim_batch_size, 10);
        assert_eq!(config.read_batch_size, 1);
        assert_eq!(config.block_timeout(), Duration::from_secs(5));
        assert_eq!(config.lock_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.processed_ttl(), Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = AppConfig {
            backoff_base_ms: 5_000,
            backoff_cap_ms: 1_000,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_block_timeout() {
        let config = AppConfig {
            block_timeout_ms: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_dlq_on_main_stream() {
        let config = AppConfig {
            dlq_stream: "notifications".to_string(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_var_falls_back_when_unset() {
        let value: u64 = parse_var("NOTISTREAM_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
