//! Retry delay policy.
//!
//! `delay(n) = min(base * 2^n, cap)`. No jitter is applied, so the due time
//! of successive retries of one event never moves backwards.

use std::time::Duration;

use notistream_common::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_ms: u64,
    cap_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
        Self {
            base_ms,
            cap_ms: cap_ms.max(base_ms),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )
    }

    /// Delay before the attempt following a failure at `retry_count`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}
