//! Delivery-reliability layer for the notification stream.
//!
//! Workers consume the notification stream through a shared consumer group
//! and deliver each event through an injected processor:
//! - Idempotent processing (`processing:` lock + `processed:` marker)
//! - Reclaiming of entries left pending by crashed or stalled workers
//! - Retry with exponential backoff through a delay queue
//! - Dead letter stream for permanently failed notifications

pub mod backoff;
pub mod dlq;
pub mod idempotency;
pub mod processor;
pub mod producer;
pub mod promoter;
pub mod reclaimer;
pub mod retry;
pub mod setup;
pub mod worker;
