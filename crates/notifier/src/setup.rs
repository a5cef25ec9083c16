//! One-time stream and consumer group initialization.

use notistream_common::error::{AppError, Result};
use notistream_store::LogStore;

/// Create `group` on `stream` positioned at the start of the log, creating
/// the stream if needed. An existing group is left untouched.
///
/// Safe to call from every worker on startup.
pub async fn init_stream(log: &dyn LogStore, stream: &str, group: &str) -> Result<()> {
    match log.create_consumer_group(stream, group, "0", true).await {
        Ok(()) => {
            tracing::info!(stream, group, "Consumer group created");
            Ok(())
        }
        Err(AppError::GroupExists(_)) => {
            tracing::info!(stream, group, "Consumer group already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
