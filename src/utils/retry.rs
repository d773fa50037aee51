//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::storage::StorageError;

/// Backoff for database connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Determines if a connection failure is worth retrying.
///
/// Only database errors are retried. Configuration mistakes such as an
/// unsupported URL scheme never succeed on retry.
pub fn is_retryable_connect_error(err: &StorageError) -> bool {
    match err {
        StorageError::Database { source, .. } => !matches!(
            source.as_ref(),
            sqlx::Error::Configuration(_) | sqlx::Error::AnyDriverError(_)
        ),
        _ => false,
    }
}
