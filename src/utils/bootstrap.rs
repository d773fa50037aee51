//! Bootstrap utilities for the unistore binary.

use std::time::Duration;

use backon::Retryable;
use sqlx::AnyPool;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{StorageConfig, LOG_ENV_VAR};
use crate::storage::{self, Dialect, Result, StorageError};
use crate::utils::retry::{connection_backoff, is_retryable_connect_error};

/// Initialize tracing with the UNISTORE_LOG environment variable.
///
/// Defaults to "info" level if UNISTORE_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to the configured database, retrying transient failures with
/// exponential backoff.
pub async fn connect_with_retry(config: &StorageConfig) -> Result<(AnyPool, Dialect)> {
    let pool = (|| storage::connect(config))
        .retry(connection_backoff())
        .when(is_retryable_connect_error)
        .notify(|err: &StorageError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Database connection failed, retrying");
        })
        .await?;
    info!(dialect = pool.1.name(), "Connected to database");
    Ok(pool)
}
