//! Versioned resource storage on a relational database.
//!
//! Writes are serialized per (group, resource) bucket by the
//! [`ResourceVersionManager`], which assigns every committed write a strictly
//! increasing resource version. The current state lives in the `resource`
//! table and every write is appended to `resource_history`, from which lists
//! at a past version, history, trash and the polling watch are served.

use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Executor};
use tracing::info;

use crate::config::StorageConfig;
use error::SqlContext;

pub mod backend;
pub mod continue_token;
pub mod dialect;
pub mod error;
pub mod gc;
pub mod list_iter;
pub mod pruner;
pub(crate) mod queries;
pub mod rvmanager;
pub mod schema;
pub mod types;
mod write;

pub use backend::{Backend, BackendConfig, DEFAULT_LIST_LIMIT};
pub use continue_token::ContinueToken;
pub use dialect::Dialect;
pub use error::{Result, StorageError};
pub use gc::{GarbageCollector, GcConfig};
pub use list_iter::ListIter;
pub use pruner::{DebounceGroup, HistoryPruner, PrunerConfig};
pub use rvmanager::{ResourceVersionManager, RvManagerConfig, RvManagerOptions, VersionedWrite};
pub use schema::migrate;
pub use types::{
    BucketKey, ListOptions, ListRequest, ListResponse, ListSource, ModifiedResource, Operator,
    ReadResponse, Requirement, ResourceKey, ResourceStats, ResourceWrapper, VersionMatch,
    WatchEventType, WriteEvent, WrittenEvent,
};

/// Open a connection pool for the configured database.
///
/// In-memory SQLite is pinned to one connection that never expires, since
/// every new connection would open an empty database. File-backed SQLite
/// connections wait `busy_timeout_ms` on a locked database before failing.
pub async fn connect(config: &StorageConfig) -> Result<(AnyPool, Dialect)> {
    let dialect = Dialect::from_url(&config.database_url)?;
    sqlx::any::install_default_drivers();

    let mut options = AnyPoolOptions::new()
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs.max(1)));
    options = if config.is_in_memory() {
        options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        options.max_connections(config.max_connections.max(1))
    };
    if dialect == Dialect::Sqlite {
        let pragma = format!("PRAGMA busy_timeout = {}", config.busy_timeout_ms);
        options = options.after_connect(move |conn, _meta| {
            let pragma = pragma.clone();
            Box::pin(async move {
                conn.execute(pragma.as_str()).await?;
                Ok(())
            })
        });
    }

    let pool = options
        .connect(&config.database_url)
        .await
        .sql_context("connect")?;

    info!(dialect = dialect.name(), "Storage: connected");
    Ok((pool, dialect))
}
