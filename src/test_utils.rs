//! Test utilities shared by unit tests.

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use crate::storage::{migrate, Dialect};

/// Single-connection in-memory SQLite pool with the schema applied.
///
/// One connection keeps every query on the same in-memory database.
pub async fn memory_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");

    migrate(&pool, Dialect::Sqlite)
        .await
        .expect("Failed to create schema");

    pool
}

/// Count rows of a table matching a raw WHERE clause.
pub async fn count_rows(pool: &AnyPool, table: &str, filter: &str) -> i64 {
    use sqlx::Row;

    let sql = format!("SELECT COUNT(*) AS n FROM {table} WHERE {filter}");
    let row = sqlx::query(&sql)
        .fetch_one(pool)
        .await
        .expect("count query failed");
    row.try_get::<i64, _>("n").expect("count column")
}

/// Backend over a fresh in-memory database with the background loops off.
///
/// The returned pool is the backend's own, for direct table inspection.
pub async fn test_backend() -> (crate::storage::Backend, AnyPool) {
    let mut config = crate::storage::BackendConfig::default();
    config.pruner.enabled = false;
    config.gc.enabled = false;
    test_backend_with(config).await
}

pub async fn test_backend_with(
    config: crate::storage::BackendConfig,
) -> (crate::storage::Backend, AnyPool) {
    let pool = memory_pool().await;
    let backend = crate::storage::Backend::new(pool.clone(), Dialect::Sqlite, config)
        .await
        .expect("Failed to start backend");
    (backend, pool)
}

/// JSON value carrying `metadata.labels`.
pub fn labeled(name: &str, labels: &[(&str, &str)]) -> Vec<u8> {
    let labels: serde_json::Map<String, serde_json::Value> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    serde_json::json!({"metadata": {"name": name, "labels": labels}})
        .to_string()
        .into_bytes()
}
