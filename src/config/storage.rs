//! Storage configuration types.

use serde::Deserialize;

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Connection URL. `sqlite:` and `postgres:` schemes are supported.
    pub database_url: String,
    /// Pool size. In-memory SQLite always uses a single connection.
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection.
    pub acquire_timeout_secs: u64,
    /// Milliseconds a SQLite connection waits on a locked database file.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
            busy_timeout_ms: 5000,
        }
    }
}

impl StorageConfig {
    /// Every connection to `sqlite::memory:` opens a separate database.
    pub fn is_in_memory(&self) -> bool {
        self.database_url.starts_with("sqlite:") && self.database_url.contains(":memory:")
    }
}
