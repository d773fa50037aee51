//! Storage error taxonomy.

use std::sync::Arc;

use super::types::ResourceKey;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Cloneable so a single batch failure can be delivered to every writer that
/// was part of the batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// `previous_rv` no longer matches the stored version. Re-read and retry.
    #[error("Version conflict on {key}: expected resource version {expected}")]
    Conflict { key: ResourceKey, expected: i64 },

    #[error("Resource already exists: {key}")]
    AlreadyExists { key: ResourceKey },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error during {context}: {source}")]
    Database {
        context: String,
        #[source]
        source: Arc<sqlx::Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Buffer full")]
    BufferFull,

    #[error("Request cancelled")]
    Cancelled,
}

impl StorageError {
    /// True when the caller should re-read the object and retry with a fresh version.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, StorageError::BadRequest(_))
    }

    pub(crate) fn not_found_key(key: &ResourceKey) -> Self {
        StorageError::NotFound(key.to_string())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Database {
            context: "query".to_string(),
            source: Arc::new(e),
        }
    }
}

/// Attach the failing statement to a database error.
pub(crate) trait SqlContext<T> {
    fn sql_context(self, context: &str) -> Result<T>;
}

impl<T> SqlContext<T> for std::result::Result<T, sqlx::Error> {
    fn sql_context(self, context: &str) -> Result<T> {
        self.map_err(|e| StorageError::Database {
            context: context.to_string(),
            source: Arc::new(e),
        })
    }
}
