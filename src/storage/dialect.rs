//! SQL dialect selection.
//!
//! Statements are built with sea-query and executed as plain strings through
//! the sqlx `Any` driver, so the dialect only has to pick the query builder and
//! the handful of expressions that differ between databases.

use sea_query::{PostgresQueryBuilder, QueryStatementWriter, SchemaStatementBuilder, SqliteQueryBuilder};

use super::{Result, StorageError};

/// Supported database dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Derive the dialect from a connection URL.
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Dialect::Postgres)
        } else {
            Err(StorageError::Internal(format!(
                "unsupported database url scheme: {}",
                url.split(':').next().unwrap_or_default()
            )))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        }
    }

    /// Render a SELECT/INSERT/UPDATE/DELETE statement.
    pub fn build<S: QueryStatementWriter>(&self, stmt: S) -> String {
        match self {
            Dialect::Sqlite => stmt.to_string(SqliteQueryBuilder),
            Dialect::Postgres => stmt.to_string(PostgresQueryBuilder),
        }
    }

    /// Render a CREATE TABLE/INDEX statement.
    pub fn build_schema<S: SchemaStatementBuilder>(&self, stmt: S) -> String {
        match self {
            Dialect::Sqlite => stmt.to_string(SqliteQueryBuilder),
            Dialect::Postgres => stmt.to_string(PostgresQueryBuilder),
        }
    }

    /// Database wall clock in microseconds since the Unix epoch.
    pub fn epoch_micros(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "CAST((julianday('now') - 2440587.5) * 86400000000.0 AS INTEGER)",
            Dialect::Postgres => "CAST(EXTRACT(EPOCH FROM clock_timestamp()) * 1000000 AS BIGINT)",
        }
    }

    /// SQLite serializes writers on the database lock instead of row locks.
    pub fn supports_row_lock(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Statement opening a write transaction.
    ///
    /// SQLite takes the write lock up front: a deferred transaction that read
    /// first fails with SQLITE_BUSY when another writer holds the lock.
    pub fn begin_write(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "BEGIN IMMEDIATE",
            Dialect::Postgres => "BEGIN",
        }
    }
}
