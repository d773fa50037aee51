//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building
//! and the statements that create the tables.

use sea_query::{ColumnDef, Iden, Index, Table};
use sqlx::AnyPool;
use tracing::info;

use super::error::SqlContext;
use super::{Dialect, Result};

/// Current-state table: one row per live key.
#[derive(Iden, Clone, Copy)]
pub enum ResourceTable {
    #[iden = "resource"]
    Table,
    #[iden = "guid"]
    Guid,
    #[iden = "uid"]
    Uid,
    #[iden = "namespace"]
    Namespace,
    #[iden = "group"]
    Group,
    #[iden = "resource"]
    Resource,
    #[iden = "name"]
    Name,
    #[iden = "folder"]
    Folder,
    #[iden = "value"]
    Value,
    #[iden = "action"]
    Action,
    #[iden = "generation"]
    Generation,
    #[iden = "resource_version"]
    ResourceVersion,
    #[iden = "previous_resource_version"]
    PreviousResourceVersion,
}

/// Append-only history table: one row per write.
#[derive(Iden, Clone, Copy)]
pub enum HistoryTable {
    #[iden = "resource_history"]
    Table,
    #[iden = "guid"]
    Guid,
    #[iden = "uid"]
    Uid,
    #[iden = "namespace"]
    Namespace,
    #[iden = "group"]
    Group,
    #[iden = "resource"]
    Resource,
    #[iden = "name"]
    Name,
    #[iden = "folder"]
    Folder,
    #[iden = "value"]
    Value,
    #[iden = "action"]
    Action,
    #[iden = "generation"]
    Generation,
    #[iden = "resource_version"]
    ResourceVersion,
    #[iden = "previous_resource_version"]
    PreviousResourceVersion,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Last assigned resource version per bucket.
#[derive(Iden, Clone, Copy)]
pub enum ResourceVersionTable {
    #[iden = "resource_version"]
    Table,
    #[iden = "group"]
    Group,
    #[iden = "resource"]
    Resource,
    #[iden = "resource_version"]
    ResourceVersion,
}

/// Create tables and indexes if they do not exist.
pub async fn migrate(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    let statements = [
        dialect.build_schema(
            Table::create()
                .table(ResourceTable::Table)
                .if_not_exists()
                .col(ColumnDef::new(ResourceTable::Guid).string().not_null().primary_key())
                .col(ColumnDef::new(ResourceTable::Uid).string().not_null())
                .col(ColumnDef::new(ResourceTable::Namespace).string().not_null())
                .col(ColumnDef::new(ResourceTable::Group).string().not_null())
                .col(ColumnDef::new(ResourceTable::Resource).string().not_null())
                .col(ColumnDef::new(ResourceTable::Name).string().not_null())
                .col(ColumnDef::new(ResourceTable::Folder).string().not_null().default(""))
                .col(ColumnDef::new(ResourceTable::Value).blob())
                .col(ColumnDef::new(ResourceTable::Action).big_integer().not_null())
                .col(ColumnDef::new(ResourceTable::Generation).big_integer().not_null())
                .col(ColumnDef::new(ResourceTable::ResourceVersion).big_integer().not_null())
                .col(
                    ColumnDef::new(ResourceTable::PreviousResourceVersion)
                        .big_integer()
                        .not_null(),
                )
                .to_owned(),
        ),
        dialect.build_schema(
            Index::create()
                .if_not_exists()
                .name("uq_resource_key")
                .table(ResourceTable::Table)
                .col(ResourceTable::Namespace)
                .col(ResourceTable::Group)
                .col(ResourceTable::Resource)
                .col(ResourceTable::Name)
                .unique()
                .to_owned(),
        ),
        dialect.build_schema(
            Table::create()
                .table(HistoryTable::Table)
                .if_not_exists()
                .col(ColumnDef::new(HistoryTable::Guid).string().not_null().primary_key())
                .col(ColumnDef::new(HistoryTable::Uid).string().not_null())
                .col(ColumnDef::new(HistoryTable::Namespace).string().not_null())
                .col(ColumnDef::new(HistoryTable::Group).string().not_null())
                .col(ColumnDef::new(HistoryTable::Resource).string().not_null())
                .col(ColumnDef::new(HistoryTable::Name).string().not_null())
                .col(ColumnDef::new(HistoryTable::Folder).string().not_null().default(""))
                .col(ColumnDef::new(HistoryTable::Value).blob())
                .col(ColumnDef::new(HistoryTable::Action).big_integer().not_null())
                .col(ColumnDef::new(HistoryTable::Generation).big_integer().not_null())
                .col(ColumnDef::new(HistoryTable::ResourceVersion).big_integer().not_null())
                .col(
                    ColumnDef::new(HistoryTable::PreviousResourceVersion)
                        .big_integer()
                        .not_null(),
                )
                .col(ColumnDef::new(HistoryTable::UpdatedAt).big_integer().not_null())
                .to_owned(),
        ),
        dialect.build_schema(
            Index::create()
                .if_not_exists()
                .name("idx_resource_history_key")
                .table(HistoryTable::Table)
                .col(HistoryTable::Namespace)
                .col(HistoryTable::Group)
                .col(HistoryTable::Resource)
                .col(HistoryTable::Name)
                .col(HistoryTable::ResourceVersion)
                .to_owned(),
        ),
        dialect.build_schema(
            Index::create()
                .if_not_exists()
                .name("idx_resource_history_bucket_rv")
                .table(HistoryTable::Table)
                .col(HistoryTable::Group)
                .col(HistoryTable::Resource)
                .col(HistoryTable::ResourceVersion)
                .to_owned(),
        ),
        dialect.build_schema(
            Table::create()
                .table(ResourceVersionTable::Table)
                .if_not_exists()
                .col(ColumnDef::new(ResourceVersionTable::Group).string().not_null())
                .col(ColumnDef::new(ResourceVersionTable::Resource).string().not_null())
                .col(
                    ColumnDef::new(ResourceVersionTable::ResourceVersion)
                        .big_integer()
                        .not_null(),
                )
                .primary_key(
                    Index::create()
                        .col(ResourceVersionTable::Group)
                        .col(ResourceVersionTable::Resource),
                )
                .to_owned(),
        ),
    ];

    for sql in statements {
        sqlx::query(&sql)
            .execute(pool)
            .await
            .sql_context("create schema")?;
    }

    info!(dialect = dialect.name(), "Resource tables initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{count_rows, memory_pool};

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let pool = memory_pool().await;
        migrate(&pool, Dialect::Sqlite).await.unwrap();

        for table in ["resource", "resource_history", "resource_version"] {
            assert_eq!(count_rows(&pool, table, "1 = 1").await, 0);
        }
    }

    #[tokio::test]
    async fn test_resource_key_is_unique() {
        let pool = memory_pool().await;
        let insert = |guid: &str| {
            format!(
                "INSERT INTO resource (guid, uid, namespace, \"group\", resource, name, folder, value, \
                 action, generation, resource_version, previous_resource_version) \
                 VALUES ('{guid}', 'u', 'ns', 'g', 'r', 'n', '', NULL, 1, 1, 0, 0)"
            )
        };

        sqlx::query(&insert("a")).execute(&pool).await.unwrap();
        assert!(sqlx::query(&insert("b")).execute(&pool).await.is_err());
    }
}
