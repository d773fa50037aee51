//! Row-level statements shared by the write path, readers and background loops.

use sea_query::{Alias, Expr, Order, Query, SelectStatement, SimpleExpr};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Row};

use super::error::SqlContext;
use super::schema::{HistoryTable, ResourceTable, ResourceVersionTable};
use super::types::{Action, BucketKey, ResourceKey, WrittenEvent};
use super::{Dialect, Result, StorageError};

/// Column values written for one event.
pub(crate) struct RowData<'a> {
    pub guid: &'a str,
    pub uid: &'a str,
    pub key: &'a ResourceKey,
    pub folder: &'a str,
    pub value: &'a [u8],
    pub action: Action,
    pub generation: i64,
    pub previous_rv: i64,
}

/// Identity and version of a live row.
#[derive(Debug, Clone)]
pub(crate) struct LiveRow {
    pub guid: String,
    pub uid: String,
    pub value: Vec<u8>,
    pub resource_version: i64,
}

/// A decoded history row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HistoryRow {
    pub key: ResourceKey,
    pub guid: String,
    pub uid: String,
    pub folder: String,
    pub value: Vec<u8>,
    pub action: Action,
    pub generation: i64,
    pub resource_version: i64,
    pub previous_rv: i64,
}

impl HistoryRow {
    pub(crate) fn into_written_event(self) -> WrittenEvent {
        WrittenEvent {
            event_type: self.action.into(),
            key: self.key,
            value: self.value,
            previous_rv: self.previous_rv,
            folder: self.folder,
            generation: self.generation,
            resource_version: self.resource_version,
        }
    }
}

/// Current wall clock in microseconds, stored as the history write timestamp.
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Select every history column needed to build a [`HistoryRow`].
pub(crate) fn select_history_columns(stmt: &mut SelectStatement) -> &mut SelectStatement {
    stmt.columns([
        (HistoryTable::Table, HistoryTable::Guid),
        (HistoryTable::Table, HistoryTable::Uid),
        (HistoryTable::Table, HistoryTable::Namespace),
        (HistoryTable::Table, HistoryTable::Group),
        (HistoryTable::Table, HistoryTable::Resource),
        (HistoryTable::Table, HistoryTable::Name),
        (HistoryTable::Table, HistoryTable::Folder),
        (HistoryTable::Table, HistoryTable::Value),
        (HistoryTable::Table, HistoryTable::Action),
        (HistoryTable::Table, HistoryTable::Generation),
        (HistoryTable::Table, HistoryTable::ResourceVersion),
        (HistoryTable::Table, HistoryTable::PreviousResourceVersion),
    ])
}

/// Select the current-state columns decoded by [`decode_history_row`].
pub(crate) fn select_resource_columns(stmt: &mut SelectStatement) -> &mut SelectStatement {
    stmt.columns([
        (ResourceTable::Table, ResourceTable::Guid),
        (ResourceTable::Table, ResourceTable::Uid),
        (ResourceTable::Table, ResourceTable::Namespace),
        (ResourceTable::Table, ResourceTable::Group),
        (ResourceTable::Table, ResourceTable::Resource),
        (ResourceTable::Table, ResourceTable::Name),
        (ResourceTable::Table, ResourceTable::Folder),
        (ResourceTable::Table, ResourceTable::Value),
        (ResourceTable::Table, ResourceTable::Action),
        (ResourceTable::Table, ResourceTable::Generation),
        (ResourceTable::Table, ResourceTable::ResourceVersion),
        (ResourceTable::Table, ResourceTable::PreviousResourceVersion),
    ])
}

/// Correlated `EXISTS` over history rows of the same key as the outer
/// `resource_history` row with a higher version.
///
/// `upper` bounds the newer rows considered; `action` restricts them.
pub(crate) fn newer_history_exists(upper: Option<i64>, action: Option<Action>) -> SimpleExpr {
    let newer = Alias::new("newer");
    let mut sub = Query::select();
    sub.expr(Expr::val(1))
        .from_as(HistoryTable::Table, newer.clone());
    for column in [
        HistoryTable::Namespace,
        HistoryTable::Group,
        HistoryTable::Resource,
        HistoryTable::Name,
    ] {
        sub.and_where(Expr::col((newer.clone(), column)).equals((HistoryTable::Table, column)));
    }
    sub.and_where(
        Expr::col((newer.clone(), HistoryTable::ResourceVersion))
            .gt(Expr::col((HistoryTable::Table, HistoryTable::ResourceVersion))),
    );
    if let Some(upper) = upper {
        sub.and_where(Expr::col((newer.clone(), HistoryTable::ResourceVersion)).lte(upper));
    }
    if let Some(action) = action {
        sub.and_where(Expr::col((newer, HistoryTable::Action)).eq(action.as_i64()));
    }
    Expr::exists(sub)
}

/// Correlated `EXISTS` over a live row for the key of the outer history row.
pub(crate) fn live_row_exists() -> SimpleExpr {
    let mut sub = Query::select();
    sub.expr(Expr::val(1)).from(ResourceTable::Table);
    for (live, history) in [
        (ResourceTable::Namespace, HistoryTable::Namespace),
        (ResourceTable::Group, HistoryTable::Group),
        (ResourceTable::Resource, HistoryTable::Resource),
        (ResourceTable::Name, HistoryTable::Name),
    ] {
        sub.and_where(Expr::col((ResourceTable::Table, live)).equals((HistoryTable::Table, history)));
    }
    Expr::exists(sub)
}

/// Decode a row selected with [`select_history_columns`] or
/// [`select_resource_columns`].
pub(crate) fn decode_history_row(row: &AnyRow) -> Result<HistoryRow> {
    let action: i64 = row.try_get("action").sql_context("decode action")?;
    let action = Action::from_i64(action)
        .ok_or_else(|| StorageError::Internal(format!("unknown action {action}")))?;
    let value: Option<Vec<u8>> = row.try_get("value").sql_context("decode value")?;

    Ok(HistoryRow {
        key: ResourceKey {
            namespace: row.try_get("namespace").sql_context("decode namespace")?,
            group: row.try_get("group").sql_context("decode group")?,
            resource: row.try_get("resource").sql_context("decode resource")?,
            name: row.try_get("name").sql_context("decode name")?,
        },
        guid: row.try_get("guid").sql_context("decode guid")?,
        uid: row.try_get("uid").sql_context("decode uid")?,
        folder: row.try_get("folder").sql_context("decode folder")?,
        value: value.unwrap_or_default(),
        action,
        generation: row.try_get("generation").sql_context("decode generation")?,
        resource_version: row
            .try_get("resource_version")
            .sql_context("decode resource_version")?,
        previous_rv: row
            .try_get("previous_resource_version")
            .sql_context("decode previous_resource_version")?,
    })
}

pub(crate) async fn insert_resource(
    conn: &mut AnyConnection,
    dialect: Dialect,
    row: &RowData<'_>,
) -> Result<()> {
    let stmt = Query::insert()
        .into_table(ResourceTable::Table)
        .columns([
            ResourceTable::Guid,
            ResourceTable::Uid,
            ResourceTable::Namespace,
            ResourceTable::Group,
            ResourceTable::Resource,
            ResourceTable::Name,
            ResourceTable::Folder,
            ResourceTable::Value,
            ResourceTable::Action,
            ResourceTable::Generation,
            ResourceTable::ResourceVersion,
            ResourceTable::PreviousResourceVersion,
        ])
        .values_panic([
            row.guid.into(),
            row.uid.into(),
            row.key.namespace.as_str().into(),
            row.key.group.as_str().into(),
            row.key.resource.as_str().into(),
            row.key.name.as_str().into(),
            row.folder.into(),
            row.value.to_vec().into(),
            row.action.as_i64().into(),
            row.generation.into(),
            0i64.into(),
            row.previous_rv.into(),
        ])
        .to_owned();

    match sqlx::query(&dialect.build(stmt)).execute(&mut *conn).await {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(StorageError::AlreadyExists {
                key: row.key.clone(),
            })
        }
        Err(e) => Err::<(), _>(e).sql_context("insert resource"),
    }
}

pub(crate) async fn insert_history(
    conn: &mut AnyConnection,
    dialect: Dialect,
    row: &RowData<'_>,
    updated_at: i64,
) -> Result<()> {
    let stmt = Query::insert()
        .into_table(HistoryTable::Table)
        .columns([
            HistoryTable::Guid,
            HistoryTable::Uid,
            HistoryTable::Namespace,
            HistoryTable::Group,
            HistoryTable::Resource,
            HistoryTable::Name,
            HistoryTable::Folder,
            HistoryTable::Value,
            HistoryTable::Action,
            HistoryTable::Generation,
            HistoryTable::ResourceVersion,
            HistoryTable::PreviousResourceVersion,
            HistoryTable::UpdatedAt,
        ])
        .values_panic([
            row.guid.into(),
            row.uid.into(),
            row.key.namespace.as_str().into(),
            row.key.group.as_str().into(),
            row.key.resource.as_str().into(),
            row.key.name.as_str().into(),
            row.folder.into(),
            row.value.to_vec().into(),
            row.action.as_i64().into(),
            row.generation.into(),
            0i64.into(),
            row.previous_rv.into(),
            updated_at.into(),
        ])
        .to_owned();

    sqlx::query(&dialect.build(stmt))
        .execute(&mut *conn)
        .await
        .sql_context("insert resource_history")?;
    Ok(())
}

pub(crate) async fn read_live(
    conn: &mut AnyConnection,
    dialect: Dialect,
    key: &ResourceKey,
) -> Result<Option<LiveRow>> {
    let stmt = Query::select()
        .columns([
            ResourceTable::Guid,
            ResourceTable::Uid,
            ResourceTable::Value,
            ResourceTable::ResourceVersion,
        ])
        .from(ResourceTable::Table)
        .and_where(Expr::col(ResourceTable::Namespace).eq(key.namespace.as_str()))
        .and_where(Expr::col(ResourceTable::Group).eq(key.group.as_str()))
        .and_where(Expr::col(ResourceTable::Resource).eq(key.resource.as_str()))
        .and_where(Expr::col(ResourceTable::Name).eq(key.name.as_str()))
        .to_owned();

    let row = sqlx::query(&dialect.build(stmt))
        .fetch_optional(&mut *conn)
        .await
        .sql_context("read resource")?;

    match row {
        Some(row) => Ok(Some(LiveRow {
            guid: row.try_get("guid").sql_context("decode guid")?,
            uid: row.try_get("uid").sql_context("decode uid")?,
            value: row
                .try_get::<Option<Vec<u8>>, _>("value")
                .sql_context("decode value")?
                .unwrap_or_default(),
            resource_version: row
                .try_get("resource_version")
                .sql_context("decode resource_version")?,
        })),
        None => Ok(None),
    }
}

/// Replace the live row in place. `expected_rv == 0` skips the version guard.
pub(crate) async fn update_resource(
    conn: &mut AnyConnection,
    dialect: Dialect,
    row: &RowData<'_>,
    expected_rv: i64,
) -> Result<u64> {
    let sql = {
        let mut stmt = Query::update();
        stmt.table(ResourceTable::Table)
            .value(ResourceTable::Guid, row.guid)
            .value(ResourceTable::Folder, row.folder)
            .value(ResourceTable::Value, row.value.to_vec())
            .value(ResourceTable::Action, row.action.as_i64())
            .value(ResourceTable::Generation, row.generation)
            .value(ResourceTable::PreviousResourceVersion, row.previous_rv)
            .value(ResourceTable::ResourceVersion, 0i64)
            .and_where(Expr::col(ResourceTable::Namespace).eq(row.key.namespace.as_str()))
            .and_where(Expr::col(ResourceTable::Group).eq(row.key.group.as_str()))
            .and_where(Expr::col(ResourceTable::Resource).eq(row.key.resource.as_str()))
            .and_where(Expr::col(ResourceTable::Name).eq(row.key.name.as_str()));
        if expected_rv > 0 {
            stmt.and_where(Expr::col(ResourceTable::ResourceVersion).eq(expected_rv));
        }
        dialect.build(stmt)
    };

    let result = sqlx::query(&sql)
        .execute(&mut *conn)
        .await
        .sql_context("update resource")?;
    Ok(result.rows_affected())
}

/// Remove the live row. `expected_rv == 0` skips the version guard.
pub(crate) async fn delete_resource(
    conn: &mut AnyConnection,
    dialect: Dialect,
    key: &ResourceKey,
    expected_rv: i64,
) -> Result<u64> {
    let sql = {
        let mut stmt = Query::delete();
        stmt.from_table(ResourceTable::Table)
            .and_where(Expr::col(ResourceTable::Namespace).eq(key.namespace.as_str()))
            .and_where(Expr::col(ResourceTable::Group).eq(key.group.as_str()))
            .and_where(Expr::col(ResourceTable::Resource).eq(key.resource.as_str()))
            .and_where(Expr::col(ResourceTable::Name).eq(key.name.as_str()));
        if expected_rv > 0 {
            stmt.and_where(Expr::col(ResourceTable::ResourceVersion).eq(expected_rv));
        }
        dialect.build(stmt)
    };

    let result = sqlx::query(&sql)
        .execute(&mut *conn)
        .await
        .sql_context("delete resource")?;
    Ok(result.rows_affected())
}

/// Last committed version of a bucket, 0 when nothing was written yet.
pub(crate) async fn read_bucket_rv(
    conn: &mut AnyConnection,
    dialect: Dialect,
    bucket: &BucketKey,
) -> Result<i64> {
    let stmt = Query::select()
        .column(ResourceVersionTable::ResourceVersion)
        .from(ResourceVersionTable::Table)
        .and_where(Expr::col(ResourceVersionTable::Group).eq(bucket.group.as_str()))
        .and_where(Expr::col(ResourceVersionTable::Resource).eq(bucket.resource.as_str()))
        .to_owned();

    let row = sqlx::query(&dialect.build(stmt))
        .fetch_optional(&mut *conn)
        .await
        .sql_context("read resource_version")?;

    match row {
        Some(row) => row
            .try_get("resource_version")
            .sql_context("decode resource_version"),
        None => Ok(0),
    }
}

/// Last committed version of every bucket.
pub(crate) async fn list_bucket_rvs(
    conn: &mut AnyConnection,
    dialect: Dialect,
) -> Result<Vec<(BucketKey, i64)>> {
    let stmt = Query::select()
        .columns([
            ResourceVersionTable::Group,
            ResourceVersionTable::Resource,
            ResourceVersionTable::ResourceVersion,
        ])
        .from(ResourceVersionTable::Table)
        .order_by(ResourceVersionTable::Group, Order::Asc)
        .order_by(ResourceVersionTable::Resource, Order::Asc)
        .to_owned();

    let rows = sqlx::query(&dialect.build(stmt))
        .fetch_all(&mut *conn)
        .await
        .sql_context("list resource_version")?;

    let mut buckets = Vec::with_capacity(rows.len());
    for row in rows {
        let group: String = row.try_get("group").sql_context("decode group")?;
        let resource: String = row.try_get("resource").sql_context("decode resource")?;
        let rv: i64 = row
            .try_get("resource_version")
            .sql_context("decode resource_version")?;
        buckets.push((BucketKey::new(group, resource), rv));
    }
    Ok(buckets)
}

/// History rows of a bucket committed after `since`, in ascending version order.
pub(crate) async fn history_since(
    conn: &mut AnyConnection,
    dialect: Dialect,
    bucket: &BucketKey,
    since: i64,
    limit: u64,
) -> Result<Vec<HistoryRow>> {
    let sql = {
        let mut stmt = Query::select();
        select_history_columns(&mut stmt)
            .from(HistoryTable::Table)
            .and_where(Expr::col(HistoryTable::Group).eq(bucket.group.as_str()))
            .and_where(Expr::col(HistoryTable::Resource).eq(bucket.resource.as_str()))
            .and_where(Expr::col(HistoryTable::ResourceVersion).gt(since))
            .order_by(HistoryTable::ResourceVersion, Order::Asc)
            .limit(limit);
        dialect.build(stmt)
    };

    let rows = sqlx::query(&sql)
        .fetch_all(&mut *conn)
        .await
        .sql_context("poll resource_history")?;

    rows.iter().map(decode_history_row).collect()
}

/// Newest history row of `key` at or below `rv`.
pub(crate) async fn read_history_at(
    conn: &mut AnyConnection,
    dialect: Dialect,
    key: &ResourceKey,
    rv: i64,
) -> Result<Option<HistoryRow>> {
    let mut stmt = Query::select();
    select_history_columns(&mut stmt)
        .from(HistoryTable::Table)
        .and_where(Expr::col(HistoryTable::Namespace).eq(key.namespace.as_str()))
        .and_where(Expr::col(HistoryTable::Group).eq(key.group.as_str()))
        .and_where(Expr::col(HistoryTable::Resource).eq(key.resource.as_str()))
        .and_where(Expr::col(HistoryTable::Name).eq(key.name.as_str()))
        .and_where(Expr::col(HistoryTable::ResourceVersion).lte(rv))
        .and_where(Expr::col(HistoryTable::ResourceVersion).gt(0))
        .order_by(HistoryTable::ResourceVersion, Order::Desc)
        .limit(1);

    let row = sqlx::query(&dialect.build(stmt))
        .fetch_optional(&mut *conn)
        .await
        .sql_context("read resource_history")?;
    row.as_ref().map(decode_history_row).transpose()
}

/// Current-state row of `key`.
pub(crate) async fn read_resource_row(
    conn: &mut AnyConnection,
    dialect: Dialect,
    key: &ResourceKey,
) -> Result<Option<HistoryRow>> {
    let mut stmt = Query::select();
    select_resource_columns(&mut stmt)
        .from(ResourceTable::Table)
        .and_where(Expr::col(ResourceTable::Namespace).eq(key.namespace.as_str()))
        .and_where(Expr::col(ResourceTable::Group).eq(key.group.as_str()))
        .and_where(Expr::col(ResourceTable::Resource).eq(key.resource.as_str()))
        .and_where(Expr::col(ResourceTable::Name).eq(key.name.as_str()));

    let row = sqlx::query(&dialect.build(stmt))
        .fetch_optional(&mut *conn)
        .await
        .sql_context("read resource")?;
    row.as_ref().map(decode_history_row).transpose()
}

/// Latest history row per name of a bucket with a version above `since`.
pub(crate) async fn modified_since(
    conn: &mut AnyConnection,
    dialect: Dialect,
    namespace: &str,
    bucket: &BucketKey,
    since: i64,
) -> Result<Vec<HistoryRow>> {
    let mut stmt = Query::select();
    select_history_columns(&mut stmt)
        .from(HistoryTable::Table)
        .and_where(Expr::col((HistoryTable::Table, HistoryTable::Group)).eq(bucket.group.as_str()))
        .and_where(
            Expr::col((HistoryTable::Table, HistoryTable::Resource)).eq(bucket.resource.as_str()),
        )
        .and_where(Expr::col((HistoryTable::Table, HistoryTable::ResourceVersion)).gt(since))
        .and_where(newer_history_exists(None, None).not())
        .order_by((HistoryTable::Table, HistoryTable::Namespace), Order::Asc)
        .order_by((HistoryTable::Table, HistoryTable::Name), Order::Asc);
    if !namespace.is_empty() {
        stmt.and_where(Expr::col((HistoryTable::Table, HistoryTable::Namespace)).eq(namespace));
    }

    let rows = sqlx::query(&dialect.build(stmt))
        .fetch_all(&mut *conn)
        .await
        .sql_context("list modified resources")?;
    rows.iter().map(decode_history_row).collect()
}

/// Live row counts per (namespace, group, resource) with at least `min_count` rows.
pub(crate) async fn count_resources(
    conn: &mut AnyConnection,
    dialect: Dialect,
    namespace: &str,
    min_count: i64,
) -> Result<Vec<(String, BucketKey, i64)>> {
    let count = Alias::new("count");
    let mut stmt = Query::select();
    stmt.columns([
        ResourceTable::Namespace,
        ResourceTable::Group,
        ResourceTable::Resource,
    ])
    .expr_as(Expr::col(ResourceTable::Guid).count(), count)
    .from(ResourceTable::Table)
    .group_by_columns([
        ResourceTable::Namespace,
        ResourceTable::Group,
        ResourceTable::Resource,
    ])
    .and_having(Expr::expr(Expr::col(ResourceTable::Guid).count()).gte(min_count))
    .order_by(ResourceTable::Namespace, Order::Asc)
    .order_by(ResourceTable::Group, Order::Asc)
    .order_by(ResourceTable::Resource, Order::Asc);
    if !namespace.is_empty() {
        stmt.and_where(Expr::col(ResourceTable::Namespace).eq(namespace));
    }

    let rows = sqlx::query(&dialect.build(stmt))
        .fetch_all(&mut *conn)
        .await
        .sql_context("count resources")?;

    let mut stats = Vec::with_capacity(rows.len());
    for row in rows {
        let namespace: String = row.try_get("namespace").sql_context("decode namespace")?;
        let group: String = row.try_get("group").sql_context("decode group")?;
        let resource: String = row.try_get("resource").sql_context("decode resource")?;
        let count: i64 = row.try_get("count").sql_context("decode count")?;
        stats.push((namespace, BucketKey::new(group, resource), count));
    }
    Ok(stats)
}
