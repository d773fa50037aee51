//! Paginated list and history cursors.
//!
//! A [`ListIter`] is pinned to one list resource version and walks an ordered
//! scan in chunks. Its continue token records the pinned version and the
//! number of rows consumed so far, so the next page resumes the same scan.

use std::collections::VecDeque;

use sea_query::{Expr, Order, Query, SelectStatement};
use sqlx::AnyPool;
use tracing::debug;

use super::continue_token::ContinueToken;
use super::error::SqlContext;
use super::queries::{self, HistoryRow};
use super::schema::{HistoryTable, ResourceTable};
use super::types::{
    Action, BucketKey, ListRequest, ListSource, ResourceKey, ResourceWrapper, VersionMatch,
};
use super::{Dialect, Result, StorageError};

/// Rows fetched per query when the request has no limit.
pub const DEFAULT_CHUNK_SIZE: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Live rows; the first chunk comes from the current-state table.
    Latest,
    /// Latest non-deleted history row per name at the pinned version.
    AtRevision,
    /// Every history row of one key.
    History,
    /// Latest deletion per name without a live row.
    Trash,
}

/// Cursor over one list request.
///
/// Finite and not restartable; issue a new request to start over.
pub struct ListIter {
    pool: AnyPool,
    dialect: Dialect,
    scan: Scan,
    key: ResourceKey,
    list_rv: i64,
    version_match: VersionMatch,
    /// Filter version for history and trash scans.
    match_rv: i64,
    /// History rows at or below this version belong to an earlier incarnation.
    min_rv: i64,
    sort_ascending: bool,
    chunk_size: u64,
    /// Rows requested from the scan so far, including the token offset.
    fetched: u64,
    /// Rows handed out so far, including the token offset.
    consumed: u64,
    buffer: VecDeque<ResourceWrapper>,
    current: Option<ResourceWrapper>,
    exhausted: bool,
    err: Option<StorageError>,
}

impl ListIter {
    /// Validate `request` and position a cursor at its first row.
    pub async fn new(pool: AnyPool, dialect: Dialect, request: &ListRequest) -> Result<Self> {
        let key = request.options.key.clone();
        if key.group.is_empty() || key.resource.is_empty() {
            return Err(StorageError::BadRequest(
                "group and resource are required".to_string(),
            ));
        }
        if request.resource_version < 0 {
            return Err(StorageError::BadRequest(
                "resource version must not be negative".to_string(),
            ));
        }

        let token = if request.next_page_token.is_empty() {
            None
        } else {
            Some(ContinueToken::decode(&request.next_page_token)?)
        };
        let chunk_size = if request.limit > 0 {
            request.limit as u64
        } else {
            DEFAULT_CHUNK_SIZE
        };

        let mut conn = pool.acquire().await.sql_context("acquire connection")?;
        let bucket_rv = queries::read_bucket_rv(&mut conn, dialect, &key.bucket()).await?;

        let mut iter = Self {
            pool: pool.clone(),
            dialect,
            scan: Scan::Latest,
            key,
            list_rv: bucket_rv,
            version_match: request.version_match,
            match_rv: 0,
            min_rv: 0,
            sort_ascending: false,
            chunk_size,
            fetched: 0,
            consumed: 0,
            buffer: VecDeque::new(),
            current: None,
            exhausted: false,
            err: None,
        };

        match request.source {
            ListSource::Store => iter.init_store(request, token, bucket_rv)?,
            ListSource::History | ListSource::Trash => {
                iter.init_history(request, token, bucket_rv)?;
                if iter.scan == Scan::History && iter.version_match != VersionMatch::Exact {
                    iter.min_rv = iter.last_deletion(&mut conn).await? + 1;
                }
            }
        }
        drop(conn);

        if iter.scan == Scan::Latest {
            iter.fetch_latest().await?;
        }

        debug!(
            scan = ?iter.scan,
            list_rv = iter.list_rv,
            offset = iter.consumed,
            "List iterator opened"
        );
        Ok(iter)
    }

    fn init_store(
        &mut self,
        request: &ListRequest,
        token: Option<ContinueToken>,
        bucket_rv: i64,
    ) -> Result<()> {
        let requested = request.resource_version;

        if let Some(token) = token {
            if requested > 0 && requested != token.resource_version {
                return Err(StorageError::BadRequest(format!(
                    "resource version {requested} does not match continue token version {}",
                    token.resource_version
                )));
            }
            self.scan = Scan::AtRevision;
            self.list_rv = token.resource_version;
            self.fetched = token.start_offset as u64;
            self.consumed = self.fetched;
        } else if requested > 0 {
            if requested > bucket_rv {
                return Err(StorageError::BadRequest(format!(
                    "resource version {requested} is newer than the current version {bucket_rv}"
                )));
            }
            if request.version_match == VersionMatch::NotOlderThan {
                // The current state is never older than any committed version.
                self.scan = Scan::Latest;
            } else {
                self.scan = Scan::AtRevision;
                self.list_rv = requested;
            }
        }

        if self.list_rv > bucket_rv {
            return Err(StorageError::BadRequest(format!(
                "resource version {} is newer than the current version {bucket_rv}",
                self.list_rv
            )));
        }
        Ok(())
    }

    fn init_history(
        &mut self,
        request: &ListRequest,
        token: Option<ContinueToken>,
        bucket_rv: i64,
    ) -> Result<()> {
        self.scan = if request.source == ListSource::History {
            Scan::History
        } else {
            Scan::Trash
        };
        if self.scan == Scan::History && self.key.name.is_empty() {
            return Err(StorageError::BadRequest(
                "name is required for history lists".to_string(),
            ));
        }

        let requested = request.resource_version;
        self.sort_ascending = request.version_match == VersionMatch::NotOlderThan;
        match request.version_match {
            VersionMatch::Exact => {
                if requested <= 0 {
                    return Err(StorageError::BadRequest(
                        "exact version match requires a resource version".to_string(),
                    ));
                }
                self.match_rv = requested;
            }
            VersionMatch::NotOlderThan => self.match_rv = requested,
            // An explicit version pins the list like a store list.
            VersionMatch::Unset if requested > 0 => self.list_rv = requested,
            VersionMatch::Unset => {}
        }

        if let Some(token) = token {
            if token.sort_ascending != self.sort_ascending {
                return Err(StorageError::BadRequest(
                    "continue token sort order does not match the request".to_string(),
                ));
            }
            if request.version_match == VersionMatch::Unset
                && requested > 0
                && requested != token.resource_version
            {
                return Err(StorageError::BadRequest(format!(
                    "resource version {requested} does not match continue token version {}",
                    token.resource_version
                )));
            }
            self.list_rv = token.resource_version;
            self.fetched = token.start_offset as u64;
            self.consumed = self.fetched;
        }

        if self.list_rv > bucket_rv {
            return Err(StorageError::BadRequest(format!(
                "resource version {} is newer than the current version {bucket_rv}",
                self.list_rv
            )));
        }
        Ok(())
    }

    /// Version of the latest deletion of the key at or below the list version.
    async fn last_deletion(&self, conn: &mut sqlx::AnyConnection) -> Result<i64> {
        let mut stmt = Query::select();
        stmt.expr(Expr::col(HistoryTable::ResourceVersion).max())
            .from(HistoryTable::Table);
        self.key_filter(&mut stmt, false);
        stmt.and_where(Expr::col((HistoryTable::Table, HistoryTable::Action)).eq(Action::Deleted.as_i64()))
            .and_where(Expr::col((HistoryTable::Table, HistoryTable::ResourceVersion)).lte(self.list_rv));

        let row = sqlx::query_scalar::<_, Option<i64>>(&self.dialect.build(stmt))
            .fetch_one(&mut *conn)
            .await
            .sql_context("read last deletion")?;
        Ok(row.unwrap_or(0))
    }

    /// Advance to the next row. Returns false at the end or on error.
    pub async fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_history().await {
                self.err = Some(e);
                self.current = None;
                return false;
            }
        }
        match self.buffer.pop_front() {
            Some(item) => {
                self.consumed += 1;
                self.current = Some(item);
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    /// The current row.
    pub fn item(&self) -> Option<&ResourceWrapper> {
        self.current.as_ref()
    }

    /// Value of the current row.
    pub fn value(&self) -> &[u8] {
        self.current.as_ref().map(|c| c.value.as_slice()).unwrap_or_default()
    }

    /// Version of the current row.
    pub fn resource_version(&self) -> i64 {
        self.current.as_ref().map(|c| c.resource_version).unwrap_or_default()
    }

    /// Version the whole list is pinned to.
    pub fn list_resource_version(&self) -> i64 {
        self.list_rv
    }

    /// Token resuming after the current row.
    pub fn continue_token(&self) -> String {
        ContinueToken::new(self.list_rv, self.consumed as i64, self.sort_ascending).encode()
    }

    /// The error that ended iteration, if any.
    pub fn error(&self) -> Option<&StorageError> {
        self.err.as_ref()
    }

    fn push_rows(&mut self, rows: Vec<HistoryRow>) {
        let count = rows.len() as u64;
        self.fetched += count;
        if count < self.chunk_size {
            self.exhausted = true;
        }
        self.buffer.extend(rows.into_iter().map(|row| ResourceWrapper {
            key: row.key,
            value: row.value,
            folder: row.folder,
            resource_version: row.resource_version,
        }));
    }

    /// First chunk of a latest list, read from the current-state table together
    /// with the bucket version it is consistent with.
    async fn fetch_latest(&mut self) -> Result<()> {
        let mut tx = self.pool.begin().await.sql_context("begin list")?;

        let mut stmt = Query::select();
        queries::select_resource_columns(&mut stmt)
            .from(ResourceTable::Table)
            .and_where(Expr::col(ResourceTable::Group).eq(self.key.group.as_str()))
            .and_where(Expr::col(ResourceTable::Resource).eq(self.key.resource.as_str()))
            .order_by(ResourceTable::Namespace, Order::Asc)
            .order_by(ResourceTable::Name, Order::Asc)
            .limit(self.chunk_size);
        if !self.key.namespace.is_empty() {
            stmt.and_where(Expr::col(ResourceTable::Namespace).eq(self.key.namespace.as_str()));
        }
        if !self.key.name.is_empty() {
            stmt.and_where(Expr::col(ResourceTable::Name).eq(self.key.name.as_str()));
        }

        let rows = sqlx::query(&self.dialect.build(stmt))
            .fetch_all(&mut *tx)
            .await
            .sql_context("list resource")?;
        let rows = rows
            .iter()
            .map(queries::decode_history_row)
            .collect::<Result<Vec<_>>>()?;
        self.list_rv = queries::read_bucket_rv(&mut tx, self.dialect, &self.key.bucket()).await?;
        tx.commit().await.sql_context("commit list")?;

        self.push_rows(rows);
        // Later chunks continue from history pinned at the same version.
        self.scan = Scan::AtRevision;
        Ok(())
    }

    async fn fetch_history(&mut self) -> Result<()> {
        let mut stmt = Query::select();
        queries::select_history_columns(&mut stmt).from(HistoryTable::Table);
        self.key_filter(&mut stmt, self.scan != Scan::History);
        stmt.and_where(
            Expr::col((HistoryTable::Table, HistoryTable::ResourceVersion)).lte(self.list_rv),
        )
        .and_where(Expr::col((HistoryTable::Table, HistoryTable::ResourceVersion)).gt(0));

        match self.scan {
            Scan::Latest | Scan::AtRevision => {
                stmt.and_where(
                    Expr::col((HistoryTable::Table, HistoryTable::Action))
                        .ne(Action::Deleted.as_i64()),
                )
                .and_where(queries::newer_history_exists(Some(self.list_rv), None).not())
                .order_by((HistoryTable::Table, HistoryTable::Namespace), Order::Asc)
                .order_by((HistoryTable::Table, HistoryTable::Name), Order::Asc);
            }
            Scan::History => {
                self.version_filter(&mut stmt);
                if self.min_rv > 0 {
                    stmt.and_where(
                        Expr::col((HistoryTable::Table, HistoryTable::ResourceVersion))
                            .gte(self.min_rv),
                    );
                }
                stmt.order_by(
                    (HistoryTable::Table, HistoryTable::ResourceVersion),
                    self.order(),
                );
            }
            Scan::Trash => {
                self.version_filter(&mut stmt);
                stmt.and_where(
                    Expr::col((HistoryTable::Table, HistoryTable::Action))
                        .eq(Action::Deleted.as_i64()),
                )
                .and_where(
                    queries::newer_history_exists(Some(self.list_rv), Some(Action::Deleted)).not(),
                )
                .and_where(queries::live_row_exists().not())
                .order_by(
                    (HistoryTable::Table, HistoryTable::ResourceVersion),
                    self.order(),
                );
            }
        }
        stmt.limit(self.chunk_size).offset(self.fetched);

        let mut conn = self.pool.acquire().await.sql_context("acquire connection")?;
        let rows = sqlx::query(&self.dialect.build(stmt))
            .fetch_all(&mut *conn)
            .await
            .sql_context("list resource_history")?;
        let rows = rows
            .iter()
            .map(queries::decode_history_row)
            .collect::<Result<Vec<_>>>()?;
        self.push_rows(rows);
        Ok(())
    }

    fn order(&self) -> Order {
        if self.sort_ascending {
            Order::Asc
        } else {
            Order::Desc
        }
    }

    fn version_filter(&self, stmt: &mut SelectStatement) {
        let column = Expr::col((HistoryTable::Table, HistoryTable::ResourceVersion));
        match self.version_match {
            VersionMatch::Exact => {
                stmt.and_where(column.eq(self.match_rv));
            }
            VersionMatch::NotOlderThan if self.match_rv > 0 => {
                stmt.and_where(column.gte(self.match_rv));
            }
            _ => {}
        }
    }

    /// Restrict to the request's bucket, namespace and name. `optional_name`
    /// lets an empty name match every name.
    fn key_filter(&self, stmt: &mut SelectStatement, optional_name: bool) {
        let bucket: BucketKey = self.key.bucket();
        stmt.and_where(Expr::col((HistoryTable::Table, HistoryTable::Group)).eq(bucket.group))
            .and_where(Expr::col((HistoryTable::Table, HistoryTable::Resource)).eq(bucket.resource));
        if !self.key.namespace.is_empty() {
            stmt.and_where(
                Expr::col((HistoryTable::Table, HistoryTable::Namespace))
                    .eq(self.key.namespace.as_str()),
            );
        }
        if !optional_name || !self.key.name.is_empty() {
            stmt.and_where(
                Expr::col((HistoryTable::Table, HistoryTable::Name)).eq(self.key.name.as_str()),
            );
        }
    }
}
