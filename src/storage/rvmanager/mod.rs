//! Resource version manager.
//!
//! Every write to a (group, resource) bucket goes through a per-bucket queue
//! drained by a dedicated processor task. The processor groups whatever is
//! queued (up to `max_batch_size`) into one transaction, takes the exclusive
//! lock on the bucket's `resource_version` row once, and hands out consecutive
//! versions in submission order.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use sea_query::{Alias, CaseStatement, Expr, Query};
use serde::Deserialize;
use sqlx::{AnyConnection, AnyPool, Row};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::SqlContext;
use super::schema::{HistoryTable, ResourceTable, ResourceVersionTable};
use super::types::{BucketKey, ResourceKey};
use super::{Dialect, Result, StorageError};

/// Row-level work executed inside a batch transaction.
#[async_trait]
pub trait VersionedWrite: Send {
    /// Run the statements for this write and return the write GUID whose rows
    /// receive the assigned version.
    async fn apply(&mut self, conn: &mut AnyConnection) -> Result<String>;

    /// GUID of the row this write replaced, once `apply` ran.
    fn replaced_guid(&self) -> Option<&str> {
        None
    }

    /// Called after the batch committed, in version order. `replaced_rv` is
    /// set when the replaced row was written earlier in the same batch.
    fn committed(&self, _resource_version: i64, _replaced_rv: Option<i64>) {}
}

/// Batching configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RvManagerConfig {
    /// Maximum writes committed in one transaction. Default: 25.
    pub max_batch_size: usize,
    /// Capacity of each bucket queue. Default: 1000.
    pub queue_capacity: usize,
}

impl Default for RvManagerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 25,
            queue_capacity: 1000,
        }
    }
}

/// Construction options. Pool and dialect are required.
#[derive(Default)]
pub struct RvManagerOptions {
    pub pool: Option<AnyPool>,
    pub dialect: Option<Dialect>,
    pub config: RvManagerConfig,
}

struct QueuedWrite {
    write: Box<dyn VersionedWrite>,
    done: oneshot::Sender<Result<i64>>,
}

/// Serializes and batches writes per bucket.
pub struct ResourceVersionManager {
    pool: AnyPool,
    dialect: Dialect,
    config: RvManagerConfig,
    queues: Mutex<HashMap<BucketKey, mpsc::Sender<QueuedWrite>>>,
}

impl ResourceVersionManager {
    pub fn new(options: RvManagerOptions) -> Result<Self> {
        let pool = options
            .pool
            .ok_or_else(|| StorageError::Internal("resource version manager requires a database".into()))?;
        let dialect = options
            .dialect
            .ok_or_else(|| StorageError::Internal("resource version manager requires a dialect".into()))?;

        let mut config = options.config;
        config.max_batch_size = config.max_batch_size.max(1);
        config.queue_capacity = config.queue_capacity.max(1);

        Ok(Self {
            pool,
            dialect,
            config,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Execute `write` in the next batch of `key`'s bucket and return the
    /// version assigned to it.
    ///
    /// Cancelling `cancel` returns [`StorageError::Cancelled`] to this caller
    /// only; a batch that already picked the write up still commits.
    pub async fn exec_with_rv(
        &self,
        cancel: &CancellationToken,
        key: &ResourceKey,
        write: Box<dyn VersionedWrite>,
    ) -> Result<i64> {
        if key.group.is_empty() || key.resource.is_empty() {
            return Err(StorageError::BadRequest(
                "group and resource are required".to_string(),
            ));
        }

        let queue = self.queue_for(key.bucket());
        let (done, result) = oneshot::channel();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            sent = queue.send(QueuedWrite { write, done }) => {
                sent.map_err(|_| StorageError::Internal("batch processor stopped".to_string()))?;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            res = result => res.unwrap_or_else(|_| {
                Err(StorageError::Internal("batch processor dropped the write".to_string()))
            }),
        }
    }

    /// Queue of a bucket, spawning its processor on first use.
    fn queue_for(&self, bucket: BucketKey) -> mpsc::Sender<QueuedWrite> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queue) = queues.get(&bucket) {
            return queue.clone();
        }

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let processor = BatchProcessor {
            bucket: bucket.clone(),
            pool: self.pool.clone(),
            dialect: self.dialect,
            max_batch_size: self.config.max_batch_size,
        };
        tokio::spawn(processor.run(rx));
        queues.insert(bucket, tx.clone());
        tx
    }
}

/// Owner of one bucket queue.
struct BatchProcessor {
    bucket: BucketKey,
    pool: AnyPool,
    dialect: Dialect,
    max_batch_size: usize,
}

impl BatchProcessor {
    async fn run(self, mut queue: mpsc::Receiver<QueuedWrite>) {
        debug!(bucket = %self.bucket, "Batch processor started");

        while let Some(first) = queue.recv().await {
            let mut batch = Vec::with_capacity(self.max_batch_size);
            batch.push(first);
            while batch.len() < self.max_batch_size {
                match queue.try_recv() {
                    Ok(next) => batch.push(next),
                    Err(_) => break,
                }
            }
            self.process(batch).await;
        }

        debug!(bucket = %self.bucket, "Batch processor stopped");
    }

    async fn process(&self, batch: Vec<QueuedWrite>) {
        let started = Instant::now();
        let size = batch.len();
        let (mut writes, waiters): (Vec<_>, Vec<_>) =
            batch.into_iter().map(|q| (q.write, q.done)).unzip();

        match self.commit(&mut writes).await {
            Ok((versions, replaced)) => {
                for ((write, rv), replaced_rv) in writes.iter().zip(&versions).zip(replaced) {
                    write.committed(*rv, replaced_rv);
                }
                debug!(
                    bucket = %self.bucket,
                    size,
                    first_rv = versions.first().copied().unwrap_or_default(),
                    last_rv = versions.last().copied().unwrap_or_default(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Committed write batch"
                );
                for (waiter, rv) in waiters.into_iter().zip(versions) {
                    let _ = waiter.send(Ok(rv));
                }
            }
            Err(e) => {
                warn!(bucket = %self.bucket, size, error = %e, "Write batch aborted");
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, RV_BATCH_SIZE};
            RV_BATCH_SIZE.record(
                size as u64,
                &metrics::bucket_attrs(&self.bucket.group, &self.bucket.resource),
            );
        }
    }

    /// Run the batch in one write transaction. Returns the assigned versions
    /// and, per write, the version of a replaced row from the same batch.
    async fn commit(
        &self,
        writes: &mut [Box<dyn VersionedWrite>],
    ) -> Result<(Vec<i64>, Vec<Option<i64>>)> {
        let mut conn = self.pool.acquire().await.sql_context("acquire connection")?;
        sqlx::query(self.dialect.begin_write())
            .execute(&mut *conn)
            .await
            .sql_context("begin batch")?;

        let result = match self.apply(&mut conn, writes).await {
            Ok(assigned) => sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .sql_context("commit batch")
                .map(|_| assigned),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!(bucket = %self.bucket, error = %rollback, "Rollback failed");
                // Never hand a connection with an open transaction back to the pool.
                drop(conn.detach());
            }
        }
        result
    }

    async fn apply(
        &self,
        conn: &mut AnyConnection,
        writes: &mut [Box<dyn VersionedWrite>],
    ) -> Result<(Vec<i64>, Vec<Option<i64>>)> {
        let mut guids = Vec::with_capacity(writes.len());
        for write in writes.iter_mut() {
            guids.push(write.apply(&mut *conn).await?);
        }

        let next = self.lock_next_rv(conn).await?;
        let versions: Vec<i64> = (0..guids.len() as i64).map(|i| next + i).collect();

        // Rows written earlier in this batch were read with version 0.
        let assigned: HashMap<&str, i64> = guids
            .iter()
            .map(String::as_str)
            .zip(versions.iter().copied())
            .collect();
        let replaced: Vec<Option<i64>> = writes
            .iter()
            .map(|w| w.replaced_guid().and_then(|g| assigned.get(g).copied()))
            .collect();

        self.backfill(conn, &guids, &versions).await?;
        self.backfill_replaced(conn, &guids, &replaced).await?;

        if let Some(last) = versions.last() {
            let sql = self.dialect.build(
                Query::update()
                    .table(ResourceVersionTable::Table)
                    .value(ResourceVersionTable::ResourceVersion, *last)
                    .and_where(
                        Expr::col(ResourceVersionTable::Group).eq(self.bucket.group.as_str()),
                    )
                    .and_where(
                        Expr::col(ResourceVersionTable::Resource).eq(self.bucket.resource.as_str()),
                    )
                    .to_owned(),
            );
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .sql_context("save resource_version")?;
        }

        Ok((versions, replaced))
    }

    /// Lock the bucket row and compute the first version of this batch.
    async fn lock_next_rv(&self, conn: &mut AnyConnection) -> Result<i64> {
        let select = {
            let mut stmt = Query::select();
            stmt.column(ResourceVersionTable::ResourceVersion)
                .expr_as(Expr::cust(self.dialect.epoch_micros()), Alias::new("epoch"))
                .from(ResourceVersionTable::Table)
                .and_where(Expr::col(ResourceVersionTable::Group).eq(self.bucket.group.as_str()))
                .and_where(
                    Expr::col(ResourceVersionTable::Resource).eq(self.bucket.resource.as_str()),
                );
            if self.dialect.supports_row_lock() {
                stmt.lock_exclusive();
            }
            self.dialect.build(stmt)
        };

        for _ in 0..2 {
            let row = sqlx::query(&select)
                .fetch_optional(&mut *conn)
                .await
                .sql_context("lock resource_version")?;

            if let Some(row) = row {
                let current: i64 = row
                    .try_get("resource_version")
                    .sql_context("decode resource_version")?;
                let epoch: i64 = row.try_get("epoch").sql_context("decode epoch")?;
                return Ok(epoch.max(current + 1));
            }

            let insert = self.dialect.build(
                Query::insert()
                    .into_table(ResourceVersionTable::Table)
                    .columns([
                        ResourceVersionTable::Group,
                        ResourceVersionTable::Resource,
                        ResourceVersionTable::ResourceVersion,
                    ])
                    .values_panic([
                        self.bucket.group.as_str().into(),
                        self.bucket.resource.as_str().into(),
                        0i64.into(),
                    ])
                    .to_owned(),
            );
            sqlx::query(&insert)
                .execute(&mut *conn)
                .await
                .sql_context("insert resource_version")?;
        }

        Err(StorageError::Internal(format!(
            "resource_version row for {} missing after insert",
            self.bucket
        )))
    }

    /// Set the assigned versions on the current and history rows of each write.
    async fn backfill(
        &self,
        conn: &mut AnyConnection,
        guids: &[String],
        versions: &[i64],
    ) -> Result<()> {
        let (resource, history) = {
            let mut resource_case = CaseStatement::new();
            let mut history_case = CaseStatement::new();
            for (guid, rv) in guids.iter().zip(versions) {
                resource_case =
                    resource_case.case(Expr::col(ResourceTable::Guid).eq(guid.as_str()), *rv);
                history_case =
                    history_case.case(Expr::col(HistoryTable::Guid).eq(guid.as_str()), *rv);
            }
            let resource_case = resource_case.finally(Expr::col(ResourceTable::ResourceVersion));
            let history_case = history_case.finally(Expr::col(HistoryTable::ResourceVersion));

            let resource = Query::update()
                .table(ResourceTable::Table)
                .value(ResourceTable::ResourceVersion, resource_case)
                .and_where(Expr::col(ResourceTable::Guid).is_in(guids.iter().cloned()))
                .to_owned();
            let history = Query::update()
                .table(HistoryTable::Table)
                .value(HistoryTable::ResourceVersion, history_case)
                .and_where(Expr::col(HistoryTable::Guid).is_in(guids.iter().cloned()))
                .to_owned();
            (self.dialect.build(resource), self.dialect.build(history))
        };

        sqlx::query(&resource)
            .execute(&mut *conn)
            .await
            .sql_context("backfill resource")?;

        let updated = sqlx::query(&history)
            .execute(&mut *conn)
            .await
            .sql_context("backfill resource_history")?;

        if updated.rows_affected() != guids.len() as u64 {
            return Err(StorageError::Internal(format!(
                "expected {} history rows in batch for {}, found {}",
                guids.len(),
                self.bucket,
                updated.rows_affected()
            )));
        }
        Ok(())
    }

    /// Set the previous version of writes whose replaced row was written
    /// earlier in the batch.
    async fn backfill_replaced(
        &self,
        conn: &mut AnyConnection,
        guids: &[String],
        replaced: &[Option<i64>],
    ) -> Result<()> {
        let pending: Vec<(&str, i64)> = guids
            .iter()
            .zip(replaced)
            .filter_map(|(guid, rv)| rv.map(|rv| (guid.as_str(), rv)))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let (resource, history) = {
            let mut resource_case = CaseStatement::new();
            let mut history_case = CaseStatement::new();
            for (guid, rv) in &pending {
                resource_case = resource_case.case(Expr::col(ResourceTable::Guid).eq(*guid), *rv);
                history_case = history_case.case(Expr::col(HistoryTable::Guid).eq(*guid), *rv);
            }
            let resource_case =
                resource_case.finally(Expr::col(ResourceTable::PreviousResourceVersion));
            let history_case =
                history_case.finally(Expr::col(HistoryTable::PreviousResourceVersion));
            let guids: Vec<String> = pending.iter().map(|(g, _)| g.to_string()).collect();

            let resource = Query::update()
                .table(ResourceTable::Table)
                .value(ResourceTable::PreviousResourceVersion, resource_case)
                .and_where(Expr::col(ResourceTable::Guid).is_in(guids.iter().cloned()))
                .to_owned();
            let history = Query::update()
                .table(HistoryTable::Table)
                .value(HistoryTable::PreviousResourceVersion, history_case)
                .and_where(Expr::col(HistoryTable::Guid).is_in(guids))
                .to_owned();
            (self.dialect.build(resource), self.dialect.build(history))
        };

        sqlx::query(&resource)
            .execute(&mut *conn)
            .await
            .sql_context("backfill resource previous version")?;
        sqlx::query(&history)
            .execute(&mut *conn)
            .await
            .sql_context("backfill resource_history previous version")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
