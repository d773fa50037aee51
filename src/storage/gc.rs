//! Garbage collection of history for deleted resources.
//!
//! Once a name has been deleted for longer than the retention window, and has
//! not been recreated since, all of its history rows up to the deletion are
//! removed in bounded batches.

use std::collections::HashMap;
use std::time::Duration;

use sea_query::{Alias, Expr, Query};
use serde::{Deserialize, Deserializer};
use sqlx::AnyPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::SqlContext;
use super::queries;
use super::schema::HistoryTable;
use super::types::{Action, BucketKey};
use super::{Dialect, Result};

/// Garbage collection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    /// Seconds between runs. Default: 900.
    pub interval_secs: u64,
    /// History rows deleted per statement. Default: 100.
    pub batch_size: u64,
    /// Retention after deletion, in seconds. Default: 86400.
    pub max_age_secs: u64,
    /// Pause between batches in milliseconds. Default: 10.
    pub batch_pause_ms: u64,
    /// Retention overrides per resource name. Default: dashboards for 30 days.
    /// Configured entries are merged into the defaults.
    #[serde(deserialize_with = "merge_resource_max_age")]
    pub resource_max_age_secs: HashMap<String, u64>,
}

fn default_resource_max_age() -> HashMap<String, u64> {
    HashMap::from([("dashboards".to_string(), 30 * 86_400)])
}

fn merge_resource_max_age<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut merged = default_resource_max_age();
    merged.extend(HashMap::<String, u64>::deserialize(deserializer)?);
    Ok(merged)
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
            batch_size: 100,
            max_age_secs: 86_400,
            batch_pause_ms: 10,
            resource_max_age_secs: default_resource_max_age(),
        }
    }
}

impl GcConfig {
    /// Retention window for `resource`.
    pub fn max_age(&self, resource: &str) -> Duration {
        let secs = self
            .resource_max_age_secs
            .get(resource)
            .copied()
            .unwrap_or(self.max_age_secs);
        Duration::from_secs(secs)
    }
}

/// Deletes expired history of deleted resources.
#[derive(Clone)]
pub struct GarbageCollector {
    pool: AnyPool,
    dialect: Dialect,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(pool: AnyPool, dialect: Dialect, config: GcConfig) -> Self {
        Self {
            pool,
            dialect,
            config,
        }
    }

    /// Spawn the periodic collection loop.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let initial = initial_delay(interval);

        info!(
            interval_secs = interval.as_secs(),
            initial_delay_ms = initial.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Garbage collector started"
        );

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(initial) => {}
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Garbage collector stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(&shutdown).await {
                        error!(error = %e, "Garbage collection failed");
                    }
                }
            }
        }
    }

    /// Collect every bucket once. Returns rows deleted.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<u64> {
        let buckets = {
            let mut conn = self.pool.acquire().await.sql_context("acquire connection")?;
            queries::list_bucket_rvs(&mut conn, self.dialect).await?
        };

        let now = queries::now_micros();
        let mut total = 0;
        for (bucket, _) in buckets {
            if shutdown.is_cancelled() {
                break;
            }
            let max_age = self.config.max_age(&bucket.resource).as_micros() as i64;
            let cutoff = now.saturating_sub(max_age);
            match self
                .collect_bucket(&bucket, cutoff, self.config.batch_size, shutdown)
                .await
            {
                Ok(deleted) => total += deleted,
                Err(e) => error!(bucket = %bucket, error = %e, "Bucket garbage collection failed"),
            }
        }

        if total > 0 {
            info!(deleted = total, "Garbage collection completed");
        } else {
            debug!("Garbage collection found nothing to delete");
        }
        Ok(total)
    }

    /// Delete batches for one bucket until a batch comes back short.
    ///
    /// `cutoff` is in microseconds since the Unix epoch; only deletions written
    /// before it qualify.
    pub async fn collect_bucket(
        &self,
        bucket: &BucketKey,
        cutoff: i64,
        batch_size: u64,
        shutdown: &CancellationToken,
    ) -> Result<u64> {
        let batch_size = batch_size.max(1);
        let pause = Duration::from_millis(self.config.batch_pause_ms);
        let mut total = 0;

        loop {
            let deleted = self.delete_batch(bucket, cutoff, batch_size).await?;
            total += deleted;
            if deleted < batch_size || shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if total > 0 {
            debug!(bucket = %bucket, deleted = total, "Collected history");

            #[cfg(feature = "otel")]
            {
                use crate::utils::metrics::{self, GC_DELETED_TOTAL};
                GC_DELETED_TOTAL.add(total, &metrics::bucket_attrs(&bucket.group, &bucket.resource));
            }
        }
        Ok(total)
    }

    /// Delete at most `batch_size` expired history rows of `bucket`.
    pub async fn delete_batch(&self, bucket: &BucketKey, cutoff: i64, batch_size: u64) -> Result<u64> {
        let candidates = self.dialect.build(candidate_rows(bucket, cutoff, batch_size));
        let guids: Vec<String> = sqlx::query_scalar(&candidates)
            .fetch_all(&self.pool)
            .await
            .sql_context("select expired history")?;
        if guids.is_empty() {
            return Ok(0);
        }

        let delete = Query::delete()
            .from_table(HistoryTable::Table)
            .and_where(Expr::col(HistoryTable::Guid).is_in(guids))
            .to_owned();
        let result = sqlx::query(&self.dialect.build(delete))
            .execute(&self.pool)
            .await
            .sql_context("delete expired history")?;
        Ok(result.rows_affected())
    }
}

/// History rows of names whose qualifying deletion is older than `cutoff`, has
/// no later `Created` row, and that have no live row.
fn candidate_rows(bucket: &BucketKey, cutoff: i64, batch_size: u64) -> sea_query::SelectStatement {
    let deleted = Alias::new("deleted");
    let recreated = Alias::new("recreated");
    let key_columns = [
        HistoryTable::Namespace,
        HistoryTable::Group,
        HistoryTable::Resource,
        HistoryTable::Name,
    ];

    let mut recreate = Query::select();
    recreate
        .expr(Expr::val(1))
        .from_as(HistoryTable::Table, recreated.clone());
    for column in key_columns {
        recreate.and_where(Expr::col((recreated.clone(), column)).equals((deleted.clone(), column)));
    }
    recreate
        .and_where(Expr::col((recreated.clone(), HistoryTable::Action)).eq(Action::Created.as_i64()))
        .and_where(
            Expr::col((recreated, HistoryTable::ResourceVersion))
                .gt(Expr::col((deleted.clone(), HistoryTable::ResourceVersion))),
        );

    let mut deletion = Query::select();
    deletion
        .expr(Expr::val(1))
        .from_as(HistoryTable::Table, deleted.clone());
    for column in key_columns {
        deletion.and_where(Expr::col((deleted.clone(), column)).equals((HistoryTable::Table, column)));
    }
    deletion
        .and_where(Expr::col((deleted.clone(), HistoryTable::Action)).eq(Action::Deleted.as_i64()))
        .and_where(Expr::col((deleted.clone(), HistoryTable::UpdatedAt)).lt(cutoff))
        .and_where(
            Expr::col((deleted, HistoryTable::ResourceVersion))
                .gte(Expr::col((HistoryTable::Table, HistoryTable::ResourceVersion))),
        )
        .and_where(Expr::exists(recreate).not());

    let mut stmt = Query::select();
    stmt.column((HistoryTable::Table, HistoryTable::Guid))
        .from(HistoryTable::Table)
        .and_where(Expr::col((HistoryTable::Table, HistoryTable::Group)).eq(bucket.group.as_str()))
        .and_where(
            Expr::col((HistoryTable::Table, HistoryTable::Resource)).eq(bucket.resource.as_str()),
        )
        .and_where(Expr::exists(deletion))
        .and_where(queries::live_row_exists().not())
        .limit(batch_size);
    stmt
}

/// Up to one interval of delay so replicas started together do not collect
/// at the same moment.
fn initial_delay(interval: Duration) -> Duration {
    // Nanosecond timestamp as entropy source.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    interval.mul_f64((nanos % 1000) as f64 / 1000.0)
}
