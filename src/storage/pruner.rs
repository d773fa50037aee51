//! History pruning.
//!
//! Every write requests a prune of its key. Requests are coalesced per key by a
//! [`DebounceGroup`] and the fired action keeps only the newest
//! `history_limit` history rows of the key.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sea_query::{Expr, Order, Query};
use serde::Deserialize;
use sqlx::{AnyPool, Row};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SqlContext;
use super::schema::HistoryTable;
use super::types::ResourceKey;
use super::{Dialect, Result, StorageError};

/// Pruner configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrunerConfig {
    pub enabled: bool,
    /// History rows kept per key. Default: 20.
    pub history_limit: u64,
    /// Quiet period after the last request before pruning. Default: 5000.
    pub min_wait_ms: u64,
    /// Upper bound on the delay since the first request of a cycle. Default: 30000.
    pub max_wait_ms: u64,
    /// Pending requests accepted before new ones are dropped. Default: 1000.
    pub buffer_size: usize,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_limit: 20,
            min_wait_ms: 5_000,
            max_wait_ms: 30_000,
            buffer_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadlines {
    quiet: Instant,
    max: Instant,
}

impl Deadlines {
    fn fire_at(&self) -> Instant {
        self.quiet.min(self.max)
    }
}

/// Coalesces repeated requests per key into one handler call.
///
/// A key fires `min_wait` after its latest request, or `max_wait` after the
/// first request of the cycle, whichever comes first. One driver task owns
/// the timer map and awaits the handler inline.
pub struct DebounceGroup<K> {
    tx: mpsc::Sender<K>,
    rejected: Arc<AtomicU64>,
}

impl<K> DebounceGroup<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new<F, Fut>(
        min_wait: Duration,
        max_wait: Duration,
        buffer_size: usize,
        shutdown: CancellationToken,
        handler: F,
    ) -> Self
    where
        F: Fn(K) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        tokio::spawn(drive(rx, min_wait, max_wait.max(min_wait), shutdown, handler));
        Self {
            tx,
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Request a handler call for `key`. Never blocks.
    pub fn add(&self, key: K) -> Result<()> {
        self.tx.try_send(key).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "otel")]
                crate::utils::metrics::PRUNER_BUFFER_FULL_TOTAL.add(1, &[]);

                StorageError::BufferFull
            }
            mpsc::error::TrySendError::Closed(_) => {
                StorageError::Internal("debounce group stopped".to_string())
            }
        })
    }

    /// Requests rejected on a full buffer since construction.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

async fn drive<K, F, Fut>(
    mut rx: mpsc::Receiver<K>,
    min_wait: Duration,
    max_wait: Duration,
    shutdown: CancellationToken,
    handler: F,
) where
    K: Eq + Hash + Clone,
    F: Fn(K) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut timers: HashMap<K, Deadlines> = HashMap::new();

    loop {
        let next = timers.values().map(Deadlines::fire_at).min();
        let wait = async {
            match next {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            key = rx.recv() => {
                let Some(key) = key else { break };
                let now = Instant::now();
                timers
                    .entry(key)
                    .and_modify(|d| d.quiet = now + min_wait)
                    .or_insert(Deadlines {
                        quiet: now + min_wait,
                        max: now + max_wait,
                    });
            }
            _ = wait => {
                let now = Instant::now();
                let due: Vec<K> = timers
                    .iter()
                    .filter(|(_, d)| d.fire_at() <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in due {
                    timers.remove(&key);
                    handler(key).await;
                }
            }
        }
    }
}

/// Deletes all but the newest history rows of a key.
#[derive(Clone)]
pub struct HistoryPruner {
    pool: AnyPool,
    dialect: Dialect,
    history_limit: u64,
}

impl HistoryPruner {
    pub fn new(pool: AnyPool, dialect: Dialect, history_limit: u64) -> Self {
        Self {
            pool,
            dialect,
            history_limit: history_limit.max(1),
        }
    }

    /// Start a debounce group that prunes each requested key.
    pub fn start(
        self,
        config: &PrunerConfig,
        shutdown: CancellationToken,
    ) -> DebounceGroup<ResourceKey> {
        info!(
            history_limit = self.history_limit,
            min_wait_ms = config.min_wait_ms,
            max_wait_ms = config.max_wait_ms,
            "History pruner started"
        );
        let pruner = Arc::new(self);
        DebounceGroup::new(
            Duration::from_millis(config.min_wait_ms),
            Duration::from_millis(config.max_wait_ms),
            config.buffer_size,
            shutdown,
            move |key: ResourceKey| {
                let pruner = pruner.clone();
                async move {
                    if let Err(e) = pruner.prune(&key).await {
                        warn!(key = %key, error = %e, "History prune failed");
                    }
                }
            },
        )
    }

    /// Keep the newest `history_limit` history rows of `key`. Returns rows deleted.
    pub async fn prune(&self, key: &ResourceKey) -> Result<u64> {
        let kth = self.dialect.build(
            Query::select()
                .column(HistoryTable::ResourceVersion)
                .from(HistoryTable::Table)
                .and_where(Expr::col(HistoryTable::Namespace).eq(key.namespace.as_str()))
                .and_where(Expr::col(HistoryTable::Group).eq(key.group.as_str()))
                .and_where(Expr::col(HistoryTable::Resource).eq(key.resource.as_str()))
                .and_where(Expr::col(HistoryTable::Name).eq(key.name.as_str()))
                .order_by(HistoryTable::ResourceVersion, Order::Desc)
                .limit(1)
                .offset(self.history_limit - 1)
                .to_owned(),
        );

        let row = sqlx::query(&kth)
            .fetch_optional(&self.pool)
            .await
            .sql_context("select prune boundary")?;
        let Some(row) = row else {
            return Ok(0);
        };
        let boundary: i64 = row
            .try_get("resource_version")
            .sql_context("decode resource_version")?;

        let delete = self.dialect.build(
            Query::delete()
                .from_table(HistoryTable::Table)
                .and_where(Expr::col(HistoryTable::Namespace).eq(key.namespace.as_str()))
                .and_where(Expr::col(HistoryTable::Group).eq(key.group.as_str()))
                .and_where(Expr::col(HistoryTable::Resource).eq(key.resource.as_str()))
                .and_where(Expr::col(HistoryTable::Name).eq(key.name.as_str()))
                .and_where(Expr::col(HistoryTable::ResourceVersion).lt(boundary))
                .to_owned(),
        );
        let deleted = sqlx::query(&delete)
            .execute(&self.pool)
            .await
            .sql_context("prune resource_history")?
            .rows_affected();

        debug!(key = %key, deleted, boundary, "Pruned history");
        Ok(deleted)
    }
}
