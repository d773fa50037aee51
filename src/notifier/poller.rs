//! Cross-process notifier that polls the history table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::AnyPool;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Notifier;
use crate::storage::error::SqlContext;
use crate::storage::{queries, BucketKey, Dialect, Result, WrittenEvent};

/// Maximum history rows fetched for one bucket per tick.
const POLL_LIMIT: u64 = 1000;

/// Where the poller reads bucket versions and history from.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Current version of every bucket.
    async fn list_latest_rvs(&self) -> Result<Vec<(BucketKey, i64)>>;

    /// Committed writes of `bucket` with a version above `since`, ascending.
    async fn history_poll(&self, bucket: &BucketKey, since: i64) -> Result<Vec<WrittenEvent>>;
}

/// [`ChangeSource`] over the storage tables.
pub struct SqlChangeSource {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlChangeSource {
    pub fn new(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }
}

#[async_trait]
impl ChangeSource for SqlChangeSource {
    async fn list_latest_rvs(&self) -> Result<Vec<(BucketKey, i64)>> {
        let mut conn = self.pool.acquire().await.sql_context("acquire connection")?;
        queries::list_bucket_rvs(&mut conn, self.dialect).await
    }

    async fn history_poll(&self, bucket: &BucketKey, since: i64) -> Result<Vec<WrittenEvent>> {
        let mut conn = self.pool.acquire().await.sql_context("acquire connection")?;
        let rows = queries::history_since(&mut conn, self.dialect, bucket, since, POLL_LIMIT).await?;
        Ok(rows.into_iter().map(|row| row.into_written_event()).collect())
    }
}

/// Watches the database for writes from any process.
pub struct PollingNotifier {
    source: Arc<dyn ChangeSource>,
    interval: Duration,
    buffer_size: usize,
    shutdown: CancellationToken,
}

impl PollingNotifier {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        interval: Duration,
        buffer_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        info!(interval_ms = interval.as_millis() as u64, "Polling notifier initialized");
        Self {
            source,
            interval: interval.max(Duration::from_millis(1)),
            buffer_size: buffer_size.max(1),
            shutdown,
        }
    }
}

#[async_trait]
impl Notifier for PollingNotifier {
    fn send(&self, _event: WrittenEvent) {}

    async fn notify(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<WrittenEvent>> {
        // Start from what is already committed; only later writes are streamed.
        let watermarks = self.source.list_latest_rvs().await?.into_iter().collect();
        let (tx, rx) = mpsc::channel(self.buffer_size);

        let poller = Poller::new(self.source.clone(), watermarks, tx);
        tokio::spawn(poller.run(self.interval, cancel, self.shutdown.clone()));
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "polling"
    }
}

/// Per-watcher poll loop. Owns its watermarks.
pub(crate) struct Poller {
    source: Arc<dyn ChangeSource>,
    watermarks: HashMap<BucketKey, i64>,
    tx: mpsc::Sender<WrittenEvent>,
}

impl Poller {
    pub(crate) fn new(
        source: Arc<dyn ChangeSource>,
        watermarks: HashMap<BucketKey, i64>,
        tx: mpsc::Sender<WrittenEvent>,
    ) -> Self {
        Self {
            source,
            watermarks,
            tx,
        }
    }

    async fn run(mut self, interval: Duration, cancel: CancellationToken, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(buckets = self.watermarks.len(), "Poller started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                polled = self.poll_once() => polled,
            };
            match polled {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => warn!(error = %e, "Listing bucket versions failed"),
            }
        }

        debug!("Poller stopped");
    }

    /// One tick: list bucket versions and stream history for every bucket that
    /// moved past its watermark.
    ///
    /// Returns `Ok(false)` once the watcher is gone.
    pub(crate) async fn poll_once(&mut self) -> Result<bool> {
        let latest = self.source.list_latest_rvs().await?;

        for (bucket, max_rv) in latest {
            let watermark = *self.watermarks.entry(bucket.clone()).or_insert(0);
            if max_rv <= watermark {
                continue;
            }

            let events = match self.source.history_poll(&bucket, watermark).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(bucket = %bucket, since = watermark, error = %e, "History poll failed");
                    continue;
                }
            };

            let mut highest = watermark;
            let count = events.len();
            for event in events {
                highest = highest.max(event.resource_version);
                if self.tx.send(event).await.is_err() {
                    return Ok(false);
                }
            }
            if count == 0 {
                // History already pruned away; nothing left to stream below max_rv.
                highest = max_rv;
            }
            self.watermarks.insert(bucket.clone(), highest);
            debug!(bucket = %bucket, count, watermark = highest, "Polled bucket");
        }

        Ok(true)
    }
}
