//! The storage backend: write path, reads, lists and watch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use sqlx::AnyPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::SqlContext;
use super::gc::{GarbageCollector, GcConfig};
use super::list_iter::ListIter;
use super::pruner::{DebounceGroup, HistoryPruner, PrunerConfig};
use super::rvmanager::{ResourceVersionManager, RvManagerConfig, RvManagerOptions};
use super::types::{
    Action, BucketKey, ListRequest, ListResponse, ModifiedResource, ReadResponse, ResourceKey,
    ResourceStats, WatchEventType, WriteEvent, WrittenEvent,
};
use super::write::WriteOp;
use super::{queries, schema, Dialect, Result, StorageError};
use crate::notifier::{ChannelNotifier, Notifier, PollingNotifier, SqlChangeSource};

/// Default page size of [`Backend::list`].
pub const DEFAULT_LIST_LIMIT: i64 = 500;

/// Backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Watch by polling the database instead of in-process fan-out, so writes
    /// from other processes are seen. Default: false.
    pub high_availability: bool,
    /// Poll interval of the polling notifier. Default: 100.
    pub polling_interval_ms: u64,
    /// Per-watcher event buffer. Default: 100.
    pub watch_buffer_size: usize,
    /// Artificial delay inside every write transaction, for tests. Default: 0.
    pub simulated_network_latency_ms: u64,
    pub rv_manager: RvManagerConfig,
    pub pruner: PrunerConfig,
    pub gc: GcConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            high_availability: false,
            polling_interval_ms: 100,
            watch_buffer_size: 100,
            simulated_network_latency_ms: 0,
            rv_manager: RvManagerConfig::default(),
            pruner: PrunerConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

/// Versioned, watchable resource store over one database.
pub struct Backend {
    pool: AnyPool,
    dialect: Dialect,
    config: BackendConfig,
    rvm: ResourceVersionManager,
    notifier: Arc<dyn Notifier>,
    pruner: Option<Arc<DebounceGroup<ResourceKey>>>,
    shutdown: CancellationToken,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Create the schema if needed and start the background tasks.
    pub async fn new(pool: AnyPool, dialect: Dialect, config: BackendConfig) -> Result<Self> {
        schema::migrate(&pool, dialect).await?;

        let shutdown = CancellationToken::new();
        let rvm = ResourceVersionManager::new(RvManagerOptions {
            pool: Some(pool.clone()),
            dialect: Some(dialect),
            config: config.rv_manager.clone(),
        })?;

        let notifier: Arc<dyn Notifier> = if config.high_availability {
            Arc::new(PollingNotifier::new(
                Arc::new(SqlChangeSource::new(pool.clone(), dialect)),
                Duration::from_millis(config.polling_interval_ms),
                config.watch_buffer_size,
                shutdown.clone(),
            ))
        } else {
            Arc::new(ChannelNotifier::new(
                config.watch_buffer_size,
                shutdown.clone(),
            ))
        };

        let pruner = config.pruner.enabled.then(|| {
            Arc::new(
                HistoryPruner::new(pool.clone(), dialect, config.pruner.history_limit)
                    .start(&config.pruner, shutdown.clone()),
            )
        });

        let gc_task = config.gc.enabled.then(|| {
            GarbageCollector::new(pool.clone(), dialect, config.gc.clone()).spawn(shutdown.clone())
        });

        info!(
            dialect = dialect.name(),
            notifier = notifier.name(),
            pruner = config.pruner.enabled,
            gc = config.gc.enabled,
            "Storage backend started"
        );

        Ok(Self {
            pool,
            dialect,
            config,
            rvm,
            notifier,
            pruner,
            shutdown,
            gc_task: Mutex::new(gc_task),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// A collector over this backend's database, for running collection on demand.
    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(self.pool.clone(), self.dialect, self.config.gc.clone())
    }

    /// Apply one write and return its resource version.
    #[tracing::instrument(
        name = "storage.write",
        skip_all,
        fields(key = %event.key, event_type = ?event.event_type)
    )]
    pub async fn write_event(&self, cancel: &CancellationToken, event: WriteEvent) -> Result<i64> {
        event.key.validate().map_err(StorageError::BadRequest)?;
        if event.previous_rv < 0 {
            return Err(StorageError::BadRequest(
                "previous resource version must not be negative".to_string(),
            ));
        }

        #[cfg(feature = "otel")]
        let start = std::time::Instant::now();

        let key = event.key.clone();
        let write = WriteOp::new(
            self.dialect,
            event,
            Duration::from_millis(self.config.simulated_network_latency_ms),
            self.notifier.clone(),
            self.pruner.clone(),
        );
        let result = self.rvm.exec_with_rv(cancel, &key, Box::new(write)).await;

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, WRITE_DURATION, WRITE_TOTAL};
            let outcome = match &result {
                Ok(_) => "success",
                Err(e) if e.is_conflict() => "conflict",
                Err(_) => "error",
            };
            let mut attrs = metrics::bucket_attrs(&key.group, &key.resource).to_vec();
            attrs.push(metrics::outcome_attr(outcome));
            WRITE_TOTAL.add(1, &attrs);
            WRITE_DURATION.record(start.elapsed().as_secs_f64(), &attrs);
        }

        if let Ok(rv) = &result {
            debug!(key = %key, rv, "Write committed");
        }
        result
    }

    pub async fn create(
        &self,
        cancel: &CancellationToken,
        key: ResourceKey,
        value: impl Into<Vec<u8>>,
    ) -> Result<i64> {
        self.write_event(cancel, WriteEvent::added(key, value)).await
    }

    /// Replace the value of `key`. `previous_rv == 0` skips the conflict check.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        key: ResourceKey,
        value: impl Into<Vec<u8>>,
        previous_rv: i64,
    ) -> Result<i64> {
        self.write_event(cancel, WriteEvent::modified(key, value, previous_rv))
            .await
    }

    /// Delete `key`. `previous_rv == 0` skips the conflict check.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        key: ResourceKey,
        previous_rv: i64,
    ) -> Result<i64> {
        self.write_event(cancel, WriteEvent::deleted(key, previous_rv))
            .await
    }

    /// Read the live value of `key` (`resource_version == 0`) or its value as
    /// of `resource_version`.
    #[tracing::instrument(name = "storage.read", skip(self, key), fields(key = %key))]
    pub async fn read_resource(&self, key: &ResourceKey, resource_version: i64) -> Result<ReadResponse> {
        key.validate().map_err(StorageError::BadRequest)?;

        let mut conn = self.pool.acquire().await.sql_context("acquire connection")?;
        let row = if resource_version > 0 {
            queries::read_history_at(&mut conn, self.dialect, key, resource_version).await?
        } else {
            queries::read_resource_row(&mut conn, self.dialect, key).await?
        };

        match row {
            Some(row) if row.action != Action::Deleted => Ok(ReadResponse {
                key: row.key,
                uid: row.uid,
                value: row.value,
                folder: row.folder,
                generation: row.generation,
                resource_version: row.resource_version,
            }),
            _ => Err(StorageError::not_found_key(key)),
        }
    }

    /// Open a cursor over a list request.
    pub async fn list_iterator(&self, request: &ListRequest) -> Result<ListIter> {
        ListIter::new(self.pool.clone(), self.dialect, request).await
    }

    /// One page of a list request.
    #[tracing::instrument(
        name = "storage.list",
        skip_all,
        fields(group = %request.options.key.group, resource = %request.options.key.resource, source = ?request.source)
    )]
    pub async fn list(&self, request: &ListRequest) -> Result<ListResponse> {
        let limit = if request.limit > 0 {
            request.limit
        } else {
            DEFAULT_LIST_LIMIT
        };
        let mut request = request.clone();
        request.limit = limit;

        let mut iter = self.list_iterator(&request).await?;
        let mut response = ListResponse::default();

        while iter.next().await {
            let Some(item) = iter.item() else { break };
            if request.options.has_filters() && !request.options.matches(item) {
                continue;
            }
            response.items.push(item.clone());

            if response.items.len() as i64 >= limit {
                let token = iter.continue_token();
                if iter.next().await {
                    response.next_page_token = token;
                }
                break;
            }
        }

        if let Some(e) = iter.error() {
            return Err(e.clone());
        }
        response.resource_version = iter.list_resource_version();
        Ok(response)
    }

    /// Latest history entry of every name in the bucket changed after `since`,
    /// together with the bucket's current version.
    pub async fn list_modified_since(
        &self,
        namespace: &str,
        group: &str,
        resource: &str,
        since: i64,
    ) -> Result<(i64, Vec<ModifiedResource>)> {
        if group.is_empty() || resource.is_empty() {
            return Err(StorageError::BadRequest(
                "group and resource are required".to_string(),
            ));
        }
        let bucket = BucketKey::new(group, resource);

        let mut tx = self.pool.begin().await.sql_context("begin list")?;
        let bucket_rv = queries::read_bucket_rv(&mut tx, self.dialect, &bucket).await?;
        let rows = queries::modified_since(&mut tx, self.dialect, namespace, &bucket, since).await?;
        tx.commit().await.sql_context("commit list")?;

        let modified = rows
            .into_iter()
            .map(|row| ModifiedResource {
                event_type: WatchEventType::from(row.action),
                key: row.key,
                value: row.value,
                resource_version: row.resource_version,
            })
            .collect();
        Ok((bucket_rv, modified))
    }

    /// Live row counts per (namespace, group, resource). An empty namespace
    /// covers every namespace.
    pub async fn resource_stats(&self, namespace: &str, min_count: i64) -> Result<Vec<ResourceStats>> {
        let mut conn = self.pool.acquire().await.sql_context("acquire connection")?;
        let counts = queries::count_resources(&mut conn, self.dialect, namespace, min_count).await?;
        let versions: std::collections::HashMap<BucketKey, i64> =
            queries::list_bucket_rvs(&mut conn, self.dialect).await?.into_iter().collect();

        Ok(counts
            .into_iter()
            .map(|(namespace, bucket, count)| ResourceStats {
                resource_version: versions.get(&bucket).copied().unwrap_or_default(),
                namespace,
                group: bucket.group,
                resource: bucket.resource,
                count,
            })
            .collect())
    }

    /// Stream committed writes until `cancel` fires or the backend stops.
    pub async fn watch_write_events(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<WrittenEvent>> {
        if self.shutdown.is_cancelled() {
            return Err(StorageError::Internal("backend is stopped".to_string()));
        }
        self.notifier.notify(cancel).await
    }

    /// Stop background tasks and close every watch stream.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self
            .gc_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Storage backend stopped");
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
