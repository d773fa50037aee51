//! Create/update/delete statements executed inside a version batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::AnyConnection;
use tracing::warn;

use super::pruner::DebounceGroup;
use super::queries::{self, RowData};
use super::rvmanager::VersionedWrite;
use super::types::{Action, ResourceKey, WatchEventType, WriteEvent, WrittenEvent};
use super::{Dialect, Result, StorageError};
use crate::notifier::Notifier;

/// One write event on its way through the version manager.
pub(crate) struct WriteOp {
    dialect: Dialect,
    event: WriteEvent,
    guid: String,
    /// Version of the row this write replaced, recorded in history.
    replaced_rv: i64,
    replaced_guid: Option<String>,
    latency: Duration,
    notifier: Arc<dyn Notifier>,
    pruner: Option<Arc<DebounceGroup<ResourceKey>>>,
}

impl WriteOp {
    pub(crate) fn new(
        dialect: Dialect,
        event: WriteEvent,
        latency: Duration,
        notifier: Arc<dyn Notifier>,
        pruner: Option<Arc<DebounceGroup<ResourceKey>>>,
    ) -> Self {
        Self {
            dialect,
            event,
            guid: uuid::Uuid::new_v4().to_string(),
            replaced_rv: 0,
            replaced_guid: None,
            latency,
            notifier,
            pruner,
        }
    }

    /// Generation stored and announced for this write. Creates start at 1,
    /// deletions carry none.
    fn generation(&self) -> i64 {
        match self.event.event_type {
            WatchEventType::Added => self.event.generation.max(1),
            WatchEventType::Modified => self.event.generation,
            WatchEventType::Deleted => 0,
        }
    }

    fn row<'a>(&'a self, uid: &'a str, value: &'a [u8], action: Action, generation: i64) -> RowData<'a> {
        RowData {
            guid: &self.guid,
            uid,
            key: &self.event.key,
            folder: &self.event.folder,
            value,
            action,
            generation,
            previous_rv: self.replaced_rv,
        }
    }

    async fn create(&self, conn: &mut AnyConnection) -> Result<()> {
        if queries::read_live(conn, self.dialect, &self.event.key).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                key: self.event.key.clone(),
            });
        }

        let uid = uuid::Uuid::new_v4().to_string();
        let row = self.row(&uid, &self.event.value, Action::Created, self.generation());
        queries::insert_resource(conn, self.dialect, &row).await?;
        queries::insert_history(conn, self.dialect, &row, queries::now_micros()).await
    }

    async fn update(&mut self, conn: &mut AnyConnection) -> Result<()> {
        let key = &self.event.key;
        let expected = self.event.previous_rv;
        let live = queries::read_live(conn, self.dialect, key)
            .await?
            .ok_or_else(|| StorageError::not_found_key(key))?;
        if expected > 0 && live.resource_version != expected {
            return Err(StorageError::Conflict {
                key: key.clone(),
                expected,
            });
        }
        self.replaced_rv = live.resource_version;
        self.replaced_guid = Some(live.guid);

        let row = self.row(&live.uid, &self.event.value, Action::Updated, self.generation());
        match queries::update_resource(conn, self.dialect, &row, expected).await? {
            0 => {
                return Err(StorageError::Conflict {
                    key: key.clone(),
                    expected,
                })
            }
            1 => {}
            n => {
                return Err(StorageError::Internal(format!(
                    "update of {key} matched {n} rows"
                )))
            }
        }
        queries::insert_history(conn, self.dialect, &row, queries::now_micros()).await
    }

    async fn delete(&mut self, conn: &mut AnyConnection) -> Result<()> {
        let key = &self.event.key;
        let expected = self.event.previous_rv;
        let live = queries::read_live(conn, self.dialect, key)
            .await?
            .ok_or_else(|| StorageError::not_found_key(key))?;
        if expected > 0 && live.resource_version != expected {
            return Err(StorageError::Conflict {
                key: key.clone(),
                expected,
            });
        }
        self.replaced_rv = live.resource_version;
        self.replaced_guid = Some(live.guid);

        match queries::delete_resource(conn, self.dialect, key, expected).await? {
            0 => {
                return Err(StorageError::Conflict {
                    key: key.clone(),
                    expected,
                })
            }
            1 => {}
            n => {
                return Err(StorageError::Internal(format!(
                    "delete of {key} matched {n} rows"
                )))
            }
        }

        // The tombstone keeps the last value so trash listings can restore it.
        if self.event.value.is_empty() {
            self.event.value = live.value;
        }
        let row = self.row(&live.uid, &self.event.value, Action::Deleted, self.generation());
        queries::insert_history(conn, self.dialect, &row, queries::now_micros()).await
    }
}

#[async_trait]
impl VersionedWrite for WriteOp {
    async fn apply(&mut self, conn: &mut AnyConnection) -> Result<String> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.event.event_type {
            WatchEventType::Added => self.create(conn).await?,
            WatchEventType::Modified => self.update(conn).await?,
            WatchEventType::Deleted => self.delete(conn).await?,
        }
        Ok(self.guid.clone())
    }

    fn replaced_guid(&self) -> Option<&str> {
        self.replaced_guid.as_deref()
    }

    fn committed(&self, resource_version: i64, replaced_rv: Option<i64>) {
        self.notifier.send(WrittenEvent {
            event_type: self.event.event_type,
            key: self.event.key.clone(),
            value: self.event.value.clone(),
            previous_rv: replaced_rv.unwrap_or(self.replaced_rv),
            folder: self.event.folder.clone(),
            generation: self.generation(),
            resource_version,
        });

        if let Some(pruner) = &self.pruner {
            if let Err(e) = pruner.add(self.event.key.clone()) {
                warn!(key = %self.event.key, error = %e, "Prune request dropped");
            }
        }
    }
}
