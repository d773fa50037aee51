use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::storage::queries::{self, RowData};
use crate::storage::types::Action;
use crate::test_utils::{count_rows, memory_pool};

/// Appends one history row for `key` and records the version it committed with.
struct AppendHistory {
    key: ResourceKey,
    guid: String,
    delay: Duration,
    committed_rv: Arc<AtomicI64>,
}

impl AppendHistory {
    fn new(key: &ResourceKey) -> Self {
        Self {
            key: key.clone(),
            guid: uuid::Uuid::new_v4().to_string(),
            delay: Duration::ZERO,
            committed_rv: Arc::new(AtomicI64::new(0)),
        }
    }
}

#[async_trait]
impl VersionedWrite for AppendHistory {
    async fn apply(&mut self, conn: &mut AnyConnection) -> Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let row = RowData {
            guid: &self.guid,
            uid: "uid",
            key: &self.key,
            folder: "",
            value: b"{}",
            action: Action::Created,
            generation: 1,
            previous_rv: 0,
        };
        queries::insert_history(conn, Dialect::Sqlite, &row, queries::now_micros()).await?;
        Ok(self.guid.clone())
    }

    fn committed(&self, rv: i64, _replaced_rv: Option<i64>) {
        self.committed_rv.store(rv, Ordering::SeqCst);
    }
}

struct FailingWrite;

#[async_trait]
impl VersionedWrite for FailingWrite {
    async fn apply(&mut self, _conn: &mut AnyConnection) -> Result<String> {
        Err(StorageError::Internal("boom".to_string()))
    }
}

async fn manager() -> (ResourceVersionManager, AnyPool) {
    manager_with(RvManagerConfig::default()).await
}

async fn manager_with(config: RvManagerConfig) -> (ResourceVersionManager, AnyPool) {
    let pool = memory_pool().await;
    let rvm = ResourceVersionManager::new(RvManagerOptions {
        pool: Some(pool.clone()),
        dialect: Some(Dialect::Sqlite),
        config,
    })
    .unwrap();
    (rvm, pool)
}

fn key(name: &str) -> ResourceKey {
    ResourceKey::new("default", "apps", "deployments", name)
}

#[test]
fn test_config_default() {
    let config = RvManagerConfig::default();
    assert_eq!(config.max_batch_size, 25);
    assert_eq!(config.queue_capacity, 1000);
}

#[tokio::test]
async fn test_new_requires_pool_and_dialect() {
    let err = ResourceVersionManager::new(RvManagerOptions {
        pool: None,
        dialect: Some(Dialect::Sqlite),
        config: RvManagerConfig::default(),
    })
    .err()
    .expect("missing pool must fail");
    assert!(matches!(err, StorageError::Internal(_)));

    let pool = memory_pool().await;
    let result = ResourceVersionManager::new(RvManagerOptions {
        pool: Some(pool),
        dialect: None,
        config: RvManagerConfig::default(),
    });
    assert!(result.is_err());
}

#[tokio::test]
async fn test_sequential_writes_increase() {
    let (rvm, _pool) = manager().await;
    let cancel = CancellationToken::new();

    let mut last = 0;
    for i in 0..5 {
        let k = key(&format!("item-{i}"));
        let rv = rvm
            .exec_with_rv(&cancel, &k, Box::new(AppendHistory::new(&k)))
            .await
            .unwrap();
        assert!(rv > last, "rv {rv} not greater than {last}");
        last = rv;
    }
}

#[tokio::test]
async fn test_concurrent_writes_get_unique_ordered_versions() {
    let (rvm, pool) = manager_with(RvManagerConfig {
        max_batch_size: 5,
        ..Default::default()
    })
    .await;
    let cancel = CancellationToken::new();

    let writes: Vec<_> = (0..20).map(|i| key(&format!("item-{i}"))).collect();
    let futures = writes.iter().map(|k| {
        let write = AppendHistory::new(k);
        rvm.exec_with_rv(&cancel, k, Box::new(write))
    });
    let versions: Vec<i64> = futures::future::join_all(futures)
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();

    // Submission order is the vector order; versions follow it strictly.
    for pair in versions.windows(2) {
        assert!(pair[0] < pair[1], "{versions:?}");
    }

    let pending = count_rows(&pool, "resource_history", "resource_version = 0").await;
    assert_eq!(pending, 0);

    let last = *versions.last().unwrap();
    let stored = count_rows(
        &pool,
        "resource_version",
        &format!("\"group\" = 'apps' AND resource_version = {last}"),
    )
    .await;
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn test_buckets_are_independent() {
    let (rvm, _pool) = manager().await;
    let cancel = CancellationToken::new();

    let a = ResourceKey::new("ns", "apps", "deployments", "a");
    let b = ResourceKey::new("ns", "core", "configmaps", "b");
    let rv_a = rvm
        .exec_with_rv(&cancel, &a, Box::new(AppendHistory::new(&a)))
        .await
        .unwrap();
    let rv_b = rvm
        .exec_with_rv(&cancel, &b, Box::new(AppendHistory::new(&b)))
        .await
        .unwrap();
    assert!(rv_a > 0);
    assert!(rv_b > 0);
}

#[tokio::test]
async fn test_committed_hook_sees_assigned_version() {
    let (rvm, _pool) = manager().await;
    let cancel = CancellationToken::new();
    let k = key("hooked");
    let write = AppendHistory::new(&k);
    let seen = write.committed_rv.clone();

    let rv = rvm.exec_with_rv(&cancel, &k, Box::new(write)).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), rv);
}

#[tokio::test]
async fn test_failed_write_aborts_whole_batch() {
    let (rvm, pool) = manager().await;
    let cancel = CancellationToken::new();

    let before = rvm
        .exec_with_rv(&cancel, &key("seed"), Box::new(AppendHistory::new(&key("seed"))))
        .await
        .unwrap();

    // Queued from one task before the processor runs: one batch.
    let k1 = key("one");
    let k2 = key("two");
    let results = futures::future::join3(
        rvm.exec_with_rv(&cancel, &k1, Box::new(AppendHistory::new(&k1))),
        rvm.exec_with_rv(&cancel, &k1, Box::new(FailingWrite)),
        rvm.exec_with_rv(&cancel, &k2, Box::new(AppendHistory::new(&k2))),
    )
    .await;
    assert!(results.0.is_err());
    assert!(results.1.is_err());
    assert!(results.2.is_err());

    let rows = count_rows(&pool, "resource_history", "name IN ('one', 'two')").await;
    assert_eq!(rows, 0, "no partial batch commit");

    let after = rvm
        .exec_with_rv(&cancel, &k2, Box::new(AppendHistory::new(&k2)))
        .await
        .unwrap();
    assert!(after > before);
}

#[tokio::test]
async fn test_missing_group_is_rejected() {
    let (rvm, _pool) = manager().await;
    let k = ResourceKey::new("ns", "", "deployments", "x");
    let err = rvm
        .exec_with_rv(&CancellationToken::new(), &k, Box::new(AppendHistory::new(&k)))
        .await
        .unwrap_err();
    assert!(err.is_bad_request());
}

#[tokio::test]
async fn test_cancelled_before_submit() {
    let (rvm, pool) = manager().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let k = key("never");
    let err = rvm
        .exec_with_rv(&cancel, &k, Box::new(AppendHistory::new(&k)))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Cancelled));
    assert_eq!(count_rows(&pool, "resource_history", "name = 'never'").await, 0);
}

#[tokio::test]
async fn test_cancelled_waiter_does_not_abort_batch() {
    let (rvm, pool) = manager().await;
    let rvm = Arc::new(rvm);
    let cancel = CancellationToken::new();

    let k = key("slow");
    let mut write = AppendHistory::new(&k);
    write.delay = Duration::from_millis(100);

    let waiter = {
        let rvm = rvm.clone();
        let cancel = cancel.clone();
        let k = k.clone();
        tokio::spawn(async move { rvm.exec_with_rv(&cancel, &k, Box::new(write)).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, StorageError::Cancelled));

    // The batch still commits and later writes keep increasing.
    let other = key("after");
    let rv = rvm
        .exec_with_rv(&CancellationToken::new(), &other, Box::new(AppendHistory::new(&other)))
        .await
        .unwrap();
    assert!(rv > 0);
    assert_eq!(
        count_rows(&pool, "resource_history", "name = 'slow' AND resource_version > 0").await,
        1
    );
}

async fn write_one(rvm: &ResourceVersionManager, name: &str) -> i64 {
    let k = key(name);
    rvm.exec_with_rv(&CancellationToken::new(), &k, Box::new(AppendHistory::new(&k)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_lost_counter_falls_back_to_clock() {
    let (rvm, pool) = manager().await;

    let before = write_one(&rvm, "first").await;
    sqlx::query("DELETE FROM resource_version")
        .execute(&pool)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let after = write_one(&rvm, "second").await;
    assert!(after > before, "{after} not greater than {before}");
}

#[tokio::test]
async fn test_reset_counter_falls_back_to_clock() {
    let (rvm, pool) = manager().await;

    let before = write_one(&rvm, "first").await;
    sqlx::query("UPDATE resource_version SET resource_version = 0")
        .execute(&pool)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let after = write_one(&rvm, "second").await;
    assert!(after > before, "{after} not greater than {before}");
}

#[tokio::test]
async fn test_counter_ahead_of_clock_increments() {
    let (rvm, pool) = manager().await;

    write_one(&rvm, "first").await;
    let locked = queries::now_micros() + 1_000_000_000_000;
    sqlx::query(&format!(
        "UPDATE resource_version SET resource_version = {locked}"
    ))
    .execute(&pool)
    .await
    .unwrap();

    assert_eq!(write_one(&rvm, "second").await, locked + 1);
    assert_eq!(write_one(&rvm, "third").await, locked + 2);
}

fn assert_send<T: Send>(_: T) {}

/// Batch processors and pruning run on spawned tasks, writes behind `async_trait`.
#[tokio::test]
async fn test_statement_futures_are_send() {
    use crate::storage::pruner::HistoryPruner;

    let pool = memory_pool().await;
    let k = key("send");
    let row = RowData {
        guid: "guid",
        uid: "uid",
        key: &k,
        folder: "",
        value: b"{}",
        action: Action::Updated,
        generation: 1,
        previous_rv: 0,
    };

    let mut conn = pool.acquire().await.unwrap();
    assert_send(queries::update_resource(&mut conn, Dialect::Sqlite, &row, 0));
    assert_send(queries::delete_resource(&mut conn, Dialect::Sqlite, &k, 0));
    assert_send(queries::history_since(&mut conn, Dialect::Sqlite, &k.bucket(), 0, 10));
    drop(conn);

    let pruner = HistoryPruner::new(pool.clone(), Dialect::Sqlite, 2);
    assert_send(pruner.prune(&k));

    let (_tx, rx) = mpsc::channel(1);
    let processor = BatchProcessor {
        bucket: k.bucket(),
        pool,
        dialect: Dialect::Sqlite,
        max_batch_size: 1,
    };
    assert_send(processor.run(rx));
}
