//! Backend contract tests.
//!
//! Every test writes to its own (group, resource) bucket so all of them can
//! share one backend and one database.

use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use unistore::storage::{
    Backend, ListOptions, ListRequest, ListSource, Operator, Requirement, ResourceKey,
    VersionMatch, WatchEventType, WrittenEvent,
};

const GROUP: &str = "test.unistore.dev";

fn key(resource: &str, name: &str) -> ResourceKey {
    ResourceKey::new("default", GROUP, resource, name)
}

fn list(resource: &str, limit: i64) -> ListRequest {
    ListRequest {
        options: ListOptions::for_bucket(GROUP, resource),
        limit,
        ..Default::default()
    }
}

fn labeled(name: &str, team: &str) -> Vec<u8> {
    serde_json::json!({"metadata": {"name": name, "labels": {"team": team}}})
        .to_string()
        .into_bytes()
}

/// Next event of `resource`, skipping writes of other tests.
async fn next_event(rx: &mut mpsc::Receiver<WrittenEvent>, resource: &str) -> WrittenEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for watch event")
            .expect("watch stream closed");
        if event.key.resource == resource {
            return event;
        }
    }
}

// =============================================================================
// Write path
// =============================================================================

pub async fn test_create_read_update_delete(backend: &Backend) {
    let cancel = CancellationToken::new();
    let k = key("test_crud", "item");

    let rv1 = backend.create(&cancel, k.clone(), "v1").await.expect("create should succeed");
    let read = backend.read_resource(&k, 0).await.expect("read should succeed");
    assert_eq!(read.value, b"v1".to_vec());
    assert_eq!(read.resource_version, rv1);

    let rv2 = backend
        .update(&cancel, k.clone(), "v2", rv1)
        .await
        .expect("update should succeed");
    assert!(rv2 > rv1, "versions must increase");

    let rv3 = backend.delete(&cancel, k.clone(), rv2).await.expect("delete should succeed");
    assert!(rv3 > rv2, "versions must increase");

    assert!(backend.read_resource(&k, 0).await.unwrap_err().is_not_found());
    assert_eq!(backend.read_resource(&k, rv2).await.unwrap().value, b"v2".to_vec());
}

pub async fn test_optimistic_concurrency(backend: &Backend) {
    let cancel = CancellationToken::new();
    let k = key("test_occ", "item");

    let rv1 = backend.create(&cancel, k.clone(), "v1").await.unwrap();
    backend.update(&cancel, k.clone(), "v2", rv1).await.unwrap();

    let stale = backend.update(&cancel, k.clone(), "v3", rv1).await;
    assert!(stale.unwrap_err().is_conflict(), "stale update should conflict");

    let stale = backend.delete(&cancel, k.clone(), rv1).await;
    assert!(stale.unwrap_err().is_conflict(), "stale delete should conflict");

    let again = backend.create(&cancel, k.clone(), "dup").await;
    assert!(again.is_err(), "create of a live key should fail");
}

pub async fn test_concurrent_writes_get_distinct_versions(backend: &Backend) {
    let cancel = CancellationToken::new();
    let writes = (0..20).map(|i| {
        let cancel = cancel.clone();
        async move {
            backend
                .create(&cancel, key("test_concurrent", &format!("item-{i:02}")), "{}")
                .await
        }
    });

    let mut versions: Vec<i64> = join_all(writes)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .expect("all creates should succeed");
    versions.sort_unstable();
    versions.dedup();
    assert_eq!(versions.len(), 20, "every write gets its own version");

    let page = backend.list(&list("test_concurrent", 0)).await.unwrap();
    assert_eq!(page.items.len(), 20);
    assert_eq!(page.resource_version, *versions.last().unwrap());
}

// =============================================================================
// Lists
// =============================================================================

pub async fn test_paginate_with_tokens(backend: &Backend) {
    let cancel = CancellationToken::new();
    for i in 0..7 {
        backend
            .create(&cancel, key("test_pages", &format!("item-{i}")), "{}")
            .await
            .unwrap();
    }

    let mut req = list("test_pages", 3);
    let mut names = Vec::new();
    let mut pages = 0;
    let mut pinned = None;
    loop {
        let page = backend.list(&req).await.expect("list should succeed");
        pages += 1;
        names.extend(page.items.iter().map(|i| i.key.name.clone()));
        assert_eq!(*pinned.get_or_insert(page.resource_version), page.resource_version);
        if page.next_page_token.is_empty() {
            break;
        }
        req.next_page_token = page.next_page_token;
    }

    assert_eq!(pages, 3);
    let expected: Vec<String> = (0..7).map(|i| format!("item-{i}")).collect();
    assert_eq!(names, expected);
}

pub async fn test_list_at_past_version(backend: &Backend) {
    let cancel = CancellationToken::new();
    let a = backend.create(&cancel, key("test_past", "a"), "a1").await.unwrap();
    backend.update(&cancel, key("test_past", "a"), "a2", a).await.unwrap();
    backend.create(&cancel, key("test_past", "b"), "b1").await.unwrap();

    let mut req = list("test_past", 0);
    req.resource_version = a;
    let page = backend.list(&req).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].value, b"a1".to_vec());
    assert_eq!(page.resource_version, a);
}

pub async fn test_label_filter(backend: &Backend) {
    let cancel = CancellationToken::new();
    for (name, team) in [("a", "red"), ("b", "blue"), ("c", "red")] {
        backend
            .create(&cancel, key("test_labels", name), labeled(name, team))
            .await
            .unwrap();
    }

    let mut req = list("test_labels", 0);
    req.options.labels = vec![Requirement::new("team", Operator::In, vec!["red".into()])];
    let page = backend.list(&req).await.unwrap();
    let names: Vec<_> = page.items.iter().map(|i| i.key.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);
}

pub async fn test_history_and_trash(backend: &Backend) {
    let cancel = CancellationToken::new();
    let k = key("test_history", "item");

    let rv1 = backend.create(&cancel, k.clone(), "v1").await.unwrap();
    let rv2 = backend.update(&cancel, k.clone(), "v2", rv1).await.unwrap();

    let mut req = list("test_history", 0);
    req.options.key.name = "item".to_string();
    req.source = ListSource::History;
    let history = backend.list(&req).await.unwrap();
    let versions: Vec<i64> = history.items.iter().map(|i| i.resource_version).collect();
    assert_eq!(versions, vec![rv2, rv1]);

    req.version_match = VersionMatch::NotOlderThan;
    req.resource_version = rv1;
    let ascending = backend.list(&req).await.unwrap();
    let versions: Vec<i64> = ascending.items.iter().map(|i| i.resource_version).collect();
    assert_eq!(versions, vec![rv1, rv2]);

    let deleted = backend.delete(&cancel, k.clone(), rv2).await.unwrap();
    let mut trash = list("test_history", 0);
    trash.source = ListSource::Trash;
    let page = backend.list(&trash).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].resource_version, deleted);
    assert_eq!(page.items[0].value, b"v2".to_vec());
}

pub async fn test_modified_since(backend: &Backend) {
    let cancel = CancellationToken::new();
    let a = backend.create(&cancel, key("test_modified", "a"), "a1").await.unwrap();
    let baseline = backend.create(&cancel, key("test_modified", "b"), "b1").await.unwrap();
    let a2 = backend.update(&cancel, key("test_modified", "a"), "a2", a).await.unwrap();

    let (rv, modified) = backend
        .list_modified_since("default", GROUP, "test_modified", baseline)
        .await
        .unwrap();
    assert_eq!(rv, a2);
    assert_eq!(modified.len(), 1);
    assert_eq!(modified[0].key.name, "a");
    assert_eq!(modified[0].event_type, WatchEventType::Modified);
    assert_eq!(modified[0].resource_version, a2);
}

pub async fn test_resource_stats(backend: &Backend) {
    let cancel = CancellationToken::new();
    for name in ["a", "b", "c"] {
        backend
            .create(&cancel, ResourceKey::new("stats-ns", GROUP, "test_stats", name), "{}")
            .await
            .unwrap();
    }

    let stats = backend.resource_stats("stats-ns", 0).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].resource, "test_stats");
    assert_eq!(stats[0].count, 3);
    assert!(stats[0].resource_version > 0);
}

// =============================================================================
// Watch and background work
// =============================================================================

pub async fn test_watch(backend: &Backend) {
    let cancel = CancellationToken::new();
    let mut rx = backend.watch_write_events(cancel.clone()).await.expect("watch should open");

    let resource = "test_watch";
    let rv1 = backend.create(&cancel, key(resource, "item"), "v1").await.unwrap();
    let rv2 = backend.update(&cancel, key(resource, "item"), "v2", rv1).await.unwrap();
    let rv3 = backend.delete(&cancel, key(resource, "item"), rv2).await.unwrap();

    let added = next_event(&mut rx, resource).await;
    assert_eq!((added.event_type, added.resource_version), (WatchEventType::Added, rv1));
    let modified = next_event(&mut rx, resource).await;
    assert_eq!(
        (modified.event_type, modified.resource_version, modified.previous_rv),
        (WatchEventType::Modified, rv2, rv1)
    );
    let deleted = next_event(&mut rx, resource).await;
    assert_eq!(
        (deleted.event_type, deleted.resource_version, deleted.previous_rv),
        (WatchEventType::Deleted, rv3, rv2)
    );

    cancel.cancel();
}

pub async fn test_garbage_collection(backend: &Backend) {
    let cancel = CancellationToken::new();
    let gone = key("test_gc", "gone");
    let kept = key("test_gc", "kept");

    let rv = backend.create(&cancel, gone.clone(), "v").await.unwrap();
    backend.delete(&cancel, gone.clone(), rv).await.unwrap();
    let rv = backend.create(&cancel, kept.clone(), "v").await.unwrap();
    backend.delete(&cancel, kept.clone(), rv).await.unwrap();
    backend.create(&cancel, kept.clone(), "again").await.unwrap();

    let cutoff = chrono::Utc::now().timestamp_micros() + 60_000_000;
    let deleted = backend
        .garbage_collector()
        .collect_bucket(&gone.bucket(), cutoff, 1, &CancellationToken::new())
        .await
        .expect("collection should succeed");
    assert_eq!(deleted, 2, "only the deleted, not recreated name is collected");

    let mut history = list("test_gc", 0);
    history.options.key.name = "kept".to_string();
    history.source = ListSource::History;
    assert_eq!(backend.list(&history).await.unwrap().items.len(), 1);
}

/// Run all Backend contract tests against a backend.
#[macro_export]
macro_rules! run_backend_tests {
    ($backend:expr) => {
        use $crate::storage::backend_tests::*;

        test_create_read_update_delete($backend).await;
        println!("  test_create_read_update_delete: PASSED");

        test_optimistic_concurrency($backend).await;
        println!("  test_optimistic_concurrency: PASSED");

        test_concurrent_writes_get_distinct_versions($backend).await;
        println!("  test_concurrent_writes_get_distinct_versions: PASSED");

        test_paginate_with_tokens($backend).await;
        println!("  test_paginate_with_tokens: PASSED");

        test_list_at_past_version($backend).await;
        println!("  test_list_at_past_version: PASSED");

        test_label_filter($backend).await;
        println!("  test_label_filter: PASSED");

        test_history_and_trash($backend).await;
        println!("  test_history_and_trash: PASSED");

        test_modified_since($backend).await;
        println!("  test_modified_since: PASSED");

        test_resource_stats($backend).await;
        println!("  test_resource_stats: PASSED");

        test_watch($backend).await;
        println!("  test_watch: PASSED");

        test_garbage_collection($backend).await;
        println!("  test_garbage_collection: PASSED");
    };
}
