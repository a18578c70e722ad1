mod support;

use chrono::Duration;
use flowlogd::upstream::{FlowDirection, object_key};
use flowlogd::{
    ArchivePurger, ArchivingCollector, Clock, CycleOutcome, FlowLogCollector, FlowlogNode,
    FsArchive, InMemoryCoordinationBackend, ManualClock, ProgressRecord,
};
use serde_json::Value;
use std::sync::Arc;
use support::{CannedSource, StaticAccounts, account, hours, t0, test_config};
use tempfile::tempdir;
use tokio_test::assert_ok;

fn archive_at(root: &std::path::Path, clock: Arc<ManualClock>) -> FsArchive {
    FsArchive::new(root, Duration::days(7), clock)
}

#[tokio::test]
async fn test_collector_archives_both_directions_per_window() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let archive = archive_at(dir.path(), clock.clone());
    let source = Arc::new(CannedSource::default());
    let collector = ArchivingCollector::new(source.clone(), archive.clone(), hours(1), clock);

    let start = t0() - hours(5);
    let end = collector
        .collect_logs("acc-1", "flowlogs-acc-1", Some(start))
        .await
        .unwrap();
    assert_eq!(end, start + hours(1));

    let directions: Vec<_> = source
        .requests
        .lock()
        .await
        .iter()
        .map(|(_, window, direction)| {
            assert_eq!((window.start, window.end), (start, end));
            *direction
        })
        .collect();
    assert_eq!(
        directions,
        vec![FlowDirection::Destination, FlowDirection::Source]
    );

    let body = archive
        .get_object("flowlogs-acc-1", &object_key("flowlogs-acc-1", &start))
        .await
        .unwrap()
        .expect("object stored");
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["log_data"].as_array().unwrap().len(), 2);
    assert_eq!(body["log_data"][1]["direction"], "sourcevn");
}

#[tokio::test]
async fn test_recollecting_a_window_is_idempotent() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let archive = archive_at(dir.path(), clock.clone());
    let collector = ArchivingCollector::new(
        Arc::new(CannedSource::default()),
        archive.clone(),
        hours(1),
        clock.clone(),
    );
    let start = t0() - hours(2);

    let first = collector
        .collect_logs("acc-1", "flowlogs-acc-1", Some(start))
        .await
        .unwrap();
    let first_body = archive
        .get_object("flowlogs-acc-1", &object_key("flowlogs-acc-1", &start))
        .await
        .unwrap();

    clock.advance(hours(3));
    let second = collector
        .collect_logs("acc-1", "flowlogs-acc-1", Some(start))
        .await
        .unwrap();
    let second_body = archive
        .get_object("flowlogs-acc-1", &object_key("flowlogs-acc-1", &start))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first_body, second_body);
    assert_eq!(
        archive.list_objects("flowlogs-acc-1").await.unwrap().unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_collection_without_cursor_uses_lookback_window() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let archive = archive_at(dir.path(), clock.clone());
    let collector =
        ArchivingCollector::new(Arc::new(CannedSource::default()), archive.clone(), hours(1), clock);

    let end = collector
        .collect_logs("acc-1", "flowlogs-acc-1", None)
        .await
        .unwrap();
    assert_eq!(end, t0());
    assert_eq!(
        archive.list_objects("flowlogs-acc-1").await.unwrap().unwrap(),
        vec![object_key("flowlogs-acc-1", &(t0() - hours(1)))]
    );
}

#[tokio::test]
async fn test_purge_removes_only_expired_objects() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let archive = archive_at(dir.path(), clock.clone());
    let acc = account("acc-1");

    let keys = [
        object_key(&acc.bucket_name, &(t0() - Duration::days(9))),
        object_key(&acc.bucket_name, &(t0() - Duration::days(7))),
        object_key(&acc.bucket_name, &(t0() - Duration::days(6))),
    ];
    for key in &keys {
        archive.put_object(&acc.bucket_name, key, b"{}").await.unwrap();
    }
    archive
        .put_object(&acc.bucket_name, "README", b"kept")
        .await
        .unwrap();

    assert_eq!(archive.purge_old_objects(&acc).await.unwrap(), 2);
    assert_eq!(
        archive.list_objects(&acc.bucket_name).await.unwrap().unwrap(),
        vec!["README".to_string(), keys[2].clone()]
    );

    // Repeating is harmless.
    assert_eq!(archive.purge_old_objects(&acc).await.unwrap(), 0);
    // A bucket nobody wrote to yet is not an error.
    assert_eq!(archive.purge_old_objects(&account("acc-2")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_node_collects_accounts_end_to_end() {
    let dir = tempdir().unwrap();
    let config = test_config("node-a").worker_concurrency(2);
    let clock = Arc::new(ManualClock::new(t0()));
    let archive = archive_at(dir.path(), clock.clone());
    let collector = ArchivingCollector::new(
        Arc::new(CannedSource::default()),
        archive.clone(),
        config.collection_window_duration(),
        clock.clone(),
    );
    let backend = InMemoryCoordinationBackend::new();
    let cursor = t0() - hours(4);
    let node = FlowlogNode::assemble(
        &config,
        Arc::new(backend.clone()),
        Arc::new(StaticAccounts::new(vec![account("acc-1"), account("acc-2")])),
        Arc::new(collector),
        Arc::new(archive.clone()),
        clock.clone() as Arc<dyn Clock>,
    );
    node.store
        .set(
            &node.coordinator.paths().account("acc-1"),
            &ProgressRecord::new(cursor, "node-b"),
        )
        .await
        .unwrap();
    let paths = node.coordinator.paths().clone();
    let store = node.store.clone();

    let outcome = assert_ok!(node.coordinator.run_collect_cycle().await);
    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    assert_ok!(node.drain().await);

    // acc-1 was four windows behind: the catch-up chain walks it up to now.
    let acc1 = store.get(&paths.account("acc-1")).await.unwrap().unwrap();
    assert_eq!(acc1, ProgressRecord::new(t0(), "node-a"));
    assert_eq!(
        archive.list_objects("flowlogs-acc-1").await.unwrap().unwrap().len(),
        4
    );

    // acc-2 had no cursor and got the lookback window ending now.
    let acc2 = store.get(&paths.account("acc-2")).await.unwrap().unwrap();
    assert_eq!(acc2, ProgressRecord::new(t0(), "node-a"));
    assert_eq!(backend.record_paths().await.len(), 3);
}
