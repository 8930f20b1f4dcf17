use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskq_rs::error::Error;
use taskq_rs::model::*;
use taskq_rs::status::StatusQuery;
use taskq_rs::store::{MemoryResultStore, ResultStore, spawn_reaper};
use tokio_util::sync::CancellationToken;

fn record() -> TaskRecord {
    TaskRecord::pending(&TaskEnvelope::new("add", vec![json!(2), json!(3)]))
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let store = MemoryResultStore::new(Duration::from_secs(60));
    let r = record();
    store.put(&r).await.unwrap();
    assert_eq!(store.get(r.task_id).await.unwrap(), Some(r));
}

#[tokio::test]
async fn unknown_id_reads_as_none() {
    let store = MemoryResultStore::new(Duration::from_secs(60));
    assert!(store.get(TaskId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn older_write_does_not_overwrite_newer() {
    let store = MemoryResultStore::new(Duration::from_secs(60));
    let pending = record();
    let started = pending.clone().transition(TaskStatus::Started, None).unwrap();

    store.put(&started).await.unwrap();
    store.put(&pending).await.unwrap();

    let stored = store.get(pending.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Started);
}

// ---------------------------------------------------------------------------
// TTL
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_records_are_invisible_and_purged() {
    let store = MemoryResultStore::new(Duration::from_millis(50));
    let r = record();
    store.put(&r).await.unwrap();
    assert!(store.get(r.task_id).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.get(r.task_id).await.unwrap().is_none());
    assert_eq!(store.len(), 1);

    assert_eq!(store.purge_expired().await.unwrap(), 1);
    assert!(store.is_empty());
}

#[tokio::test]
async fn reaper_purges_in_background_until_cancelled() {
    let store = Arc::new(MemoryResultStore::new(Duration::from_millis(20)));
    store.put(&record()).await.unwrap();

    let cancel = CancellationToken::new();
    let reaper = spawn_reaper(store.clone(), Duration::from_millis(30), cancel.clone());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(store.is_empty());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), reaper)
        .await
        .expect("reaper should stop on cancel")
        .unwrap();
}

// ---------------------------------------------------------------------------
// Transitions through the store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transition_validates_and_writes() {
    let store = MemoryResultStore::new(Duration::from_secs(60));
    let r = record();
    store.put(&r).await.unwrap();

    store
        .transition(r.task_id, TaskStatus::Started, None)
        .await
        .unwrap();
    let done = store
        .transition(
            r.task_id,
            TaskStatus::Success,
            Some(TaskResult::value(json!(5))),
        )
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Success);

    let again = store.transition(r.task_id, TaskStatus::Started, None).await;
    assert!(matches!(again, Err(Error::InvalidTransition { .. })));
    assert_eq!(
        store.get(r.task_id).await.unwrap().unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn transition_on_missing_record_is_not_found() {
    let store = MemoryResultStore::new(Duration::from_secs(60));
    let result = store
        .transition(TaskId::new(), TaskStatus::Started, None)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

// ---------------------------------------------------------------------------
// Status query
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_query_reports_status_and_result() {
    let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
    let r = record();
    let done = r
        .clone()
        .transition(TaskStatus::Started, None)
        .unwrap()
        .transition(TaskStatus::Success, Some(TaskResult::value(json!(5))))
        .unwrap();
    store.put(&done).await.unwrap();

    let query = StatusQuery::new(store);
    let report = query.get_status(r.task_id).await.unwrap().unwrap();
    assert_eq!(report.status, TaskStatus::Success);
    assert_eq!(report.result, Some(TaskResult::value(json!(5))));

    assert!(query.get_status(TaskId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn wait_terminal_gives_up_at_deadline() {
    let store = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
    let r = record();
    store.put(&r).await.unwrap();

    let query = StatusQuery::new(store);
    let report = query
        .wait_terminal(r.task_id, Duration::from_millis(60), Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, TaskStatus::Pending);
}
