//! Bulk import, fallback and retry behaviour against the in-memory store

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tag_sql_sink::{
    Chunk, ChunkBuilder, ErrorKind, EventTime, ImportOutcome, MemoryStore, OutputCoordinator,
    SinkConfig, SinkError, TableSection,
};

const BACKOFF: Duration = Duration::from_millis(500);

fn config(num_retries: u32) -> SinkConfig {
    let mut section = TableSection::new(None, "logs", "id,message:msg");
    section.num_retries = num_retries;
    SinkConfig::new("duckdb", ":memory:").with_table(section)
}

fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new().with_table("logs", &["id", "msg"]))
}

fn chunk(records: &[serde_json::Value]) -> Chunk {
    let mut builder = ChunkBuilder::new("app.events");
    for record in records {
        builder
            .push(EventTime::new(1_700_000_000, 0), record.as_object().unwrap())
            .unwrap();
    }
    builder.build()
}

fn ids(store: &MemoryStore) -> Vec<serde_json::Value> {
    store.rows("logs").iter().map(|r| r["id"].clone()).collect()
}

fn assert_elapsed(start: tokio::time::Instant, backoffs: u32) {
    let expected = BACKOFF * backoffs;
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected about {:?}, got {:?}",
        expected,
        elapsed
    );
}

#[tokio::test]
async fn test_malformed_entry_does_not_abort_batch() {
    let store = store();
    let coordinator = OutputCoordinator::start(&config(5), store.clone()).await.unwrap();

    let mut builder = ChunkBuilder::new("app.events");
    builder
        .push(EventTime::now(), json!({"id": 1, "message": "first"}).as_object().unwrap())
        .unwrap();
    builder
        .push_value(&rmpv::Value::from("not an entry"))
        .unwrap();
    builder
        .push(EventTime::now(), json!({"id": 3, "message": "third"}).as_object().unwrap())
        .unwrap();

    let report = coordinator.handle(&builder.build()).await.unwrap();

    assert_eq!(report.imported, 2);
    assert_eq!(report.malformed, 1);
    assert_eq!(report.outcome, ImportOutcome::PartialSuccess { dropped: 1 });
    assert!(!report.fallback);
    assert_eq!(ids(&store), vec![json!(1), json!(3)]);
}

#[tokio::test]
async fn test_deterministic_bulk_failure_imports_good_records() {
    let store = store();
    store.fail_rows_where("logs", ErrorKind::Deterministic, |row| {
        row.get("id") == Some(&json!(2)) || row.get("id") == Some(&json!(4))
    });
    let coordinator = OutputCoordinator::start(&config(5), store.clone()).await.unwrap();

    let records: Vec<_> = (1..=5).map(|id| json!({"id": id, "message": "m"})).collect();
    let report = coordinator.handle(&chunk(&records)).await.unwrap();

    assert!(report.fallback);
    assert_eq!(report.imported, 3);
    assert_eq!(report.dropped_deterministic, 2);
    assert_eq!(report.retries, 0);
    assert_eq!(ids(&store), vec![json!(1), json!(3), json!(5)]);
}

#[tokio::test]
async fn test_unknown_column_triggers_fallback() {
    let store = Arc::new(MemoryStore::new().with_table("logs", &["id"]));
    let coordinator = OutputCoordinator::start(&config(5), store.clone()).await.unwrap();

    let report = coordinator
        .handle(&chunk(&[json!({"id": 1}), json!({"id": 2, "message": "no msg column"})]))
        .await
        .unwrap();

    assert!(report.fallback);
    assert_eq!(report.imported, 1);
    assert_eq!(report.dropped_deterministic, 1);
}

#[tokio::test]
async fn test_record_with_no_mapped_field_keeps_bulk_path() {
    let store = store();
    let coordinator = OutputCoordinator::start(&config(5), store.clone()).await.unwrap();

    let report = coordinator
        .handle(&chunk(&[
            json!({"id": 1, "message": "a"}),
            json!({"other": true}),
            json!({"id": 3}),
        ]))
        .await
        .unwrap();

    assert_eq!(report.outcome, ImportOutcome::Success);
    assert_eq!(report.imported, 3);
    assert!(!report.fallback);
    assert_eq!(store.insert_calls("logs"), 1);
    assert_eq!(store.rows("logs").len(), 3);
    assert_eq!(store.rows("logs")[2]["id"], json!(3));
}

#[tokio::test]
async fn test_fallback_disabled_propagates_error() {
    let store = store();
    store.fail_next("logs", ErrorKind::Deterministic, 1);
    let config = SinkConfig {
        enable_fallback: false,
        ..config(5)
    };
    let coordinator = OutputCoordinator::start(&config, store.clone()).await.unwrap();

    let result = coordinator.handle(&chunk(&[json!({"id": 1})])).await;
    assert!(matches!(result, Err(SinkError::Import { .. })));
    assert_eq!(store.insert_calls("logs"), 1);
}

#[tokio::test]
async fn test_bulk_transient_failure_is_not_retried() {
    let store = store();
    store.fail_next("logs", ErrorKind::Transient, 1);
    let coordinator = OutputCoordinator::start(&config(5), store.clone()).await.unwrap();

    let result = coordinator.handle(&chunk(&[json!({"id": 1})])).await;
    match result {
        Err(SinkError::Import { source, .. }) => assert_eq!(source.kind(), ErrorKind::Transient),
        other => panic!("expected import error, got {:?}", other),
    }
    assert_eq!(store.insert_calls("logs"), 1);

    // re-delivery succeeds
    coordinator.handle(&chunk(&[json!({"id": 1})])).await.unwrap();
    assert_eq!(ids(&store), vec![json!(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_record_dropped_after_max_retries() {
    let max_retries = 3;
    let store = store();
    store.fail_next("logs", ErrorKind::Deterministic, 1);
    store.fail_next("logs", ErrorKind::Transient, max_retries as usize + 1);
    let coordinator = OutputCoordinator::start(&config(max_retries), store.clone())
        .await
        .unwrap();

    let start = tokio::time::Instant::now();
    let report = coordinator
        .handle(&chunk(&[json!({"id": 1}), json!({"id": 2})]))
        .await
        .unwrap();

    assert_eq!(report.dropped_exhausted, 1);
    assert_eq!(report.imported, 1);
    assert_eq!(report.retries, max_retries);
    assert_eq!(report.outcome, ImportOutcome::PartialSuccess { dropped: 1 });
    // bulk, first record (1 + max_retries attempts), second record
    assert_eq!(store.insert_calls("logs"), 1 + (max_retries as usize + 1) + 1);
    assert_eq!(ids(&store), vec![json!(2)]);
    assert_elapsed(start, max_retries);
}

#[tokio::test(start_paused = true)]
async fn test_transient_record_recovers_within_budget() {
    let store = store();
    store.fail_next("logs", ErrorKind::Deterministic, 1);
    store.fail_next("logs", ErrorKind::Transient, 2);
    let coordinator = OutputCoordinator::start(&config(5), store.clone()).await.unwrap();

    let start = tokio::time::Instant::now();
    let report = coordinator.handle(&chunk(&[json!({"id": 7})])).await.unwrap();

    assert_eq!(report.outcome, ImportOutcome::Success);
    assert_eq!(report.imported, 1);
    assert_eq!(report.retries, 2);
    assert_eq!(ids(&store), vec![json!(7)]);
    assert_elapsed(start, 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_drops_on_first_transient_failure() {
    let store = store();
    store.fail_next("logs", ErrorKind::Deterministic, 1);
    store.fail_next("logs", ErrorKind::Transient, 1);
    let coordinator = OutputCoordinator::start(&config(0), store.clone()).await.unwrap();

    let start = tokio::time::Instant::now();
    let report = coordinator.handle(&chunk(&[json!({"id": 1})])).await.unwrap();

    assert_eq!(report.dropped_exhausted, 1);
    assert_eq!(report.retries, 0);
    assert_eq!(report.outcome, ImportOutcome::PartialSuccess { dropped: 1 });
    assert_elapsed(start, 0);
}
