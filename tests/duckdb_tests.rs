//! Output stage against a real DuckDB database
#![cfg(feature = "duckdb-backend")]

use std::sync::Arc;

use serde_json::json;
use tag_sql_sink::{
    ChunkBuilder, DuckDbStore, EventTime, ImportOutcome, OutputCoordinator, SinkConfig,
    TableSection,
};

fn setup() -> Arc<DuckDbStore> {
    let store = DuckDbStore::in_memory().unwrap();
    store
        .execute_batch(
            "CREATE TABLE access_log (host VARCHAR NOT NULL, status INTEGER);
             CREATE TABLE events (message VARCHAR, level VARCHAR);",
        )
        .unwrap();
    Arc::new(store)
}

fn config() -> SinkConfig {
    SinkConfig::new("duckdb", ":memory:")
        .with_table(TableSection::new(
            Some("access.*"),
            "access_log",
            "host,code:status",
        ))
        .with_table(TableSection::new(None, "events", "message,level"))
}

#[tokio::test]
async fn test_routes_and_falls_back_on_constraint_violation() {
    let store = setup();
    let coordinator = OutputCoordinator::start(&config(), store.clone()).await.unwrap();

    let mut builder = ChunkBuilder::new("access.web");
    for record in [
        json!({"host": "a", "code": 200}),
        json!({"code": 500}),
        json!({"host": "c", "code": "404"}),
    ] {
        builder
            .push(EventTime::now(), record.as_object().unwrap())
            .unwrap();
    }

    let report = coordinator.handle(&builder.build()).await.unwrap();
    assert_eq!(report.table, "access_log");
    assert!(report.fallback);
    assert_eq!(report.imported, 2);
    assert_eq!(report.dropped_deterministic, 1);
    assert_eq!(report.outcome, ImportOutcome::PartialSuccess { dropped: 1 });

    let mut builder = ChunkBuilder::new("error.app");
    builder
        .push(
            EventTime::now(),
            json!({"message": "boom", "level": "error"}).as_object().unwrap(),
        )
        .unwrap();
    let report = coordinator.handle(&builder.build()).await.unwrap();
    assert_eq!(report.table, "events");
    assert_eq!(report.outcome, ImportOutcome::Success);

    coordinator.shutdown().await;
}
