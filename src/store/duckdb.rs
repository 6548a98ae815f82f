//! DuckDB store implementation
//!
//! Embedded database, either file-based or in-memory. The connection is held
//! behind a mutex; calls never overlap anyway since the output stage awaits
//! one insert at a time.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use duckdb::types::Value;
use serde_json::Value as JsonValue;

use super::{
    ColumnInfo, RecordStore, Row, StoreError, StoreResult, TableDescriptor, TableName,
    build_insert,
};

/// DuckDB error categories that recur on retry
const DETERMINISTIC_PREFIXES: &[&str] = &[
    "Binder Error",
    "Parser Error",
    "Catalog Error",
    "Constraint Error",
    "Conversion Error",
    "Invalid Input Error",
    "Syntax Error",
    "Not implemented Error",
    "Out of Range Error",
    "Mismatch Type Error",
];

/// DuckDB store
pub struct DuckDbStore {
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    connection: Mutex<duckdb::Connection>,
}

impl DuckDbStore {
    /// Open (or create) a file-based database
    pub fn new(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let connection = duckdb::Connection::open(&path)
            .map_err(|e| StoreError::transient(format!("Failed to open DuckDB: {}", e)))?;

        Ok(Self {
            db_path: Some(path),
            connection: Mutex::new(connection),
        })
    }

    pub fn in_memory() -> StoreResult<Self> {
        let connection = duckdb::Connection::open_in_memory().map_err(|e| {
            StoreError::transient(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: None,
            connection: Mutex::new(connection),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Execute SQL statements directly, e.g. to create tables
    pub fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        self.lock()?.execute_batch(sql).map_err(classify)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, duckdb::Connection>> {
        self.connection
            .lock()
            .map_err(|e| StoreError::transient(format!("Lock error: {}", e)))
    }
}

/// Classify a DuckDB error
pub fn classify(error: duckdb::Error) -> StoreError {
    match &error {
        duckdb::Error::DuckDBFailure(_, Some(message)) => {
            StoreError::new(classify_message(message), message.clone())
        }
        duckdb::Error::DuckDBFailure(_, None) => StoreError::transient(error.to_string()),
        duckdb::Error::ToSqlConversionFailure(_) => StoreError::malformed(error.to_string()),
        _ => StoreError::deterministic(error.to_string()),
    }
}

/// Classify a DuckDB error message by its category prefix
pub fn classify_message(message: &str) -> super::ErrorKind {
    let message = message.trim_start();
    if DETERMINISTIC_PREFIXES
        .iter()
        .any(|prefix| message.starts_with(prefix))
    {
        super::ErrorKind::Deterministic
    } else {
        super::ErrorKind::Transient
    }
}

fn to_duckdb_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::BigInt(i)
            } else if let Some(u) = n.as_u64() {
                Value::UBigInt(u)
            } else {
                Value::Double(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        // Nested values are stored as their JSON text
        other => Value::Text(other.to_string()),
    }
}

#[async_trait(?Send)]
impl RecordStore for DuckDbStore {
    async fn describe_table(&self, table: &TableName) -> StoreResult<TableDescriptor> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
            )
            .map_err(classify)?;

        let columns = stmt
            .query_map(
                duckdb::params![table.schema().unwrap_or("main"), table.name()],
                |row| Ok(ColumnInfo::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;

        if columns.is_empty() {
            return Err(StoreError::deterministic(format!(
                "table {} does not exist",
                table
            )));
        }

        Ok(TableDescriptor::new(table.clone(), columns))
    }

    async fn insert_rows(&self, descriptor: &TableDescriptor, rows: &[Row]) -> StoreResult<u64> {
        let statement = build_insert(descriptor, rows, |_, _| "?".to_string())?;
        let values: Vec<Value> = statement
            .values
            .iter()
            .map(|value| to_duckdb_value(value))
            .collect();

        let conn = self.lock()?;
        let written = conn
            .execute(&statement.sql, duckdb::params_from_iter(values.iter()))
            .map_err(classify)?;

        tracing::debug!(table = %descriptor.table, rows = written, "Inserted rows");
        Ok(written as u64)
    }

    fn backend_type(&self) -> &'static str {
        "duckdb"
    }

    async fn close(&self) -> StoreResult<()> {
        if self.db_path.is_some() {
            self.execute_batch("CHECKPOINT")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ErrorKind;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn store() -> DuckDbStore {
        let store = DuckDbStore::in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE logs (id INTEGER NOT NULL, host VARCHAR, code INTEGER, attrs VARCHAR)",
            )
            .unwrap();
        store
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(
            classify_message("Constraint Error: NOT NULL constraint failed: logs.id"),
            ErrorKind::Deterministic
        );
        assert_eq!(
            classify_message("Conversion Error: Could not convert string 'x' to INT32"),
            ErrorKind::Deterministic
        );
        assert_eq!(
            classify_message("TransactionContext Error: Conflict on update"),
            ErrorKind::Transient
        );
        assert_eq!(classify_message("IO Error: disk full"), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_describe_table() {
        let store = store();
        let descriptor = store
            .describe_table(&TableName::parse("logs").unwrap())
            .await
            .unwrap();

        let names: Vec<&str> = descriptor.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "host", "code", "attrs"]);
        assert_eq!(descriptor.column("code").unwrap().data_type, "INTEGER");
    }

    #[tokio::test]
    async fn test_describe_missing_table_is_deterministic() {
        let store = store();
        let err = store
            .describe_table(&TableName::parse("nope").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deterministic);
    }

    #[tokio::test]
    async fn test_insert_rows() {
        let store = store();
        let descriptor = store
            .describe_table(&TableName::parse("logs").unwrap())
            .await
            .unwrap();

        let written = store
            .insert_rows(
                &descriptor,
                &[
                    row(json!({"id": 1, "host": "a", "code": 200})),
                    row(json!({"id": 2, "attrs": {"k": "v"}})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(written, 2);

        let conn = store.lock().unwrap();
        let attrs: String = conn
            .query_row("SELECT attrs FROM logs WHERE id = 2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(attrs, r#"{"k":"v"}"#);
        let count: i64 = conn
            .query_row("SELECT count(*) FROM logs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_constraint_violation_is_deterministic_and_atomic() {
        let store = store();
        let descriptor = store
            .describe_table(&TableName::parse("logs").unwrap())
            .await
            .unwrap();

        let err = store
            .insert_rows(
                &descriptor,
                &[row(json!({"id": 1, "host": "a"})), row(json!({"host": "b"}))],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deterministic);

        let count: i64 = store
            .lock()
            .unwrap()
            .query_row("SELECT count(*) FROM logs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_rows_without_mapped_columns_take_defaults() {
        let store = store();
        store
            .execute_batch("CREATE TABLE levels (level VARCHAR DEFAULT 'info', message VARCHAR)")
            .unwrap();
        let descriptor = store
            .describe_table(&TableName::parse("levels").unwrap())
            .await
            .unwrap();

        let written = store
            .insert_rows(&descriptor, &[Row::new(), row(json!({"message": "m"}))])
            .await
            .unwrap();
        assert_eq!(written, 2);
        let written = store
            .insert_rows(&descriptor, &[Row::new(), Row::new()])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let defaults: i64 = store
            .lock()
            .unwrap()
            .query_row("SELECT count(*) FROM levels WHERE level = 'info'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(defaults, 4);
    }

    #[tokio::test]
    async fn test_dropped_table_is_deterministic() {
        let store = store();
        let descriptor = store
            .describe_table(&TableName::parse("logs").unwrap())
            .await
            .unwrap();
        store.execute_batch("DROP TABLE logs").unwrap();

        let err = store
            .insert_rows(&descriptor, &[row(json!({"id": 1}))])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deterministic);
    }
}
