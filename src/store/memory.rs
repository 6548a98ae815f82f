//! In-memory store
//!
//! Tables are registered up front with their column names. Inserts are
//! checked against the registered columns the same way the SQL adapters check
//! them, and failures can be injected per table to exercise the import
//! engine's fallback and retry paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    ColumnInfo, ErrorKind, RecordStore, Row, StoreError, StoreResult, TableDescriptor, TableName,
};

type RowPredicate = Box<dyn Fn(&Row) -> bool + Send + Sync>;

struct FaultRule {
    kind: ErrorKind,
    predicate: RowPredicate,
}

#[derive(Default)]
struct MemoryTable {
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
    insert_calls: usize,
    scripted: VecDeque<ErrorKind>,
    rules: Vec<FaultRule>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    unavailable: bool,
}

/// In-process store with fault injection
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MemoryStore::create_table`]
    pub fn with_table(self, table: &str, columns: &[&str]) -> Self {
        self.create_table(table, columns);
        self
    }

    /// Register a table with untyped columns
    pub fn create_table(&self, table: &str, columns: &[&str]) {
        let mut state = self.lock();
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.columns = columns
            .iter()
            .map(|name| ColumnInfo::new(*name, "ANY"))
            .collect();
    }

    /// Fail the next `times` inserts into `table` with `kind`
    pub fn fail_next(&self, table: &str, kind: ErrorKind, times: usize) {
        let mut state = self.lock();
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.scripted.extend(std::iter::repeat_n(kind, times));
    }

    /// Fail every insert into `table` that contains a row matching `predicate`
    pub fn fail_rows_where<F>(&self, table: &str, kind: ErrorKind, predicate: F)
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.rules.push(FaultRule {
            kind,
            predicate: Box::new(predicate),
        });
    }

    /// Make every call fail transiently, as if the server were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Rows written to `table` so far
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of insert calls made against `table`, failed ones included
    pub fn insert_calls(&self, table: &str) -> usize {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.insert_calls)
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait(?Send)]
impl RecordStore for MemoryStore {
    async fn describe_table(&self, table: &TableName) -> StoreResult<TableDescriptor> {
        let state = self.lock();
        if state.unavailable {
            return Err(StoreError::transient("memory store is unavailable"));
        }

        match state.tables.get(&table.to_string()) {
            Some(entry) if !entry.columns.is_empty() => {
                Ok(TableDescriptor::new(table.clone(), entry.columns.clone()))
            }
            _ => Err(StoreError::deterministic(format!(
                "table {} does not exist",
                table
            ))),
        }
    }

    async fn insert_rows(&self, descriptor: &TableDescriptor, rows: &[Row]) -> StoreResult<u64> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(StoreError::transient("memory store is unavailable"));
        }

        let key = descriptor.table.to_string();
        let entry = state
            .tables
            .get_mut(&key)
            .ok_or_else(|| StoreError::deterministic(format!("table {} does not exist", key)))?;

        entry.insert_calls += 1;

        if let Some(kind) = entry.scripted.pop_front() {
            return Err(StoreError::new(kind, format!("injected failure on {}", key)));
        }

        descriptor.insert_columns(rows)?;

        if let Some(rule) = entry
            .rules
            .iter()
            .find(|rule| rows.iter().any(|row| (rule.predicate)(row)))
        {
            return Err(StoreError::new(
                rule.kind,
                format!("injected row failure on {}", key),
            ));
        }

        entry.rows.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
