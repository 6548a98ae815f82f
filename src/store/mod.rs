//! Persistence adapters for the output stage
//!
//! This module provides the boundary between the import engine and the
//! relational database:
//! - Memory: in-process tables with fault injection (tests, dry runs)
//! - DuckDB: embedded database (feature `duckdb-backend`)
//! - PostgreSQL: pooled server connections (feature `postgres-backend`)
//!
//! Every adapter classifies its failures into an [`ErrorKind`] before they
//! leave the adapter, so the engine never looks at driver error types.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{Adapter, SinkConfig};
use crate::error::{ConfigError, SinkError, SinkResult};

#[cfg(feature = "duckdb-backend")]
pub mod duckdb;
pub mod memory;
#[cfg(feature = "postgres-backend")]
pub mod postgres;

#[cfg(feature = "duckdb-backend")]
pub use self::duckdb::DuckDbStore;
pub use self::memory::MemoryStore;
#[cfg(feature = "postgres-backend")]
pub use self::postgres::PostgresStore;

/// A transformed record: destination column to value
pub type Row = serde_json::Map<String, serde_json::Value>;

/// How a store failure behaves on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Recurs identically on retry: invalid statement, constraint violation,
    /// type conversion, missing column
    Deterministic,
    /// May succeed on retry: connectivity, lock contention, timeout
    Transient,
    /// The row itself cannot be expressed as an insert
    Malformed,
}

impl ErrorKind {
    /// Deterministic and malformed failures both recur on retry
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::Transient
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Deterministic => write!(f, "deterministic"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Malformed => write!(f, "malformed"),
        }
    }
}

/// Classified store failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct StoreError {
    kind: ErrorKind,
    message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn deterministic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Deterministic, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

static RE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("Invalid regex"));

/// Destination table name, optionally schema-qualified
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    schema: Option<String>,
    name: String,
}

impl TableName {
    /// Parse `table` or `schema.table`
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidTableName(value.to_string());
        let value = value.trim();

        let (schema, name) = match value.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, value),
        };

        if !RE_IDENTIFIER.is_match(name) {
            return Err(invalid());
        }
        if let Some(schema) = schema
            && !RE_IDENTIFIER.is_match(schema)
        {
            return Err(invalid());
        }

        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quoted form for use in SQL statements
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Quote an SQL identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A column as reported by the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Database type name (DuckDB `data_type`, PostgreSQL `udt_name`)
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Schema handle for one bound table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub table: TableName,
    pub columns: Vec<ColumnInfo>,
}

impl TableDescriptor {
    pub fn new(table: TableName, columns: Vec<ColumnInfo>) -> Self {
        Self { table, columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Columns an insert of `rows` has to name, in table order
    ///
    /// Fails deterministically if a row names a column the table does not
    /// have. Rows without any mapped column are valid and take the column
    /// defaults.
    pub fn insert_columns(&self, rows: &[Row]) -> StoreResult<Vec<&ColumnInfo>> {
        for row in rows {
            if let Some(missing) = row.keys().find(|key| !self.has_column(key)) {
                return Err(StoreError::deterministic(format!(
                    "missing column '{}' in table {}",
                    missing, self.table
                )));
            }
        }

        Ok(self
            .columns
            .iter()
            .filter(|column| rows.iter().any(|row| row.contains_key(&column.name)))
            .collect())
    }
}

/// A multi-row INSERT and the values it binds
#[derive(Debug)]
pub struct InsertStatement<'a> {
    pub sql: String,
    /// Bound values in placeholder order
    pub values: Vec<&'a serde_json::Value>,
}

/// Build a multi-row INSERT statement
///
/// A column a row does not carry is written as `DEFAULT`. If no row carries
/// any column, the first table column is written as `DEFAULT` so every row
/// still produces a record. `placeholder` receives the 1-based parameter
/// index and the column.
pub fn build_insert<'a, F>(
    descriptor: &TableDescriptor,
    rows: &'a [Row],
    placeholder: F,
) -> StoreResult<InsertStatement<'a>>
where
    F: Fn(usize, &ColumnInfo) -> String,
{
    let mut columns = descriptor.insert_columns(rows)?;
    if columns.is_empty() {
        match descriptor.columns.first() {
            Some(first) => columns.push(first),
            None => {
                return Err(StoreError::deterministic(format!(
                    "table {} has no columns",
                    descriptor.table
                )));
            }
        }
    }

    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();

    let mut values = Vec::new();
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let items: Vec<String> = columns
            .iter()
            .map(|column| match row.get(&column.name) {
                Some(value) => {
                    values.push(value);
                    placeholder(values.len(), column)
                }
                None => "DEFAULT".to_string(),
            })
            .collect();
        tuples.push(format!("({})", items.join(", ")));
    }

    Ok(InsertStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES {}",
            descriptor.table.quoted(),
            column_list.join(", "),
            tuples.join(", ")
        ),
        values,
    })
}

/// Persistence adapter trait
///
/// One store is owned by one output stage. Calls are awaited one at a time.
#[async_trait(?Send)]
pub trait RecordStore: Send + Sync {
    /// Look up a table and its columns
    ///
    /// A table that does not exist is a deterministic error.
    async fn describe_table(&self, table: &TableName) -> StoreResult<TableDescriptor>;

    /// Insert all rows atomically
    ///
    /// Either every row is written or none is.
    ///
    /// # Returns
    /// Number of rows written
    async fn insert_rows(&self, descriptor: &TableDescriptor, rows: &[Row]) -> StoreResult<u64>;

    /// Backend type name ("memory", "duckdb" or "postgres")
    fn backend_type(&self) -> &'static str;

    /// Release connections
    async fn close(&self) -> StoreResult<()>;
}

/// Open the store selected by the configuration's `adapter`
pub fn open_store(config: &SinkConfig) -> SinkResult<Arc<dyn RecordStore>> {
    match config.adapter()? {
        #[cfg(feature = "duckdb-backend")]
        Adapter::DuckDb => {
            let store = match config.duckdb_path() {
                Some(path) => DuckDbStore::new(path),
                None => DuckDbStore::in_memory(),
            }
            .map_err(|source| SinkError::Open {
                adapter: Adapter::DuckDb.to_string(),
                source,
            })?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres-backend")]
        Adapter::Postgres => {
            let store = PostgresStore::new(config.postgres_config(), config.pool).map_err(
                |source| SinkError::Open {
                    adapter: Adapter::Postgres.to_string(),
                    source,
                },
            )?;
            Ok(Arc::new(store))
        }
        #[allow(unreachable_patterns)]
        other => Err(ConfigError::UnsupportedAdapter(format!(
            "{} (not enabled in this build)",
            other
        ))
        .into()),
    }
}
