//! Tag SQL Sink - tag-routed SQL output stage for buffered log chunks
//!
//! Provides:
//! - Tag pattern routing of chunks to destination tables
//! - Column mapping from record fields to table columns
//! - Bulk import with one-by-one fallback on deterministic failures
//! - Bounded per-record retry of transient failures
//! - Persistence adapters (in-memory, DuckDB, PostgreSQL)

pub mod chunk;
pub mod config;
pub mod error;
pub mod import;
pub mod mapping;
pub mod output;
pub mod pattern;
pub mod registry;
pub mod route;
pub mod store;

pub use chunk::{Chunk, ChunkBuilder, ChunkEntry, EventTime, MalformedRecord};
pub use config::{Adapter, SinkConfig, TableSection};
pub use error::{BindError, ConfigError, SinkError, SinkResult};
pub use import::{ImportEngine, ImportOutcome, ImportReport, RecordOutcome};
pub use mapping::ColumnMapping;
pub use output::OutputCoordinator;
pub use pattern::{TagPattern, TagPrefix};
pub use registry::TableRegistry;
pub use route::{RetryPolicy, TableRoute};
#[cfg(feature = "duckdb-backend")]
pub use store::DuckDbStore;
#[cfg(feature = "postgres-backend")]
pub use store::PostgresStore;
pub use store::{
    ErrorKind, MemoryStore, RecordStore, Row, StoreError, TableDescriptor, TableName, open_store,
};
