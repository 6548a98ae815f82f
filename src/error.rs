//! Error types for the output stage
//!
//! Store-level failures live in [`crate::store::StoreError`] and carry an
//! [`crate::store::ErrorKind`]; decoding failures live in
//! [`crate::chunk::MalformedRecord`]. This module holds the configuration,
//! binding and top-level errors.

use thiserror::Error;

use crate::store::StoreError;

/// Configuration error. Always fatal: the stage does not start.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to read config {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Invalid column mapping '{spec}': {reason}")]
    InvalidColumnMapping { spec: String, reason: String },

    #[error("Invalid tag pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid remove_tag_prefix '{0}'")]
    InvalidTagPrefix(String),

    #[error("Invalid table name '{0}'")]
    InvalidTableName(String),

    #[error("No default table defined. Add a [[table]] section without a pattern.")]
    MissingDefaultTable,

    #[error("Unsupported adapter '{0}'")]
    UnsupportedAdapter(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
}

/// A table could not be bound at startup.
#[derive(Error, Debug)]
#[error("Can't bind table '{table}': {source}")]
pub struct BindError {
    pub table: String,
    #[source]
    pub source: StoreError,
}

impl BindError {
    pub fn new(table: impl Into<String>, source: StoreError) -> Self {
        Self {
            table: table.into(),
            source,
        }
    }
}

/// Top-level error returned to the host framework
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Failed to open {adapter} store: {source}")]
    Open {
        adapter: String,
        #[source]
        source: StoreError,
    },

    /// A batch-level failure the host must answer by re-delivering the chunk.
    #[error("Import into '{table}' failed: {source}")]
    Import {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Table '{0}' is not bound")]
    NotBound(String),

    #[error("Output stage is shutting down")]
    ShuttingDown,
}

/// Result type for output stage operations
pub type SinkResult<T> = Result<T, SinkError>;
