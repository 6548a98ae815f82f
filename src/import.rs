//! Chunk import with per-record fallback
//!
//! A chunk is written with one bulk insert. When the bulk insert fails
//! deterministically, the rows are written one at a time so that a single bad
//! record cannot block the rest; transient failures of a single row are
//! retried with a fixed backoff up to the route's retry budget. Any other bulk
//! failure goes back to the caller so the host re-delivers the chunk.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::chunk::Chunk;
use crate::error::{SinkError, SinkResult};
use crate::route::TableRoute;
use crate::store::{ErrorKind, RecordStore, Row, TableDescriptor};

/// Result of importing one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOutcome {
    Success,
    PartialSuccess { dropped: usize },
    /// Nothing was left to import after decoding
    Skipped,
}

/// Result of importing one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Imported,
    Malformed,
    DeterministicFailure,
    TransientFailureExhausted,
}

/// Accounting for one handled chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub table: String,
    pub outcome: ImportOutcome,
    pub imported: usize,
    pub malformed: usize,
    pub dropped_deterministic: usize,
    pub dropped_exhausted: usize,
    /// Retries spent across all records
    pub retries: u32,
    /// True if the one-by-one path ran
    pub fallback: bool,
}

impl ImportReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            outcome: ImportOutcome::Skipped,
            imported: 0,
            malformed: 0,
            dropped_deterministic: 0,
            dropped_exhausted: 0,
            retries: 0,
            fallback: false,
        }
    }

    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Imported => self.imported += 1,
            RecordOutcome::Malformed => self.malformed += 1,
            RecordOutcome::DeterministicFailure => self.dropped_deterministic += 1,
            RecordOutcome::TransientFailureExhausted => self.dropped_exhausted += 1,
        }
    }

    /// Records that did not make it into the table
    pub fn dropped(&self) -> usize {
        self.malformed + self.dropped_deterministic + self.dropped_exhausted
    }

    fn finish(mut self) -> Self {
        self.outcome = match (self.imported, self.dropped()) {
            (0, 0) => ImportOutcome::Skipped,
            (_, 0) => ImportOutcome::Success,
            (_, dropped) => ImportOutcome::PartialSuccess { dropped },
        };
        self
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} imported, {} malformed, {} rejected, {} given up after retries",
            self.table,
            self.imported,
            self.malformed,
            self.dropped_deterministic,
            self.dropped_exhausted
        )
    }
}

/// Writes chunks into their routed table
pub struct ImportEngine {
    store: Arc<dyn RecordStore>,
    enable_fallback: bool,
}

impl ImportEngine {
    pub fn new(store: Arc<dyn RecordStore>, enable_fallback: bool) -> Self {
        Self {
            store,
            enable_fallback,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Import a chunk into the route's table
    ///
    /// # Arguments
    ///
    /// * `route` - Bound route the chunk resolved to
    /// * `chunk` - Chunk to import
    ///
    /// # Returns
    ///
    /// A report once every record is accounted for, or `SinkError::Import`
    /// when the bulk insert failed in a way the host must retry.
    pub async fn import(&self, route: &TableRoute, chunk: &Chunk) -> SinkResult<ImportReport> {
        let descriptor = route
            .descriptor()
            .ok_or_else(|| SinkError::NotBound(route.table().to_string()))?;
        let mut report = ImportReport::new(route.table().to_string());

        let mut rows = Vec::new();
        for entry in chunk.entries() {
            match entry {
                Ok(entry) => rows.push(route.mapping().apply(&entry.record)),
                Err(malformed) => {
                    tracing::warn!(
                        index = malformed.index,
                        reason = %malformed.reason,
                        record = %malformed.content,
                        "Skipping malformed record"
                    );
                    report.record(RecordOutcome::Malformed);
                }
            }
        }

        if rows.is_empty() {
            return Ok(report.finish());
        }

        match self.store.insert_rows(descriptor, &rows).await {
            Ok(_) => {
                report.imported += rows.len();
            }
            Err(e) if !e.kind().is_retryable() && self.enable_fallback => {
                tracing::warn!(
                    table = %descriptor.table,
                    rows = rows.len(),
                    error = %e,
                    "Got deterministic error. Falling back to one-by-one import"
                );
                report.fallback = true;
                for row in &rows {
                    let outcome = self.import_one(route, descriptor, row, &mut report).await;
                    report.record(outcome);
                }
            }
            Err(e) => {
                return Err(SinkError::Import {
                    table: descriptor.table.to_string(),
                    source: e,
                });
            }
        }

        Ok(report.finish())
    }

    async fn import_one(
        &self,
        route: &TableRoute,
        descriptor: &TableDescriptor,
        row: &Row,
        report: &mut ImportReport,
    ) -> RecordOutcome {
        let policy = route.retry();
        let mut retries = 0u32;

        loop {
            let err = match self
                .store
                .insert_rows(descriptor, std::slice::from_ref(row))
                .await
            {
                Ok(_) => return RecordOutcome::Imported,
                Err(e) => e,
            };

            match err.kind() {
                ErrorKind::Deterministic => {
                    tracing::error!(
                        table = %descriptor.table,
                        record = %serde_json::Value::Object(row.clone()),
                        error = %err,
                        "Got deterministic error again. Dropped a record"
                    );
                    return RecordOutcome::DeterministicFailure;
                }
                ErrorKind::Malformed => {
                    tracing::error!(
                        table = %descriptor.table,
                        record = %serde_json::Value::Object(row.clone()),
                        error = %err,
                        "Record can't be written. Dropped a record"
                    );
                    return RecordOutcome::Malformed;
                }
                ErrorKind::Transient => {
                    retries += 1;
                    if retries > policy.max_retries {
                        tracing::error!(
                            table = %descriptor.table,
                            record = %serde_json::Value::Object(row.clone()),
                            error = %err,
                            retries = policy.max_retries,
                            "Can't recover from transient error. Dropped a record"
                        );
                        return RecordOutcome::TransientFailureExhausted;
                    }

                    report.retries += 1;
                    tracing::warn!(
                        table = %descriptor.table,
                        error = %err,
                        retry = retries,
                        max_retries = policy.max_retries,
                        "Got transient error. Retrying after backoff"
                    );
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }
}
