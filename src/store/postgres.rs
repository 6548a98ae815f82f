//! PostgreSQL store implementation
//!
//! Uses connection pooling via deadpool-postgres. Values are sent as text and
//! cast to each column's type on the server, so any value PostgreSQL can
//! parse from its text form is accepted regardless of the column type.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod};
use tokio_postgres::NoTls;
use tokio_postgres::config::Host;
use tokio_postgres::types::ToSql;

use super::{
    ColumnInfo, ErrorKind, RecordStore, Row, StoreError, StoreResult, TableDescriptor, TableName,
    build_insert, quote_ident,
};

/// SQLSTATE classes that recur on retry: cardinality violation, data
/// exception, integrity constraint violation, syntax error or access rule
/// violation, feature not supported
const DETERMINISTIC_CLASSES: &[&str] = &["21", "22", "23", "42", "0A"];

/// Most parameters one statement can bind; the protocol sends the count as
/// a 16-bit signed integer
pub const MAX_BIND_PARAMS: usize = i16::MAX as usize;

const DESCRIBE_SQL: &str = "SELECT column_name::text, udt_name::text \
     FROM information_schema.columns \
     WHERE table_schema::text = COALESCE($1::text, current_schema()::text) \
     AND table_name::text = $2::text \
     ORDER BY ordinal_position";

/// PostgreSQL store
pub struct PostgresStore {
    pool: Pool,
    /// Connection target without credentials
    target: String,
}

impl PostgresStore {
    /// Create a pooled store
    ///
    /// No connection is made until the first call.
    ///
    /// # Arguments
    /// * `config` - Connection settings
    /// * `pool_size` - Maximum number of pooled connections
    pub fn new(config: tokio_postgres::Config, pool_size: usize) -> StoreResult<Self> {
        let target = describe_target(&config);
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| StoreError::deterministic(format!("Failed to build pool: {}", e)))?;

        Ok(Self { pool, target })
    }

    /// Connection target, safe to log
    pub fn target(&self) -> &str {
        &self.target
    }

    async fn client(&self) -> StoreResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Backend(e) => classify(&e),
            other => StoreError::transient(format!("Pool error: {}", other)),
        })
    }
}

fn describe_target(config: &tokio_postgres::Config) -> String {
    let host = match config.get_hosts().first() {
        Some(Host::Tcp(host)) => host.clone(),
        #[cfg(unix)]
        Some(Host::Unix(path)) => path.display().to_string(),
        None => "localhost".to_string(),
    };
    let port = config.get_ports().first().copied().unwrap_or(5432);
    format!(
        "{}@{}:{}/{}",
        config.get_user().unwrap_or(""),
        host,
        port,
        config.get_dbname().unwrap_or("")
    )
}

/// Classify a PostgreSQL error
///
/// Errors without an SQLSTATE are classified by [`classify_client_message`].
pub fn classify(error: &tokio_postgres::Error) -> StoreError {
    match error.as_db_error() {
        Some(db) => StoreError::new(
            classify_sqlstate(db.code().code()),
            format!("{}: {}", db.code().code(), db.message()),
        ),
        None => match error.code() {
            Some(state) => StoreError::new(classify_sqlstate(state.code()), error.to_string()),
            None => {
                let message = error.to_string();
                StoreError::new(classify_client_message(&message), message)
            }
        },
    }
}

/// Classify an error raised by the client before reaching the server
///
/// A statement that can't be encoded or a value that can't be serialized
/// fails the same way every time. Anything else (connection loss, I/O,
/// timeouts) is transient.
pub fn classify_client_message(message: &str) -> ErrorKind {
    if message.starts_with("error serializing parameter") {
        ErrorKind::Malformed
    } else if message.starts_with("error encoding message to server") {
        ErrorKind::Deterministic
    } else {
        ErrorKind::Transient
    }
}

/// Rows per INSERT so that no statement binds more than [`MAX_BIND_PARAMS`]
pub fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

/// Classify an SQLSTATE by its class
pub fn classify_sqlstate(code: &str) -> ErrorKind {
    let class = code.get(..2).unwrap_or(code);
    if DETERMINISTIC_CLASSES.contains(&class) {
        ErrorKind::Deterministic
    } else {
        ErrorKind::Transient
    }
}

/// Text form of a value; `None` for null
fn to_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait(?Send)]
impl RecordStore for PostgresStore {
    async fn describe_table(&self, table: &TableName) -> StoreResult<TableDescriptor> {
        let client = self.client().await?;
        let schema = table.schema();
        let name = table.name();

        let rows = client
            .query(DESCRIBE_SQL, &[&schema, &name])
            .await
            .map_err(|e| classify(&e))?;

        let columns = rows
            .iter()
            .map(|row| -> Result<ColumnInfo, tokio_postgres::Error> {
                Ok(ColumnInfo::new(
                    row.try_get::<_, String>(0)?,
                    row.try_get::<_, String>(1)?,
                ))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| classify(&e))?;

        if columns.is_empty() {
            return Err(StoreError::deterministic(format!(
                "table {} does not exist",
                table
            )));
        }

        Ok(TableDescriptor::new(table.clone(), columns))
    }

    /// Insert rows atomically
    ///
    /// Large batches are split into several statements run in one
    /// transaction, each below the protocol's parameter limit.
    async fn insert_rows(&self, descriptor: &TableDescriptor, rows: &[Row]) -> StoreResult<u64> {
        descriptor.insert_columns(rows)?;
        let per_statement = rows_per_statement(descriptor.columns.len());

        let mut client = self.client().await?;
        let transaction = client.transaction().await.map_err(|e| classify(&e))?;

        let mut written = 0;
        for batch in rows.chunks(per_statement) {
            let statement = build_insert(descriptor, batch, |index, column| {
                format!("CAST(${}::text AS {})", index, quote_ident(&column.data_type))
            })?;
            let values: Vec<Option<String>> =
                statement.values.iter().map(|value| to_text(value)).collect();
            let params: Vec<&(dyn ToSql + Sync)> =
                values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

            written += transaction
                .execute(statement.sql.as_str(), &params)
                .await
                .map_err(|e| classify(&e))?;
        }

        transaction.commit().await.map_err(|e| classify(&e))?;

        tracing::debug!(table = %descriptor.table, rows = written, "Inserted rows");
        Ok(written)
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    async fn close(&self) -> StoreResult<()> {
        tracing::debug!(server = %self.target, "Closing connection pool");
        self.pool.close();
        Ok(())
    }
}
