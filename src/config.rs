//! Output stage configuration
//!
//! Handles parsing of the TOML configuration file and environment variable
//! overrides. The file holds the connection parameters at the top level and
//! one `[[table]]` section per destination table; the section without a
//! `pattern` is the default table.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pattern::TagPrefix;

/// Default number of per-record retries for transient failures
pub const DEFAULT_NUM_RETRIES: u32 = 5;

/// Default connection pool size
pub const DEFAULT_POOL_SIZE: usize = 5;

/// DuckDB database name that selects an in-memory database
pub const DUCKDB_IN_MEMORY: &str = ":memory:";

/// Environment variable for the adapter
pub const ENV_ADAPTER: &str = "TAG_SQL_SINK_ADAPTER";

/// Environment variable for the database host
pub const ENV_HOST: &str = "TAG_SQL_SINK_HOST";

/// Environment variable for the database port
pub const ENV_PORT: &str = "TAG_SQL_SINK_PORT";

/// Environment variable for the database user
pub const ENV_USERNAME: &str = "TAG_SQL_SINK_USERNAME";

/// Environment variable for the database password
pub const ENV_PASSWORD: &str = "TAG_SQL_SINK_PASSWORD";

/// Environment variable for the database name (or DuckDB file path)
pub const ENV_DATABASE: &str = "TAG_SQL_SINK_DATABASE";

/// Database adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    /// PostgreSQL server
    Postgres,
    /// DuckDB embedded database
    DuckDb,
}

impl std::str::FromStr for Adapter {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Adapter::Postgres),
            "duckdb" => Ok(Adapter::DuckDb),
            _ => Err(ConfigError::UnsupportedAdapter(s.to_string())),
        }
    }
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adapter::Postgres => write!(f, "postgresql"),
            Adapter::DuckDb => write!(f, "duckdb"),
        }
    }
}

/// Password that never shows up in debug output
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "****")
    }
}

/// One `[[table]]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSection {
    /// Tag pattern; absent or empty for the default table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Destination table, optionally `schema.table`
    pub table: String,

    /// `key[:column],...`
    pub column_mapping: String,

    /// Retries for a record that fails transiently during fallback import
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
}

fn default_num_retries() -> u32 {
    DEFAULT_NUM_RETRIES
}

impl TableSection {
    pub fn new(pattern: Option<&str>, table: &str, column_mapping: &str) -> Self {
        Self {
            pattern: pattern.map(str::to_string),
            table: table.to_string(),
            column_mapping: column_mapping.to_string(),
            num_retries: DEFAULT_NUM_RETRIES,
        }
    }

    /// True for the section without a pattern
    pub fn is_default(&self) -> bool {
        self.pattern
            .as_deref()
            .map(|p| p.trim().is_empty())
            .unwrap_or(true)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// "postgresql", "postgres" or "duckdb"
    pub adapter: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,

    /// Database name, or the database file for DuckDB
    #[serde(default)]
    pub database: String,

    /// Unix socket directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,

    /// Literal prefix removed from chunk tags before routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_tag_prefix: Option<String>,

    /// Degrade to one-by-one import on a deterministic bulk failure
    #[serde(default = "default_enable_fallback")]
    pub enable_fallback: bool,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool: usize,

    /// Destination tables in declaration order
    #[serde(default, rename = "table")]
    pub tables: Vec<TableSection>,
}

fn default_enable_fallback() -> bool {
    true
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl SinkConfig {
    /// Create a configuration with no tables
    pub fn new(adapter: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            host: None,
            port: None,
            username: None,
            password: None,
            database: database.into(),
            socket: None,
            remove_tag_prefix: None,
            enable_fallback: default_enable_fallback(),
            pool: default_pool_size(),
            tables: Vec::new(),
        }
    }

    /// Append a table section
    pub fn with_table(mut self, section: TableSection) -> Self {
        self.tables.push(section);
        self
    }

    /// Load configuration from a file and apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut config = Self::parse(&content)?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(adapter) = std::env::var(ENV_ADAPTER) {
            self.adapter = adapter;
        }

        if let Ok(host) = std::env::var(ENV_HOST) {
            self.host = Some(host);
        }

        if let Ok(port) = std::env::var(ENV_PORT)
            && let Ok(port) = port.parse()
        {
            self.port = Some(port);
        }

        if let Ok(username) = std::env::var(ENV_USERNAME) {
            self.username = Some(username);
        }

        if let Ok(password) = std::env::var(ENV_PASSWORD) {
            self.password = Some(Password::new(password));
        }

        if let Ok(database) = std::env::var(ENV_DATABASE) {
            self.database = database;
        }
    }

    /// Check the connection parameters
    ///
    /// Table sections are checked when the registry is built from them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.adapter()?;
        if self.database.trim().is_empty() {
            return Err(ConfigError::MissingParameter("database"));
        }
        if self.pool == 0 {
            return Err(ConfigError::Parse("pool must be at least 1".to_string()));
        }
        self.tag_prefix()?;
        Ok(())
    }

    pub fn adapter(&self) -> Result<Adapter, ConfigError> {
        self.adapter.parse()
    }

    /// Compiled `remove_tag_prefix`, if configured
    pub fn tag_prefix(&self) -> Result<Option<TagPrefix>, ConfigError> {
        self.remove_tag_prefix
            .as_deref()
            .map(TagPrefix::new)
            .transpose()
    }

    /// DuckDB database file; `None` selects an in-memory database
    pub fn duckdb_path(&self) -> Option<PathBuf> {
        if self.database.is_empty() || self.database == DUCKDB_IN_MEMORY {
            None
        } else {
            Some(PathBuf::from(&self.database))
        }
    }

    /// Connection target with the password left out, for logs
    pub fn describe_target(&self) -> String {
        match (self.adapter(), &self.host, &self.socket) {
            (Ok(Adapter::DuckDb), _, _) => format!("duckdb:{}", self.database),
            (_, _, Some(socket)) => format!("{}@{}/{}", self.adapter, socket, self.database),
            (_, host, _) => format!(
                "{}@{}:{}/{}",
                self.adapter,
                host.as_deref().unwrap_or("localhost"),
                self.port.unwrap_or(5432),
                self.database
            ),
        }
    }

    /// PostgreSQL connection settings
    #[cfg(feature = "postgres-backend")]
    pub fn postgres_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.dbname(&self.database);

        #[cfg(unix)]
        if let Some(socket) = &self.socket {
            pg.host_path(socket);
        }
        if let Some(host) = &self.host {
            pg.host(host);
        } else if self.socket.is_none() {
            pg.host("localhost");
        }
        if let Some(port) = self.port {
            pg.port(port);
        }
        if let Some(username) = &self.username {
            pg.user(username);
        }
        if let Some(password) = &self.password {
            pg.password(password.expose());
        }
        pg.application_name("tag-sql-sink");
        pg
    }
}

/// Generate a sample configuration file content
pub fn sample_config() -> &'static str {
    r#"# tag-sql-sink configuration

# Database adapter: "postgresql" or "duckdb"
adapter = "postgresql"
host = "localhost"
port = 5432
username = "fluentd"
# password = "secret"
database = "logs"

# Remove this literal prefix from tags before matching
remove_tag_prefix = "app."

# On a deterministic bulk failure, retry records one by one
enable_fallback = true

# Connection pool size
pool = 5

[[table]]
pattern = "access.*"
table = "access_log"
column_mapping = "host:client_host,path,code:status"
num_retries = 5

# The table without a pattern receives everything else
[[table]]
table = "events"
column_mapping = "message,level"
"#
}
