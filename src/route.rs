//! Destination table routes

use std::time::Duration;

use crate::config::TableSection;
use crate::error::{BindError, ConfigError};
use crate::mapping::ColumnMapping;
use crate::pattern::TagPattern;
use crate::store::{RecordStore, TableDescriptor, TableName};

/// Pause between retries of a record that failed transiently
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Per-record retry policy for the fallback import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_NUM_RETRIES)
    }
}

/// A tag pattern bound to one table
#[derive(Debug, Clone)]
pub struct TableRoute {
    pattern: Option<TagPattern>,
    table: TableName,
    mapping: ColumnMapping,
    retry: RetryPolicy,
    descriptor: Option<TableDescriptor>,
}

impl TableRoute {
    /// Create an unbound route. A `None` pattern makes it the default route.
    pub fn new(
        pattern: Option<TagPattern>,
        table: TableName,
        mapping: ColumnMapping,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pattern,
            table,
            mapping,
            retry,
            descriptor: None,
        }
    }

    /// Build a route from a `[[table]]` section
    pub fn from_section(section: &TableSection) -> Result<Self, ConfigError> {
        let pattern = if section.is_default() {
            None
        } else {
            section.pattern.as_deref().map(TagPattern::parse).transpose()?
        };

        Ok(Self::new(
            pattern,
            TableName::parse(&section.table)?,
            ColumnMapping::parse(&section.column_mapping)?,
            RetryPolicy::new(section.num_retries),
        ))
    }

    pub fn is_default(&self) -> bool {
        self.pattern.is_none()
    }

    /// True if the route's pattern matches `tag`. Always false for the
    /// default route.
    pub fn matches(&self, tag: &str) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.matches(tag))
    }

    /// Resolve the table against the store and keep its descriptor
    pub async fn bind(&mut self, store: &dyn RecordStore) -> Result<(), BindError> {
        let descriptor = store
            .describe_table(&self.table)
            .await
            .map_err(|e| BindError::new(self.table.to_string(), e))?;

        for column in self.mapping.columns() {
            if !descriptor.has_column(column) {
                tracing::warn!(
                    table = %self.table,
                    column,
                    "Mapped column does not exist in table; records carrying it will be rejected"
                );
            }
        }

        tracing::info!(
            table = %self.table,
            pattern = self.pattern_str(),
            columns = descriptor.columns.len(),
            backend = store.backend_type(),
            "Bound table"
        );

        self.descriptor = Some(descriptor);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.descriptor.is_some()
    }

    pub fn descriptor(&self) -> Option<&TableDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn pattern(&self) -> Option<&TagPattern> {
        self.pattern.as_ref()
    }

    /// Pattern source, or `"(default)"`
    pub fn pattern_str(&self) -> &str {
        self.pattern.as_ref().map_or("(default)", |p| p.as_str())
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ErrorKind, MemoryStore};

    fn section(pattern: Option<&str>) -> TableSection {
        TableSection::new(pattern, "access_log", "host,path:url")
    }

    #[test]
    fn test_from_section() {
        let route = TableRoute::from_section(&section(Some("access.*"))).unwrap();
        assert!(!route.is_default());
        assert!(route.matches("access.web"));
        assert!(!route.matches("error.app"));
        assert_eq!(route.retry(), RetryPolicy::new(5));
        assert_eq!(route.retry().backoff, Duration::from_millis(500));
        assert!(!route.is_bound());
    }

    #[test]
    fn test_default_route_never_matches() {
        let route = TableRoute::from_section(&section(None)).unwrap();
        assert!(route.is_default());
        assert!(!route.matches("access.web"));
        assert!(!route.matches(""));
        assert_eq!(route.pattern_str(), "(default)");
    }

    #[test]
    fn test_from_section_rejects_bad_input() {
        let mut bad_table = section(None);
        bad_table.table = "no spaces allowed".to_string();
        assert!(matches!(
            TableRoute::from_section(&bad_table),
            Err(ConfigError::InvalidTableName(_))
        ));

        let mut bad_mapping = section(None);
        bad_mapping.column_mapping = String::new();
        assert!(matches!(
            TableRoute::from_section(&bad_mapping),
            Err(ConfigError::InvalidColumnMapping { .. })
        ));

        assert!(matches!(
            TableRoute::from_section(&section(Some("/(/"))),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_keeps_descriptor() {
        let store = MemoryStore::new().with_table("access_log", &["host", "url"]);
        let mut route = TableRoute::from_section(&section(Some("access.*"))).unwrap();
        route.bind(&store).await.unwrap();

        assert!(route.is_bound());
        assert_eq!(route.descriptor().map(|d| d.columns.len()), Some(2));
    }

    #[tokio::test]
    async fn test_bind_with_missing_mapped_column_still_binds() {
        let store = MemoryStore::new().with_table("access_log", &["host"]);
        let mut route = TableRoute::from_section(&section(None)).unwrap();
        assert!(route.bind(&store).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_missing_table() {
        let store = MemoryStore::new();
        let mut route = TableRoute::from_section(&section(None)).unwrap();
        let err = route.bind(&store).await.unwrap_err();

        assert_eq!(err.table, "access_log");
        assert_eq!(err.source.kind(), ErrorKind::Deterministic);
        assert!(!route.is_bound());
    }
}
