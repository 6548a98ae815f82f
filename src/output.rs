//! Output stage entry point
//!
//! [`OutputCoordinator`] is what the host drives: it is started once from the
//! configuration, handed one chunk at a time, and shut down when the host
//! stops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Instrument;

use crate::chunk::Chunk;
use crate::config::SinkConfig;
use crate::error::{SinkError, SinkResult};
use crate::import::{ImportEngine, ImportReport};
use crate::pattern::TagPrefix;
use crate::registry::TableRegistry;
use crate::route::TableRoute;
use crate::store::RecordStore;

pub struct OutputCoordinator {
    registry: TableRegistry,
    engine: ImportEngine,
    tag_prefix: Option<TagPrefix>,
    stopping: AtomicBool,
}

impl OutputCoordinator {
    /// Build and bind the routing table
    ///
    /// Fails if the configuration is invalid or the default table can't be
    /// bound.
    pub async fn start(config: &SinkConfig, store: Arc<dyn RecordStore>) -> SinkResult<Self> {
        let tag_prefix = config.tag_prefix()?;
        let mut registry = TableRegistry::from_config(config)?;
        registry.bind(store.as_ref()).await?;

        tracing::info!(
            backend = store.backend_type(),
            routes = registry.routes().len(),
            default_table = %registry.default_route().table(),
            enable_fallback = config.enable_fallback,
            "Output stage started"
        );

        Ok(Self {
            registry,
            engine: ImportEngine::new(store, config.enable_fallback),
            tag_prefix,
            stopping: AtomicBool::new(false),
        })
    }

    /// Route for a chunk tag, after prefix removal
    pub fn resolve(&self, tag: &str) -> &TableRoute {
        match &self.tag_prefix {
            Some(prefix) => self.registry.resolve(&prefix.strip(tag)),
            None => self.registry.resolve(tag),
        }
    }

    /// Import one chunk
    ///
    /// An `Err` means the host must keep the chunk and deliver it again.
    pub async fn handle(&self, chunk: &Chunk) -> SinkResult<ImportReport> {
        if self.is_stopping() {
            return Err(SinkError::ShuttingDown);
        }

        let route = self.resolve(chunk.tag());
        let span = tracing::info_span!(
            "chunk",
            chunk_id = %chunk.unique_id(),
            tag = chunk.tag(),
            table = %route.table()
        );

        async {
            let report = self.engine.import(route, chunk).await?;
            tracing::info!(
                outcome = ?report.outcome,
                imported = report.imported,
                malformed = report.malformed,
                dropped = report.dropped(),
                retries = report.retries,
                fallback = report.fallback,
                "Chunk written"
            );
            Ok::<_, SinkError>(report)
        }
        .instrument(span)
        .await
    }

    /// Reject further chunks and release the store
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.engine.store().close().await {
            tracing::warn!(error = %e, "Failed to close store");
        }
        tracing::info!("Output stage stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkBuilder, EventTime};
    use crate::config::TableSection;
    use crate::error::ConfigError;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn config() -> SinkConfig {
        SinkConfig {
            remove_tag_prefix: Some("app.".to_string()),
            ..SinkConfig::new("duckdb", ":memory:")
        }
        .with_table(TableSection::new(Some("access.*"), "access_log", "host"))
        .with_table(TableSection::new(None, "events", "message"))
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(
            MemoryStore::new()
                .with_table("access_log", &["host"])
                .with_table("events", &["message"]),
        )
    }

    #[tokio::test]
    async fn test_prefix_is_removed_before_routing() {
        let coordinator = OutputCoordinator::start(&config(), store()).await.unwrap();
        assert_eq!(coordinator.resolve("app.access.web").table().name(), "access_log");
        assert_eq!(coordinator.resolve("access.web").table().name(), "access_log");
        assert_eq!(coordinator.resolve("app.app.access.web").table().name(), "events");
    }

    #[tokio::test]
    async fn test_start_without_default_table_fails() {
        let config = SinkConfig::new("duckdb", ":memory:")
            .with_table(TableSection::new(Some("access.*"), "access_log", "host"));
        let result = OutputCoordinator::start(&config, store()).await;
        assert!(matches!(
            result,
            Err(SinkError::Config(ConfigError::MissingDefaultTable))
        ));
    }

    #[tokio::test]
    async fn test_start_fails_when_default_table_missing_in_store() {
        let store = Arc::new(MemoryStore::new().with_table("access_log", &["host"]));
        let result = OutputCoordinator::start(&config(), store).await;
        assert!(matches!(result, Err(SinkError::Bind(_))));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_chunks() {
        let store = store();
        let coordinator = OutputCoordinator::start(&config(), store.clone()).await.unwrap();

        let mut builder = ChunkBuilder::new("app.access.web");
        builder
            .push(EventTime::now(), json!({"host": "a"}).as_object().unwrap())
            .unwrap();
        let chunk = builder.build();

        coordinator.handle(&chunk).await.unwrap();
        coordinator.shutdown().await;
        assert!(coordinator.is_stopping());
        assert!(matches!(
            coordinator.handle(&chunk).await,
            Err(SinkError::ShuttingDown)
        ));
        assert_eq!(store.rows("access_log").len(), 1);
    }
}
