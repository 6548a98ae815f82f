//! Tag to table routing

use crate::config::{SinkConfig, TableSection};
use crate::error::{BindError, ConfigError};
use crate::route::TableRoute;
use crate::store::RecordStore;

/// Ordered set of routes plus the mandatory default route
#[derive(Debug, Clone)]
pub struct TableRegistry {
    routes: Vec<TableRoute>,
    default: TableRoute,
}

impl TableRegistry {
    pub fn from_config(config: &SinkConfig) -> Result<Self, ConfigError> {
        Self::from_sections(&config.tables)
    }

    /// Build routes in declaration order
    ///
    /// # Arguments
    ///
    /// * `sections` - `[[table]]` sections as declared
    ///
    /// # Returns
    ///
    /// The registry, or `MissingDefaultTable` if no section lacks a pattern.
    /// Extra default sections are ignored with a warning.
    pub fn from_sections(sections: &[TableSection]) -> Result<Self, ConfigError> {
        let mut routes = Vec::new();
        let mut default: Option<TableRoute> = None;

        for section in sections {
            let route = TableRoute::from_section(section)?;
            if !route.is_default() {
                routes.push(route);
            } else if let Some(first) = &default {
                tracing::warn!(
                    table = %route.table(),
                    kept = %first.table(),
                    "Multiple default tables defined; ignoring this one"
                );
            } else {
                default = Some(route);
            }
        }

        let default = default.ok_or(ConfigError::MissingDefaultTable)?;
        Ok(Self { routes, default })
    }

    /// First matching route in declaration order, else the default route
    pub fn resolve(&self, tag: &str) -> &TableRoute {
        self.routes
            .iter()
            .find(|route| route.matches(tag))
            .unwrap_or(&self.default)
    }

    /// Bind every route against the store
    ///
    /// Routes that fail to bind are dropped with a warning. A failure on the
    /// default route is returned.
    pub async fn bind(&mut self, store: &dyn RecordStore) -> Result<(), BindError> {
        let mut bound = Vec::with_capacity(self.routes.len());
        for mut route in std::mem::take(&mut self.routes) {
            match route.bind(store).await {
                Ok(()) => bound.push(route),
                Err(e) => tracing::warn!(
                    table = %route.table(),
                    pattern = route.pattern_str(),
                    error = %e.source,
                    "Can't handle table; ignoring it"
                ),
            }
        }
        self.routes = bound;

        self.default.bind(store).await
    }

    /// Non-default routes in declaration order
    pub fn routes(&self) -> &[TableRoute] {
        &self.routes
    }

    pub fn default_route(&self) -> &TableRoute {
        &self.default
    }
}
