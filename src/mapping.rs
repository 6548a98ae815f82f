//! Column mapping: `key[:column]` specifications
//!
//! A mapping is parsed once from a comma-separated list such as
//! `"host:client_host,path,code:status"` and projects a raw record onto the
//! destination columns. Keys that are not listed are dropped.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::store::Row;

/// Ordered source key to destination column mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pairs: Vec<(String, String)>,
}

impl ColumnMapping {
    /// Parse a `key[:column],...` specification
    ///
    /// Whitespace around keys and columns is ignored. A key without a column
    /// maps to a column of the same name. If a key appears twice it keeps its
    /// first position and takes the last column.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidColumnMapping {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        if spec.trim().is_empty() {
            return Err(invalid("mapping is empty"));
        }

        let mut pairs: Vec<(String, String)> = Vec::new();
        for item in spec.split(',') {
            let (key, column) = match item.split_once(':') {
                Some((key, column)) => {
                    let column = column.trim();
                    if column.is_empty() {
                        return Err(invalid(&format!("empty column for key '{}'", key.trim())));
                    }
                    (key.trim(), column)
                }
                None => (item.trim(), item.trim()),
            };

            if key.is_empty() {
                return Err(invalid("empty key"));
            }

            match pairs.iter_mut().find(|(k, _)| k == key) {
                Some(existing) => existing.1 = column.to_string(),
                None => pairs.push((key.to_string(), column.to_string())),
            }
        }

        Ok(Self { pairs })
    }

    /// Project a record onto the mapped columns
    pub fn apply(&self, fields: &serde_json::Map<String, serde_json::Value>) -> Row {
        let mut row = Row::new();
        for (key, column) in &self.pairs {
            if let Some(value) = fields.get(key) {
                row.insert(column.clone(), value.clone());
            }
        }
        row
    }

    /// Destination columns in mapping order
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(_, column)| column.as_str())
    }

    /// `(key, column)` pairs in mapping order
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl FromStr for ColumnMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ColumnMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self
            .pairs
            .iter()
            .map(|(key, column)| {
                if key == column {
                    key.clone()
                } else {
                    format!("{}:{}", key, column)
                }
            })
            .collect();
        write!(f, "{}", items.join(","))
    }
}
