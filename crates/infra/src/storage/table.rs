use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};

use super::{StorageError, WritePrecondition, WriteResult};

/// A row in a partitioned table.
///
/// `timestamp` and `version` are maintained by the store and reflect the last
/// write.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub version: Option<u64>,
    pub properties: Map<String, JsonValue>,
}

impl TableEntity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            timestamp: None,
            version: None,
            properties: Map::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.properties.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(JsonValue::as_str)
    }
}

/// Row filter evaluated by the store.
///
/// String comparisons are ordinal, which makes `Ge`/`Lt` usable as prefix
/// ranges.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, JsonValue),
    Ge(String, JsonValue),
    Lt(String, JsonValue),
    /// Row timestamp (last write) at or after the instant.
    TimestampGe(DateTime<Utc>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Filter::Eq(name.into(), value.into())
    }

    pub fn ge(name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Filter::Ge(name.into(), value.into())
    }

    pub fn lt(name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Filter::Lt(name.into(), value.into())
    }

    /// Evaluate against a row.
    pub fn matches(&self, entity: &TableEntity) -> bool {
        match self {
            Filter::Eq(name, value) => entity.get(name) == Some(value),
            Filter::Ge(name, value) => entity
                .get(name)
                .and_then(|v| compare(v, value))
                .is_some_and(|o| o != Ordering::Less),
            Filter::Lt(name, value) => entity
                .get(name)
                .and_then(|v| compare(v, value))
                .is_some_and(|o| o == Ordering::Less),
            Filter::TimestampGe(at) => entity.timestamp.is_some_and(|ts| ts >= *at),
            Filter::And(filters) => filters.iter().all(|f| f.matches(entity)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entity)),
        }
    }
}

pub(crate) fn compare(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Sort order of query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub property: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn descending(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            descending: true,
        }
    }
}

/// A single page request.
#[derive(Debug, Clone, PartialEq)]
pub struct TableQuery {
    pub partition_key: Option<String>,
    pub filter: Option<Filter>,
    pub order_by: Option<OrderBy>,
    pub page_size: usize,
    pub continuation: Option<String>,
}

impl Default for TableQuery {
    fn default() -> Self {
        Self {
            partition_key: None,
            filter: None,
            order_by: None,
            page_size: 100,
            continuation: None,
        }
    }
}

/// One page of results; `continuation` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TablePage {
    pub entities: Vec<TableEntity>,
    pub continuation: Option<String>,
}

/// Partitioned table store.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>, StorageError>;

    /// Insert or replace the row; the stored timestamp is set by the store.
    async fn upsert(&self, table: &str, entity: TableEntity) -> Result<(), StorageError>;

    /// Insert or replace the row only if `precondition` holds against the
    /// stored version. A failed precondition is not an error.
    async fn upsert_if(
        &self,
        table: &str,
        entity: TableEntity,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StorageError>;

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<bool, StorageError>;

    async fn query(&self, table: &str, query: &TableQuery) -> Result<TablePage, StorageError>;
}

#[async_trait]
impl<S: TableStore + ?Sized> TableStore for Arc<S> {
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>, StorageError> {
        (**self).get(table, partition_key, row_key).await
    }

    async fn upsert(&self, table: &str, entity: TableEntity) -> Result<(), StorageError> {
        (**self).upsert(table, entity).await
    }

    async fn upsert_if(
        &self,
        table: &str,
        entity: TableEntity,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StorageError> {
        (**self).upsert_if(table, entity, precondition).await
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<bool, StorageError> {
        (**self).delete(table, partition_key, row_key).await
    }

    async fn query(&self, table: &str, query: &TableQuery) -> Result<TablePage, StorageError> {
        (**self).query(table, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_range_matches_only_prefixed_values() {
        let filter = Filter::And(vec![
            Filter::ge("Command", "Project"),
            Filter::lt("Command", "Projecu"),
        ]);

        let row = |name: &str| TableEntity::new("o", "r").with("Command", name);
        assert!(filter.matches(&row("ProjectCreateCommand")));
        assert!(filter.matches(&row("Project")));
        assert!(!filter.matches(&row("ComponentCreateCommand")));
    }

    #[test]
    fn missing_property_never_matches_comparisons() {
        let row = TableEntity::new("o", "r");
        assert!(!Filter::ge("Created", "2020").matches(&row));
        assert!(!Filter::eq("ProjectId", "x").matches(&row));
    }
}
