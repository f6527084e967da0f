use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One page of a listing, with the token to fetch the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            continuation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub last_modified: DateTime<Utc>,
}

/// HTTP content headers served with a committed blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub name: String,
    pub size: u64,
}

/// The blocks of a blob, as reported by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockList {
    pub committed: Vec<BlockInfo>,
    pub uncommitted: Vec<BlockInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Aborted,
    Failed,
}

/// A row in a storage table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl TableEntity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyCondition {
    Equals(String, Value),
    NotEquals(String, Value),
}

/// Conjunction of conditions on table entities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFilter {
    pub partition_key: Option<String>,
    pub conditions: Vec<PropertyCondition>,
}

impl EntityFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: Some(partition_key.into()),
            conditions: Vec::new(),
        }
    }

    pub fn property_eq(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push(PropertyCondition::Equals(name.into(), value.into()));
        self
    }

    pub fn property_ne(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push(PropertyCondition::NotEquals(name.into(), value.into()));
        self
    }

    pub fn matches(&self, entity: &TableEntity) -> bool {
        if let Some(partition_key) = &self.partition_key {
            if partition_key != &entity.partition_key {
                return false;
            }
        }

        self.conditions.iter().all(|condition| match condition {
            PropertyCondition::Equals(name, value) => entity.properties.get(name) == Some(value),
            PropertyCondition::NotEquals(name, value) => {
                entity.properties.get(name) != Some(value)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_partition_and_properties() {
        let entity = TableEntity::new("events-committed", "blob_1")
            .with_property("container_name", "convoy-2024-01-01")
            .with_property("log_state", "committed");

        assert!(EntityFilter::all().matches(&entity));
        assert!(EntityFilter::partition("events-committed").matches(&entity));
        assert!(!EntityFilter::partition("events-uploading").matches(&entity));

        let filter = EntityFilter::all()
            .property_eq("container_name", "convoy-2024-01-01")
            .property_ne("log_state", "notified");
        assert!(filter.matches(&entity));

        let filter = EntityFilter::all().property_ne("log_state", "committed");
        assert!(!filter.matches(&entity));
    }
}
