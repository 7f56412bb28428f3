use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::trace;

use super::{StorageBackend, StorageError, StoredRecord, Tags};

/// In-process storage backend.
///
/// Rows live in a [`DashMap`] keyed by `(category, id)`. A replace holds the
/// shard lock of its row while it compares versions, so concurrent writers
/// to the same row are serialized and all but one see a version conflict.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    rows: DashMap<(String, String), StoredRecord>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(category: &str, id: &str) -> (String, String) {
        (category.to_string(), id.to_string())
    }

    fn collect<F>(&self, category: &str, filter: F) -> Vec<StoredRecord>
    where
        F: Fn(&StoredRecord) -> bool,
    {
        let mut rows: Vec<StoredRecord> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == category && filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rows
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn insert(
        &self,
        category: &str,
        id: &str,
        value: Value,
        tags: Tags,
    ) -> Result<StoredRecord, StorageError> {
        match self.rows.entry(Self::key(category, id)) {
            Entry::Occupied(_) => Err(StorageError::Duplicate {
                category: category.to_string(),
                id: id.to_string(),
            }),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let row = StoredRecord {
                    category: category.to_string(),
                    id: id.to_string(),
                    value,
                    tags,
                    version: 1,
                    created_at: now,
                    updated_at: now,
                };
                slot.insert(row.clone());
                trace!("Inserted {}/{}", category, id);
                Ok(row)
            }
        }
    }

    async fn get(&self, category: &str, id: &str) -> Result<Option<StoredRecord>, StorageError> {
        Ok(self
            .rows
            .get(&Self::key(category, id))
            .map(|row| row.value().clone()))
    }

    async fn replace(
        &self,
        category: &str,
        id: &str,
        value: Value,
        tags: Tags,
        expected_version: i64,
    ) -> Result<StoredRecord, StorageError> {
        let mut row = self
            .rows
            .get_mut(&Self::key(category, id))
            .ok_or_else(|| StorageError::NotFound {
                category: category.to_string(),
                id: id.to_string(),
            })?;

        if row.version != expected_version {
            return Err(StorageError::VersionConflict {
                category: category.to_string(),
                id: id.to_string(),
                expected: expected_version,
                actual: row.version,
            });
        }

        row.value = value;
        row.tags = tags;
        row.version += 1;
        row.updated_at = Utc::now();
        trace!("Replaced {}/{} at version {}", category, id, row.version);
        Ok(row.clone())
    }

    async fn remove(&self, category: &str, id: &str) -> Result<bool, StorageError> {
        Ok(self.rows.remove(&Self::key(category, id)).is_some())
    }

    async fn list(&self, category: &str) -> Result<Vec<StoredRecord>, StorageError> {
        Ok(self.collect(category, |_| true))
    }

    async fn search(
        &self,
        category: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        Ok(self.collect(category, |row| {
            row.tags.get(tag_key).map(String::as_str) == Some(tag_value)
        }))
    }
}
