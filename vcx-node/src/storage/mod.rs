//! Storage backends for framework records
//!
//! Registries persist their records through a [`StorageBackend`]: a small
//! key-value interface over versioned JSON rows grouped by category
//! (`dids`, `connections`, `mediators`, `keys`). Every row carries a set of string
//! tags used for lookups and a version that increases on every write, which
//! is what the registries use for optimistic concurrency.
//!
//! # Backends
//!
//! - [`InMemoryStorage`]: concurrent map, always available. Used by tests and
//!   by deployments that do not need state across restarts.
//! - [`SqliteStorage`]: SQLite through sqlx (feature `storage`). Schema is
//!   migrated automatically on open.
//!
//! # Environment Variables
//!
//! - `VCX_DB_PATH`: Override the default database path (`vcx-node.db`)

#[cfg(feature = "storage")]
pub mod db;
pub mod error;
pub mod keys;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;

#[cfg(feature = "storage")]
pub use db::SqliteStorage;
pub use error::StorageError;
pub use keys::StoredCryptoProvider;
pub use memory::InMemoryStorage;

/// Tags attached to a stored row.
pub type Tags = HashMap<String, String>;

/// A persisted row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub category: String,
    pub id: String,
    pub value: Value,
    pub tags: Tags,
    /// Starts at 1 and increases by one on every successful replace.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence capability used by the registries.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Insert a new row. Fails with [`StorageError::Duplicate`] if the id is taken.
    async fn insert(
        &self,
        category: &str,
        id: &str,
        value: Value,
        tags: Tags,
    ) -> Result<StoredRecord, StorageError>;

    async fn get(&self, category: &str, id: &str) -> Result<Option<StoredRecord>, StorageError>;

    /// Replace a row if its version still equals `expected_version`.
    async fn replace(
        &self,
        category: &str,
        id: &str,
        value: Value,
        tags: Tags,
        expected_version: i64,
    ) -> Result<StoredRecord, StorageError>;

    /// Remove a row. Returns whether it existed.
    async fn remove(&self, category: &str, id: &str) -> Result<bool, StorageError>;

    /// All rows of a category, oldest first.
    async fn list(&self, category: &str) -> Result<Vec<StoredRecord>, StorageError>;

    /// Rows of a category whose tag `tag_key` equals `tag_value`, oldest first.
    async fn search(
        &self,
        category: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<StoredRecord>, StorageError>;
}
