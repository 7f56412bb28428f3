//! Registries: typed persistence with change notification
//!
//! A [`Registry`] stores one record type through a [`StorageBackend`] and
//! publishes exactly one event on the [`EventBus`] for every successful
//! mutation. Three registries exist: DIDs, connections and mediators.
//!
//! # Persist then publish
//!
//! The write and its event form one unit. It runs in its own tokio task and
//! the caller awaits that task, so when a mutating call returns the event has
//! already been delivered to the listeners registered at that time. If the
//! caller's future is dropped midway, the task still finishes both halves:
//! a committed write is never left without its event.
//!
//! # Optimistic concurrency
//!
//! [`Registry::update`] reads the record with its storage version, applies the
//! patch and writes back with a version check. A writer that lost the race
//! gets [`RegistryError::Conflict`] and nothing is written or published.

pub mod models;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::RegistryError;
use crate::event::{Event, EventBus, EventKind, EventTopic};
use crate::storage::{StorageBackend, StorageError, StoredRecord};

pub use models::{
    ConnectionRecord, ConnectionRole, ConnectionState, DidRecord, DidRole, MediatorRecord,
    MediatorState,
};

/// A record type that can live in a [`Registry`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Storage category, e.g. `connections`.
    const CATEGORY: &'static str;
    /// Topic of the events published for this record type.
    const TOPIC: EventTopic;

    /// The field `update` can be conditioned on.
    type State: PartialEq + Clone + fmt::Debug + fmt::Display + Send + Sync + 'static;

    fn id(&self) -> &str;

    fn state(&self) -> Self::State;

    /// Tags stored next to the record for lookups.
    fn tags(&self) -> HashMap<String, String>;

    /// Set the modification time.
    fn touch(&mut self, now: DateTime<Utc>);
}

pub type DidRegistry = Registry<DidRecord>;
pub type ConnectionRegistry = Registry<ConnectionRecord>;
pub type MediatorRegistry = Registry<MediatorRecord>;

pub struct Registry<R> {
    storage: Arc<dyn StorageBackend>,
    events: Arc<EventBus>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for Registry<R> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            events: self.events.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: Record> fmt::Debug for Registry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("category", &R::CATEGORY)
            .field("storage", &self.storage)
            .finish()
    }
}

impl<R: Record> Registry<R> {
    pub fn new(storage: Arc<dyn StorageBackend>, events: Arc<EventBus>) -> Self {
        Self {
            storage,
            events,
            _record: PhantomData,
        }
    }

    /// Persist a new record and publish `created`. Returns the record id.
    pub async fn create(&self, record: R) -> Result<String, RegistryError> {
        let id = record.id().to_string();
        let value = Self::to_value(&id, &record)?;
        let tags = record.tags();

        let storage = self.storage.clone();
        let events = self.events.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            storage
                .insert(R::CATEGORY, &task_id, value.clone(), tags)
                .await
                .map_err(|e| Self::map_storage_error(&task_id, e))?;
            debug!("Created {} record {}", R::CATEGORY, task_id);
            events
                .publish(Event::new(EventKind::Created, R::TOPIC, task_id, value))
                .await;
            Ok::<(), RegistryError>(())
        });

        Self::join(&id, handle).await?;
        Ok(id)
    }

    /// Read a record. Never publishes.
    pub async fn read(&self, id: &str) -> Result<Option<R>, RegistryError> {
        match self.fetch(id).await? {
            Some(row) => Ok(Some(Self::from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Apply `patch` to the stored record and publish `updated`.
    ///
    /// Fails with `NotFound` if the record is absent and with `Conflict` if
    /// `expected_state` is given and differs from the stored state, or if
    /// another writer committed in between.
    pub async fn update(
        &self,
        id: &str,
        expected_state: Option<R::State>,
        patch: impl FnOnce(&mut R),
    ) -> Result<R, RegistryError> {
        let row = self.fetch(id).await?.ok_or_else(|| RegistryError::NotFound {
            category: R::CATEGORY,
            id: id.to_string(),
        })?;
        let version = row.version;
        let mut record = Self::from_row(row)?;

        if let Some(expected) = expected_state {
            let current = record.state();
            if current != expected {
                return Err(RegistryError::Conflict {
                    category: R::CATEGORY,
                    id: id.to_string(),
                    reason: format!("expected state {}, found {}", expected, current),
                });
            }
        }

        patch(&mut record);
        record.touch(Utc::now());
        let value = Self::to_value(id, &record)?;
        let tags = record.tags();

        let storage = self.storage.clone();
        let events = self.events.clone();
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            storage
                .replace(R::CATEGORY, &task_id, value.clone(), tags, version)
                .await
                .map_err(|e| Self::map_storage_error(&task_id, e))?;
            debug!("Updated {} record {} (version {})", R::CATEGORY, task_id, version + 1);
            events
                .publish(Event::new(EventKind::Updated, R::TOPIC, task_id, value))
                .await;
            Ok::<(), RegistryError>(())
        });

        Self::join(id, handle).await?;
        Ok(record)
    }

    /// Remove a record and publish `deleted` with its last value.
    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let storage = self.storage.clone();
        let events = self.events.clone();
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            let not_found = || RegistryError::NotFound {
                category: R::CATEGORY,
                id: task_id.clone(),
            };
            let last = storage
                .get(R::CATEGORY, &task_id)
                .await
                .map_err(|e| Self::map_storage_error(&task_id, e))?
                .ok_or_else(not_found)?;
            let removed = storage
                .remove(R::CATEGORY, &task_id)
                .await
                .map_err(|e| Self::map_storage_error(&task_id, e))?;
            if !removed {
                return Err(not_found());
            }
            debug!("Deleted {} record {}", R::CATEGORY, task_id);
            events
                .publish(Event::new(EventKind::Deleted, R::TOPIC, task_id.clone(), last.value))
                .await;
            Ok::<(), RegistryError>(())
        });

        Self::join(id, handle).await
    }

    /// All records, oldest first.
    pub async fn list(&self) -> Result<Vec<R>, RegistryError> {
        let rows = self
            .storage
            .list(R::CATEGORY)
            .await
            .map_err(|e| Self::map_storage_error(R::CATEGORY, e))?;
        rows.into_iter().map(Self::from_row).collect()
    }

    /// Records whose tag `key` equals `value`, oldest first.
    pub async fn find_by_tag(&self, key: &str, value: &str) -> Result<Vec<R>, RegistryError> {
        let rows = self
            .storage
            .search(R::CATEGORY, key, value)
            .await
            .map_err(|e| Self::map_storage_error(R::CATEGORY, e))?;
        rows.into_iter().map(Self::from_row).collect()
    }

    async fn fetch(&self, id: &str) -> Result<Option<StoredRecord>, RegistryError> {
        self.storage
            .get(R::CATEGORY, id)
            .await
            .map_err(|e| Self::map_storage_error(id, e))
    }

    async fn join(
        id: &str,
        handle: JoinHandle<Result<(), RegistryError>>,
    ) -> Result<(), RegistryError> {
        handle.await.map_err(|source| RegistryError::Aborted {
            id: id.to_string(),
            source,
        })?
    }

    fn to_value(id: &str, record: &R) -> Result<serde_json::Value, RegistryError> {
        serde_json::to_value(record).map_err(|source| RegistryError::Serialization {
            id: id.to_string(),
            source,
        })
    }

    fn from_row(row: StoredRecord) -> Result<R, RegistryError> {
        serde_json::from_value(row.value).map_err(|source| RegistryError::Serialization {
            id: row.id,
            source,
        })
    }

    fn map_storage_error(id: &str, error: StorageError) -> RegistryError {
        match error {
            StorageError::NotFound { .. } => RegistryError::NotFound {
                category: R::CATEGORY,
                id: id.to_string(),
            },
            StorageError::Duplicate { .. } => RegistryError::Duplicate {
                category: R::CATEGORY,
                id: id.to_string(),
            },
            StorageError::VersionConflict {
                expected, actual, ..
            } => RegistryError::Conflict {
                category: R::CATEGORY,
                id: id.to_string(),
                reason: format!("version {} expected, {} stored", expected, actual),
            },
            source => RegistryError::Storage {
                id: id.to_string(),
                source,
            },
        }
    }
}
