use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{StorageBackend, StorageError, StoredRecord, Tags};

type RecordRow = (String, String, Value, Json<Tags>, i64, String, String);

const SELECT_COLUMNS: &str =
    "SELECT category, id, value, tags, version, created_at, updated_at FROM records";

/// SQLite storage backend
///
/// All categories share one `records` table keyed by `(category, id)`.
/// Replaces are `UPDATE ... WHERE version = ?`, so the database itself
/// arbitrates concurrent writers to a row.
///
/// # Example
///
/// ```no_run
/// use vcx_node::storage::SqliteStorage;
/// use std::path::PathBuf;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Uses VCX_DB_PATH or ./vcx-node.db
/// let storage = SqliteStorage::new(None).await?;
///
/// // Explicit location
/// let storage = SqliteStorage::new(Some(PathBuf::from("/var/lib/vcx/records.db"))).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct SqliteStorage {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl SqliteStorage {
    /// Create a new in-memory storage instance for testing
    pub async fn new_in_memory() -> Result<Self, StorageError> {
        info!("Initializing in-memory storage for testing");

        // A single connection keeps every query on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite://:memory:")
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(SqliteStorage {
            pool,
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Open (or create) the database at `path`, falling back to
    /// `VCX_DB_PATH` and then `./vcx-node.db`, and run pending migrations.
    pub async fn new(path: Option<PathBuf>) -> Result<Self, StorageError> {
        let db_path = path.unwrap_or_else(|| {
            env::var("VCX_DB_PATH")
                .unwrap_or_else(|_| "vcx-node.db".to_string())
                .into()
        });

        info!("Initializing storage at: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(SqliteStorage { pool, db_path })
    }

    /// Get the database path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn timestamp(now: DateTime<Utc>) -> String {
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::InvalidRow(format!("bad timestamp `{}`: {}", value, e)))
    }

    fn into_record(row: RecordRow) -> Result<StoredRecord, StorageError> {
        let (category, id, value, tags, version, created_at, updated_at) = row;
        Ok(StoredRecord {
            category,
            id,
            value,
            tags: tags.0,
            version,
            created_at: Self::parse_timestamp(&created_at)?,
            updated_at: Self::parse_timestamp(&updated_at)?,
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn insert(
        &self,
        category: &str,
        id: &str,
        value: Value,
        tags: Tags,
    ) -> Result<StoredRecord, StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO records (category, id, value, tags, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
            "#,
        )
        .bind(category)
        .bind(id)
        .bind(&value)
        .bind(Json(&tags))
        .bind(Self::timestamp(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Duplicate {
                category: category.to_string(),
                id: id.to_string(),
            });
        }

        debug!("Inserted {}/{}", category, id);
        Ok(StoredRecord {
            category: category.to_string(),
            id: id.to_string(),
            value,
            tags,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, category: &str, id: &str) -> Result<Option<StoredRecord>, StorageError> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "{} WHERE category = ?1 AND id = ?2",
            SELECT_COLUMNS
        ))
        .bind(category)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::into_record).transpose()
    }

    async fn replace(
        &self,
        category: &str,
        id: &str,
        value: Value,
        tags: Tags,
        expected_version: i64,
    ) -> Result<StoredRecord, StorageError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE records
            SET value = ?1, tags = ?2, version = version + 1, updated_at = ?3
            WHERE category = ?4 AND id = ?5 AND version = ?6
            "#,
        )
        .bind(&value)
        .bind(Json(&tags))
        .bind(Self::timestamp(now))
        .bind(category)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(category, id).await? {
                None => Err(StorageError::NotFound {
                    category: category.to_string(),
                    id: id.to_string(),
                }),
                Some(current) => Err(StorageError::VersionConflict {
                    category: category.to_string(),
                    id: id.to_string(),
                    expected: expected_version,
                    actual: current.version,
                }),
            };
        }

        self.get(category, id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                category: category.to_string(),
                id: id.to_string(),
            })
    }

    async fn remove(&self, category: &str, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM records WHERE category = ?1 AND id = ?2")
            .bind(category)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, category: &str) -> Result<Vec<StoredRecord>, StorageError> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "{} WHERE category = ?1 ORDER BY created_at, id",
            SELECT_COLUMNS
        ))
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::into_record).collect()
    }

    async fn search(
        &self,
        category: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let path = format!("$.\"{}\"", tag_key.replace('"', ""));
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "{} WHERE category = ?1 AND json_extract(tags, ?2) = ?3 ORDER BY created_at, id",
            SELECT_COLUMNS
        ))
        .bind(category)
        .bind(path)
        .bind(tag_value)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::into_record).collect()
    }
}
