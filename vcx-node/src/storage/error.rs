use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[cfg(feature = "storage")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Record not found: {category}/{id}")]
    NotFound { category: String, id: String },

    #[error("Duplicate record: {category}/{id}")]
    Duplicate { category: String, id: String },

    #[error("Version conflict on {category}/{id}: expected {expected}, found {actual}")]
    VersionConflict {
        category: String,
        id: String,
        expected: i64,
        actual: i64,
    },
}
