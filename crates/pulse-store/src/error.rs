use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the parent directory of the database file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lookup by id matched no row.
    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    /// Poisoned connection lock or a blocking worker that never returned.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Attachment or metadata column that is not valid JSON.
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
