use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Store operation timed out")]
    Unavailable,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl StoreError {
    /// Duplicate-key violations surface as `Conflict`, everything else stays
    /// a database error.
    pub fn from_insert(err: sqlx::Error, what: &str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("{what} already exists"))
            }
            _ => StoreError::Database(err),
        }
    }
}
