use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeteringError>;

#[derive(Error, Debug)]
pub enum MeteringError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Processor rejected usage ({status}): {message}")]
    Processor { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Whether a database error is a UNIQUE constraint collision.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
