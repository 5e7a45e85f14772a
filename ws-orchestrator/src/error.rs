use thiserror::Error;
use ws_provider::ProviderError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Workspace not found: {0}")]
    NotFound(String),

    #[error("User {user_id} does not own workspace {workspace_id}")]
    Unauthorized {
        workspace_id: String,
        user_id: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Boot configuration error: {0}")]
    Template(#[from] tera::Error),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Whether a job failing with this error should be attempted again.
    ///
    /// Ownership violations and missing or invalid targets will fail the same
    /// way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OrchestratorError::NotFound(_)
                | OrchestratorError::Unauthorized { .. }
                | OrchestratorError::InvalidInput(_)
        )
    }
}
