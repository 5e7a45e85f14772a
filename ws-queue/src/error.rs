use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Substrate error: {0}")]
    Substrate(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed job payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Workspace {0} already has a job in flight")]
    WorkspaceBusy(String),
}
