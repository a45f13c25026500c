use thiserror::Error;

pub type OutboxResult<T> = std::result::Result<T, OutboxError>;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    Publish(#[from] message_bus::BusError),
}
