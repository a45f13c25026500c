use thiserror::Error;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}
