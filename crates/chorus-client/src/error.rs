use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("client task has stopped")]
    Closed,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
