use chorus_models::{ConnectionId, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("connection {0} is not attached")]
    NotAttached(ConnectionId),
    #[error("user {user_id} already has {limit} live connections")]
    ConnectionLimit { user_id: UserId, limit: usize },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
