use std::fmt;
use std::str::FromStr;

use crate::{ConversationId, UserId};

/// Name of a broadcast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomName {
    /// Private notifications for one user; joined automatically on auth.
    User(UserId),
    /// Participants of one conversation; explicit join/leave.
    Conversation(ConversationId),
    /// Opt-in "new content available" signal.
    FeedGlobal,
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomName::User(id) => write!(f, "user:{id}"),
            RoomName::Conversation(id) => write!(f, "conversation:{id}"),
            RoomName::FeedGlobal => f.write_str("feed:global"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid room name: {0}")]
pub struct InvalidRoomName(pub String);

impl FromStr for RoomName {
    type Err = InvalidRoomName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "feed:global" {
            return Ok(RoomName::FeedGlobal);
        }
        let invalid = || InvalidRoomName(s.to_string());
        let (kind, id) = s.split_once(':').ok_or_else(invalid)?;
        let id = id.parse::<i64>().map_err(|_| invalid())?;
        match kind {
            "user" => Ok(RoomName::User(id)),
            "conversation" => Ok(RoomName::Conversation(id)),
            _ => Err(invalid()),
        }
    }
}
