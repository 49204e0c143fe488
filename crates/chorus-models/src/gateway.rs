use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::FeedPost;
use crate::notification::Notification;
use crate::{ConnectionId, ConversationId, UserId};

// Client -> Server event names
pub const EVENT_AUTH: &str = "auth";
pub const EVENT_CONVERSATION_JOIN: &str = "conversation:join";
pub const EVENT_CONVERSATION_LEAVE: &str = "conversation:leave";
pub const EVENT_FEED_SUBSCRIBE: &str = "feed:subscribe";
pub const EVENT_FEED_UNSUBSCRIBE: &str = "feed:unsubscribe";
pub const EVENT_MESSAGE_SEND: &str = "message:send";

// Shared by both directions
pub const EVENT_TYPING_START: &str = "typing:start";
pub const EVENT_TYPING_STOP: &str = "typing:stop";
pub const EVENT_NOTIFICATION_READ: &str = "notification:read";
pub const EVENT_NOTIFICATION_READ_ALL: &str = "notification:read_all";

// Server -> Client event names
pub const EVENT_AUTH_SUCCESS: &str = "auth:success";
pub const EVENT_AUTH_ERROR: &str = "auth:error";
pub const EVENT_NOTIFICATION_NEW: &str = "notification:new";
pub const EVENT_NOTIFICATION_FOLLOW: &str = "notification:follow";
pub const EVENT_NOTIFICATION_LIKE: &str = "notification:like";
pub const EVENT_NOTIFICATION_COMMENT: &str = "notification:comment";
pub const EVENT_NOTIFICATION_MESSAGE: &str = "notification:message";
pub const EVENT_MESSAGE_NEW: &str = "message:new";
pub const EVENT_MESSAGE_DELIVERED: &str = "message:delivered";
pub const EVENT_FEED_UPDATE: &str = "feed:update";
pub const EVENT_USER_ONLINE: &str = "user:online";
pub const EVENT_USER_OFFLINE: &str = "user:offline";
pub const EVENT_RATE_LIMITED: &str = "rate_limited";

/// Frames sent by clients. The `event` field selects the variant.
///
/// Identifier fields are camelCase; the capitalised `ID` spellings used by
/// older clients are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientMessage {
    #[serde(rename = "auth", rename_all = "camelCase")]
    Auth {
        #[serde(alias = "userID")]
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart {
        #[serde(alias = "conversationID")]
        conversation_id: ConversationId,
        #[serde(default, alias = "userID", skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop {
        #[serde(alias = "conversationID")]
        conversation_id: ConversationId,
        #[serde(default, alias = "userID", skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    #[serde(rename = "conversation:join", rename_all = "camelCase")]
    ConversationJoin {
        #[serde(alias = "conversationID")]
        conversation_id: ConversationId,
    },
    #[serde(rename = "conversation:leave", rename_all = "camelCase")]
    ConversationLeave {
        #[serde(alias = "conversationID")]
        conversation_id: ConversationId,
    },
    #[serde(rename = "feed:subscribe")]
    FeedSubscribe,
    #[serde(rename = "feed:unsubscribe")]
    FeedUnsubscribe,
    #[serde(rename = "message:send", rename_all = "camelCase")]
    MessageSend {
        #[serde(alias = "recipientID")]
        recipient_id: UserId,
        #[serde(default, alias = "senderID", skip_serializing_if = "Option::is_none")]
        sender_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename = "notification:read", rename_all = "camelCase")]
    NotificationRead {
        #[serde(alias = "notificationID")]
        notification_id: String,
    },
    #[serde(rename = "notification:read_all")]
    NotificationReadAll,
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => EVENT_AUTH,
            ClientMessage::TypingStart { .. } => EVENT_TYPING_START,
            ClientMessage::TypingStop { .. } => EVENT_TYPING_STOP,
            ClientMessage::ConversationJoin { .. } => EVENT_CONVERSATION_JOIN,
            ClientMessage::ConversationLeave { .. } => EVENT_CONVERSATION_LEAVE,
            ClientMessage::FeedSubscribe => EVENT_FEED_SUBSCRIBE,
            ClientMessage::FeedUnsubscribe => EVENT_FEED_UNSUBSCRIBE,
            ClientMessage::MessageSend { .. } => EVENT_MESSAGE_SEND,
            ClientMessage::NotificationRead { .. } => EVENT_NOTIFICATION_READ,
            ClientMessage::NotificationReadAll => EVENT_NOTIFICATION_READ_ALL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNew {
    pub id: String,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelivered {
    pub message_id: String,
    pub recipient_id: UserId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub post: FeedPost,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthErrorPayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReadPayload {
    pub notification_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAllPayload {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimited {
    pub retry_after_ms: u64,
}

/// Frames pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "auth:success")]
    AuthSuccess(AuthSuccess),
    #[serde(rename = "auth:error")]
    AuthError(AuthErrorPayload),
    #[serde(rename = "notification:new")]
    NotificationNew(Notification),
    #[serde(rename = "notification:follow")]
    NotificationFollow(Notification),
    #[serde(rename = "notification:like")]
    NotificationLike(Notification),
    #[serde(rename = "notification:comment")]
    NotificationComment(Notification),
    #[serde(rename = "notification:message")]
    NotificationMessage(Notification),
    #[serde(rename = "notification:read")]
    NotificationRead(NotificationReadPayload),
    #[serde(rename = "notification:read_all")]
    NotificationReadAll(ReadAllPayload),
    #[serde(rename = "typing:start")]
    TypingStart(TypingPayload),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingPayload),
    #[serde(rename = "message:new")]
    MessageNew(MessageNew),
    #[serde(rename = "message:delivered")]
    MessageDelivered(MessageDelivered),
    #[serde(rename = "feed:update")]
    FeedUpdate(FeedUpdate),
    #[serde(rename = "user:online")]
    UserOnline(PresencePayload),
    #[serde(rename = "user:offline")]
    UserOffline(PresencePayload),
    #[serde(rename = "rate_limited")]
    RateLimited(RateLimited),
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::AuthSuccess(_) => EVENT_AUTH_SUCCESS,
            ServerEvent::AuthError(_) => EVENT_AUTH_ERROR,
            ServerEvent::NotificationNew(_) => EVENT_NOTIFICATION_NEW,
            ServerEvent::NotificationFollow(_) => EVENT_NOTIFICATION_FOLLOW,
            ServerEvent::NotificationLike(_) => EVENT_NOTIFICATION_LIKE,
            ServerEvent::NotificationComment(_) => EVENT_NOTIFICATION_COMMENT,
            ServerEvent::NotificationMessage(_) => EVENT_NOTIFICATION_MESSAGE,
            ServerEvent::NotificationRead(_) => EVENT_NOTIFICATION_READ,
            ServerEvent::NotificationReadAll(_) => EVENT_NOTIFICATION_READ_ALL,
            ServerEvent::TypingStart(_) => EVENT_TYPING_START,
            ServerEvent::TypingStop(_) => EVENT_TYPING_STOP,
            ServerEvent::MessageNew(_) => EVENT_MESSAGE_NEW,
            ServerEvent::MessageDelivered(_) => EVENT_MESSAGE_DELIVERED,
            ServerEvent::FeedUpdate(_) => EVENT_FEED_UPDATE,
            ServerEvent::UserOnline(_) => EVENT_USER_ONLINE,
            ServerEvent::UserOffline(_) => EVENT_USER_OFFLINE,
            ServerEvent::RateLimited(_) => EVENT_RATE_LIMITED,
        }
    }

    /// The notification carried by this event, if it is one of the
    /// `notification:*` kinds that create a new entry.
    pub fn notification(&self) -> Option<&Notification> {
        match self {
            ServerEvent::NotificationNew(n)
            | ServerEvent::NotificationFollow(n)
            | ServerEvent::NotificationLike(n)
            | ServerEvent::NotificationComment(n)
            | ServerEvent::NotificationMessage(n) => Some(n),
            _ => None,
        }
    }
}
