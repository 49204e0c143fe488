use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notification::{Actor, NotificationKind};
use crate::{ConversationId, PostId, UserId};

/// Minimal description of a new post, enough for a "new content" hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPost {
    pub id: PostId,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A domain event produced by a CRUD collaborator after its mutation commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    Follow {
        target_user_id: UserId,
        actor: Actor,
    },
    Like {
        target_user_id: UserId,
        actor: Actor,
        post_id: PostId,
    },
    Comment {
        target_user_id: UserId,
        actor: Actor,
        post_id: PostId,
        comment: String,
    },
    Message {
        target_user_id: UserId,
        actor: Actor,
        conversation_id: ConversationId,
        content: String,
    },
    Post {
        post: FeedPost,
    },
    Generic {
        target_user_id: UserId,
        #[serde(rename = "type")]
        notification_type: NotificationKind,
        title: String,
        message: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}
