use std::sync::Arc;

use chorus_models::events::{DomainEvent, FeedPost};
use chorus_models::gateway::{FeedUpdate, ServerEvent};
use chorus_models::notification::{Actor, Notification, NotificationKind};
use chorus_models::room::RoomName;
use chorus_models::{ConversationId, PostId, UserId};
use chrono::Utc;

use crate::hub::RelayHub;

pub const COMMENT_PREVIEW_CHARS: usize = 100;
pub const MESSAGE_PREVIEW_CHARS: usize = 50;
pub const FEED_UPDATE_NEW_POST: &str = "new_post";

/// Emits domain events to whichever devices are connected right now.
///
/// Delivery is at-most-once and best-effort: a user with no live connection
/// simply misses the event. None of these calls block or fail; the return
/// value is the number of queued deliveries.
#[derive(Clone)]
pub struct Notifier {
    hub: Arc<RelayHub>,
}

impl Notifier {
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }

    pub fn send_notification(
        &self,
        target_user_id: UserId,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> usize {
        let notification = Notification::new(kind, title, message).with_data(data);
        self.to_user(target_user_id, ServerEvent::NotificationNew(notification))
    }

    pub fn send_follow_notification(&self, target_user_id: UserId, actor: &Actor) -> usize {
        if is_self_action(target_user_id, actor) {
            return 0;
        }
        let notification = Notification::new(
            NotificationKind::Follow,
            "New Follower",
            format!("{} started following you", actor.name),
        )
        .with_actor(actor)
        .with_target(actor.id);
        self.to_user(target_user_id, ServerEvent::NotificationFollow(notification))
    }

    pub fn send_like_notification(
        &self,
        target_user_id: UserId,
        actor: &Actor,
        post_id: PostId,
    ) -> usize {
        if is_self_action(target_user_id, actor) {
            return 0;
        }
        let notification = Notification::new(
            NotificationKind::Like,
            "New Like",
            format!("{} liked your post", actor.name),
        )
        .with_actor(actor)
        .with_target(post_id);
        self.to_user(target_user_id, ServerEvent::NotificationLike(notification))
    }

    pub fn send_comment_notification(
        &self,
        target_user_id: UserId,
        actor: &Actor,
        post_id: PostId,
        comment: &str,
    ) -> usize {
        if is_self_action(target_user_id, actor) {
            return 0;
        }
        let notification = Notification::new(
            NotificationKind::Comment,
            "New Comment",
            format!(
                "{} commented: {}",
                actor.name,
                preview(comment, COMMENT_PREVIEW_CHARS)
            ),
        )
        .with_actor(actor)
        .with_target(post_id);
        self.to_user(target_user_id, ServerEvent::NotificationComment(notification))
    }

    pub fn send_message_notification(
        &self,
        target_user_id: UserId,
        actor: &Actor,
        conversation_id: ConversationId,
        content: &str,
    ) -> usize {
        if is_self_action(target_user_id, actor) {
            return 0;
        }
        let notification = Notification::new(
            NotificationKind::Message,
            "New Message",
            format!("{}: {}", actor.name, preview(content, MESSAGE_PREVIEW_CHARS)),
        )
        .with_actor(actor)
        .with_target(conversation_id);
        self.to_user(target_user_id, ServerEvent::NotificationMessage(notification))
    }

    /// Hint feed subscribers that new content exists. Only `feed:global`
    /// members receive it.
    pub fn broadcast_feed_update(&self, post: FeedPost) -> usize {
        let event = ServerEvent::FeedUpdate(FeedUpdate {
            kind: FEED_UPDATE_NEW_POST.to_string(),
            post,
            timestamp: Utc::now(),
        });
        self.hub.rooms().broadcast(RoomName::FeedGlobal, &event)
    }

    pub fn is_user_online(&self, user_id: UserId) -> bool {
        self.hub.registry().is_online(user_id)
    }

    pub fn online_user_count(&self) -> usize {
        self.hub.registry().online_count()
    }

    /// Route a collaborator's domain event to the matching emitter.
    pub fn dispatch(&self, event: DomainEvent) -> usize {
        match event {
            DomainEvent::Follow {
                target_user_id,
                actor,
            } => self.send_follow_notification(target_user_id, &actor),
            DomainEvent::Like {
                target_user_id,
                actor,
                post_id,
            } => self.send_like_notification(target_user_id, &actor, post_id),
            DomainEvent::Comment {
                target_user_id,
                actor,
                post_id,
                comment,
            } => self.send_comment_notification(target_user_id, &actor, post_id, &comment),
            DomainEvent::Message {
                target_user_id,
                actor,
                conversation_id,
                content,
            } => self.send_message_notification(target_user_id, &actor, conversation_id, &content),
            DomainEvent::Post { post } => self.broadcast_feed_update(post),
            DomainEvent::Generic {
                target_user_id,
                notification_type,
                title,
                message,
                data,
            } => self.send_notification(target_user_id, notification_type, title, message, data),
        }
    }

    fn to_user(&self, user_id: UserId, event: ServerEvent) -> usize {
        let delivered = self.hub.rooms().broadcast(RoomName::User(user_id), &event);
        tracing::trace!(user_id, event = event.event_name(), delivered, "notification relayed");
        delivered
    }
}

fn is_self_action(target_user_id: UserId, actor: &Actor) -> bool {
    if actor.id == target_user_id {
        tracing::trace!(user_id = target_user_id, "suppressed self notification");
        return true;
    }
    false
}

/// Keep at most `max` characters, marking the cut with "...".
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
