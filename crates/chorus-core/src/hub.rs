use std::sync::Arc;

use chorus_models::gateway::{PresencePayload, ServerEvent, TypingPayload};
use chorus_models::room::RoomName;
use chorus_models::{ConnectionId, ConversationId, UserId};

use crate::error::CoreError;
use crate::registry::{ConnectionRegistry, PresenceTransition};
use crate::rooms::{OutboundSender, RoomMultiplexer};
use crate::typing::TypingStore;

/// Wires the registry, the room multiplexer and the typing store together.
///
/// Every presence or typing side effect that needs more than one of those
/// components goes through here, so the lifecycle handler and the notifier
/// never have to sequence them by hand.
pub struct RelayHub {
    registry: ConnectionRegistry,
    rooms: RoomMultiplexer,
    typing: Arc<TypingStore>,
    max_connections_per_user: usize,
}

impl RelayHub {
    pub fn new(typing: Arc<TypingStore>, max_connections_per_user: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            rooms: RoomMultiplexer::new(),
            typing,
            max_connections_per_user,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomMultiplexer {
        &self.rooms
    }

    pub fn typing(&self) -> &Arc<TypingStore> {
        &self.typing
    }

    /// Make a freshly upgraded socket addressable. Nothing is registered
    /// for presence until [`connect_user`](Self::connect_user).
    pub fn attach(&self, connection_id: ConnectionId, sender: OutboundSender) {
        self.rooms.attach(connection_id, sender);
    }

    /// Bind an authenticated identity to an attached connection.
    pub fn connect_user(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> Result<PresenceTransition, CoreError> {
        if !self.rooms.is_attached(connection_id) {
            return Err(CoreError::NotAttached(connection_id));
        }
        let transition = self.registry.try_register_with(
            user_id,
            connection_id,
            self.max_connections_per_user,
            || {
                let delivered = self
                    .rooms
                    .broadcast_all(&ServerEvent::UserOnline(PresencePayload { user_id }));
                tracing::debug!(user_id, delivered, "user online");
            },
        )?;
        if let Err(e) = self
            .rooms
            .bind_user(connection_id, user_id)
            .and_then(|()| self.rooms.join(connection_id, RoomName::User(user_id)))
        {
            // Detached concurrently; undo the registration.
            self.unregister_user(connection_id, user_id);
            return Err(e);
        }
        Ok(transition)
    }

    /// Tear down everything a connection owns. Safe to call more than once.
    pub fn disconnect(
        &self,
        connection_id: ConnectionId,
        user_id: Option<UserId>,
    ) -> PresenceTransition {
        self.rooms.leave_all(connection_id);
        self.rooms.detach(connection_id);
        match user_id {
            Some(user_id) => self.unregister_user(connection_id, user_id),
            None => PresenceTransition::Unchanged,
        }
    }

    // Announced under the registry's per-user lock.
    fn unregister_user(&self, connection_id: ConnectionId, user_id: UserId) -> PresenceTransition {
        self.registry.unregister_with(user_id, connection_id, || {
            for conversation_id in self.typing.clear_user(user_id) {
                self.rooms.broadcast(
                    RoomName::Conversation(conversation_id),
                    &ServerEvent::TypingStop(TypingPayload {
                        conversation_id,
                        user_id,
                        username: None,
                    }),
                );
            }
            let delivered = self
                .rooms
                .broadcast_all(&ServerEvent::UserOffline(PresencePayload { user_id }));
            tracing::debug!(user_id, delivered, "user offline");
        })
    }

    /// Join a conversation room. A fresh typing entry from someone else is
    /// replayed to the joiner so it does not miss an ongoing indicator.
    pub fn join_conversation(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<(), CoreError> {
        self.rooms
            .join(connection_id, RoomName::Conversation(conversation_id))?;
        if let Some(entry) = self.typing.current(conversation_id) {
            if entry.user_id != user_id {
                self.rooms.send_to(
                    connection_id,
                    &ServerEvent::TypingStart(TypingPayload {
                        conversation_id,
                        user_id: entry.user_id,
                        username: entry.display_name,
                    }),
                );
            }
        }
        Ok(())
    }

    pub fn leave_conversation(&self, connection_id: ConnectionId, conversation_id: ConversationId) {
        self.rooms
            .leave(connection_id, RoomName::Conversation(conversation_id));
    }

    pub fn subscribe_feed(&self, connection_id: ConnectionId) -> Result<(), CoreError> {
        self.rooms.join(connection_id, RoomName::FeedGlobal)
    }

    pub fn unsubscribe_feed(&self, connection_id: ConnectionId) {
        self.rooms.leave(connection_id, RoomName::FeedGlobal);
    }

    /// Record the typer and tell everyone else in the conversation. None of
    /// the typer's own devices get the indicator.
    pub fn start_typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        username: Option<String>,
    ) -> usize {
        self.typing.start(conversation_id, user_id, username.clone());
        self.rooms.broadcast_except_user(
            RoomName::Conversation(conversation_id),
            &ServerEvent::TypingStart(TypingPayload {
                conversation_id,
                user_id,
                username,
            }),
            user_id,
        )
    }

    pub fn stop_typing(&self, conversation_id: ConversationId, user_id: UserId) -> usize {
        self.typing.stop(conversation_id, user_id);
        self.rooms.broadcast_except_user(
            RoomName::Conversation(conversation_id),
            &ServerEvent::TypingStop(TypingPayload {
                conversation_id,
                user_id,
                username: None,
            }),
            user_id,
        )
    }
}
