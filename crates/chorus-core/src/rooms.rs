use std::collections::HashSet;
use std::sync::Arc;

use chorus_models::gateway::ServerEvent;
use chorus_models::room::RoomName;
use chorus_models::{ConnectionId, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::CoreError;

/// A serialized event, shared between every recipient of one broadcast.
pub type OutboundFrame = Arc<str>;
pub type OutboundSender = mpsc::Sender<OutboundFrame>;
pub type OutboundReceiver = mpsc::Receiver<OutboundFrame>;

pub fn outbound_channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(capacity.max(1))
}

#[derive(Clone, Copy)]
enum Skip {
    Nobody,
    Connection(ConnectionId),
    User(UserId),
}

struct ConnectionSlot {
    sender: OutboundSender,
    user_id: Option<UserId>,
}

/// Named publish/subscribe groups over live connections.
///
/// Delivery is a non-blocking `try_send` on each member's bounded outbound
/// queue. A full or closed queue drops that single delivery; a broadcast
/// never waits on a slow socket.
pub struct RoomMultiplexer {
    connections: DashMap<ConnectionId, ConnectionSlot>,
    rooms: DashMap<RoomName, HashSet<ConnectionId>>,
    memberships: DashMap<ConnectionId, HashSet<RoomName>>,
}

impl RoomMultiplexer {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    pub fn attach(&self, connection_id: ConnectionId, sender: OutboundSender) {
        self.connections.insert(
            connection_id,
            ConnectionSlot {
                sender,
                user_id: None,
            },
        );
    }

    /// Drop the outbound handle. Callers run `leave_all` first.
    pub fn detach(&self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);
    }

    /// Record the authenticated owner so presence broadcasts reach it.
    pub fn bind_user(&self, connection_id: ConnectionId, user_id: UserId) -> Result<(), CoreError> {
        let mut slot = self
            .connections
            .get_mut(&connection_id)
            .ok_or(CoreError::NotAttached(connection_id))?;
        slot.user_id = Some(user_id);
        Ok(())
    }

    pub fn is_attached(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn join(&self, connection_id: ConnectionId, room: RoomName) -> Result<(), CoreError> {
        if !self.is_attached(connection_id) {
            return Err(CoreError::NotAttached(connection_id));
        }
        self.rooms.entry(room).or_default().insert(connection_id);
        self.memberships
            .entry(connection_id)
            .or_default()
            .insert(room);
        tracing::trace!(connection_id = %connection_id, room = %room, "joined room");
        Ok(())
    }

    pub fn leave(&self, connection_id: ConnectionId, room: RoomName) {
        self.remove_member(room, connection_id);
        if let Entry::Occupied(mut entry) = self.memberships.entry(connection_id) {
            entry.get_mut().remove(&room);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Remove the connection from every room it joined.
    pub fn leave_all(&self, connection_id: ConnectionId) -> Vec<RoomName> {
        let Some((_, rooms)) = self.memberships.remove(&connection_id) else {
            return Vec::new();
        };
        for room in &rooms {
            self.remove_member(*room, connection_id);
        }
        rooms.into_iter().collect()
    }

    fn remove_member(&self, room: RoomName, connection_id: ConnectionId) {
        if let Entry::Occupied(mut entry) = self.rooms.entry(room) {
            entry.get_mut().remove(&connection_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Deliver to every connection in `room` at call time.
    pub fn broadcast(&self, room: RoomName, event: &ServerEvent) -> usize {
        self.fan_out(room, event, Skip::Nobody)
    }

    /// Same as [`broadcast`](Self::broadcast), minus one sender.
    pub fn broadcast_except(
        &self,
        room: RoomName,
        event: &ServerEvent,
        excluded: ConnectionId,
    ) -> usize {
        self.fan_out(room, event, Skip::Connection(excluded))
    }

    /// Same as [`broadcast`](Self::broadcast), minus every connection bound
    /// to `user_id`.
    pub fn broadcast_except_user(
        &self,
        room: RoomName,
        event: &ServerEvent,
        user_id: UserId,
    ) -> usize {
        self.fan_out(room, event, Skip::User(user_id))
    }

    fn fan_out(&self, room: RoomName, event: &ServerEvent, skip: Skip) -> usize {
        let targets: Vec<ConnectionId> = match self.rooms.get(&room) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|id| !self.is_skipped(*id, skip))
                .collect(),
            None => return 0,
        };
        if targets.is_empty() {
            return 0;
        }
        let Some(frame) = encode(event) else {
            return 0;
        };
        let delivered = targets
            .into_iter()
            .filter(|id| self.deliver(*id, &frame))
            .count();
        tracing::trace!(room = %room, event = event.event_name(), delivered, "room broadcast");
        delivered
    }

    fn is_skipped(&self, connection_id: ConnectionId, skip: Skip) -> bool {
        match skip {
            Skip::Nobody => false,
            Skip::Connection(excluded) => connection_id == excluded,
            Skip::User(user_id) => self
                .connections
                .get(&connection_id)
                .is_some_and(|slot| slot.user_id == Some(user_id)),
        }
    }

    /// Direct delivery to one connection.
    pub fn send_to(&self, connection_id: ConnectionId, event: &ServerEvent) -> bool {
        match encode(event) {
            Some(frame) => self.deliver(connection_id, &frame),
            None => false,
        }
    }

    /// Deliver to every authenticated connection.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let senders: Vec<(ConnectionId, OutboundSender)> = self
            .connections
            .iter()
            .filter(|slot| slot.user_id.is_some())
            .map(|slot| (*slot.key(), slot.sender.clone()))
            .collect();
        if senders.is_empty() {
            return 0;
        }
        let Some(frame) = encode(event) else {
            return 0;
        };
        senders
            .into_iter()
            .filter(|(id, sender)| try_deliver(*id, sender, &frame))
            .count()
    }

    fn deliver(&self, connection_id: ConnectionId, frame: &OutboundFrame) -> bool {
        let Some(sender) = self
            .connections
            .get(&connection_id)
            .map(|slot| slot.sender.clone())
        else {
            return false;
        };
        try_deliver(connection_id, &sender, frame)
    }

    pub fn members(&self, room: RoomName) -> Vec<ConnectionId> {
        self.rooms
            .get(&room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<RoomName> {
        self.memberships
            .get(&connection_id)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection_id: ConnectionId, room: RoomName) -> bool {
        self.rooms
            .get(&room)
            .is_some_and(|m| m.contains(&connection_id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for RoomMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(event: &ServerEvent) -> Option<OutboundFrame> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            tracing::error!(event = event.event_name(), "failed to encode event: {e}");
            None
        }
    }
}

fn try_deliver(connection_id: ConnectionId, sender: &OutboundSender, frame: &OutboundFrame) -> bool {
    match sender.try_send(frame.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::debug!(connection_id = %connection_id, "outbound queue full, dropping event");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
