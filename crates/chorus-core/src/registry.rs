use std::collections::HashSet;

use chorus_models::{ConnectionId, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::CoreError;

/// Result of a register/unregister call for the affected user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    /// First live connection for the user.
    Online,
    /// Last live connection for the user went away.
    Offline,
    Unchanged,
}

/// User -> set of live connections (one per device).
///
/// A user is online iff its set is non-empty; empty sets are removed under
/// the same shard lock that emptied them, so each online/offline cycle emits
/// exactly one transition of each kind.
///
/// The `*_with` variants run their callback on a transition while that shard
/// lock is still held. Announcements made from the callback therefore come
/// out in the same order as the transitions for a given user. The callback
/// must not touch the registry.
pub struct ConnectionRegistry {
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
        }
    }

    pub fn register(&self, user_id: UserId, connection_id: ConnectionId) -> PresenceTransition {
        match self.try_register(user_id, connection_id, usize::MAX) {
            Ok(transition) => transition,
            Err(_) => PresenceTransition::Unchanged,
        }
    }

    /// Register unless the user already holds `limit` connections.
    pub fn try_register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        limit: usize,
    ) -> Result<PresenceTransition, CoreError> {
        self.try_register_with(user_id, connection_id, limit, || {})
    }

    pub fn try_register_with(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        limit: usize,
        on_online: impl FnOnce(),
    ) -> Result<PresenceTransition, CoreError> {
        let mut connections = self.users.entry(user_id).or_default();
        if connections.contains(&connection_id) {
            return Ok(PresenceTransition::Unchanged);
        }
        if connections.len() >= limit {
            // An entry we just created must not linger empty.
            let created = connections.is_empty();
            drop(connections);
            if created {
                self.users.remove_if(&user_id, |_, set| set.is_empty());
            }
            return Err(CoreError::ConnectionLimit { user_id, limit });
        }
        let first = connections.is_empty();
        connections.insert(connection_id);
        if first {
            on_online();
            Ok(PresenceTransition::Online)
        } else {
            Ok(PresenceTransition::Unchanged)
        }
    }

    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> PresenceTransition {
        self.unregister_with(user_id, connection_id, || {})
    }

    pub fn unregister_with(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        on_offline: impl FnOnce(),
    ) -> PresenceTransition {
        match self.users.entry(user_id) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().remove(&connection_id) {
                    return PresenceTransition::Unchanged;
                }
                if entry.get().is_empty() {
                    on_offline();
                    entry.remove();
                    PresenceTransition::Offline
                } else {
                    PresenceTransition::Unchanged
                }
            }
            Entry::Vacant(_) => PresenceTransition::Unchanged,
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users
            .get(&user_id)
            .is_some_and(|connections| !connections.is_empty())
    }

    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.users.get(&user_id).map_or(0, |c| c.len())
    }

    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.users
            .get(&user_id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of online user ids, sorted.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.iter().map(|r| *r.key()).collect();
        users.sort_unstable();
        users
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
