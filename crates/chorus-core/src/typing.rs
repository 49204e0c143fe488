use std::sync::Arc;
use std::time::Duration;

use chorus_models::{ConversationId, UserId};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub updated_at: Instant,
}

/// Conversation -> last typer, with a fixed TTL.
///
/// Only one typer per conversation is kept; a newer `start` from anyone
/// replaces the entry. Stale entries are never reported by [`current`],
/// and the sweeper removes them physically without notifying clients.
///
/// [`current`]: TypingStore::current
pub struct TypingStore {
    entries: DashMap<ConversationId, TypingEntry>,
    ttl: Duration,
}

impl TypingStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn start(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        display_name: Option<String>,
    ) -> TypingEntry {
        let entry = TypingEntry {
            user_id,
            display_name,
            updated_at: Instant::now(),
        };
        self.entries.insert(conversation_id, entry.clone());
        entry
    }

    /// Remove the entry if `user_id` owns it.
    pub fn stop(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.entries
            .remove_if(&conversation_id, |_, entry| entry.user_id == user_id)
            .is_some()
    }

    pub fn current(&self, conversation_id: ConversationId) -> Option<TypingEntry> {
        self.entries
            .get(&conversation_id)
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| entry.clone())
    }

    pub fn is_typing(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.current(conversation_id)
            .is_some_and(|entry| entry.user_id == user_id)
    }

    /// Drop every entry owned by `user_id`, returning the conversations touched.
    pub fn clear_user(&self, user_id: UserId) -> Vec<ConversationId> {
        let owned: Vec<ConversationId> = self
            .entries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| *entry.key())
            .collect();
        owned
            .into_iter()
            .filter(|conversation_id| self.stop(*conversation_id, user_id))
            .collect()
    }

    /// Physically remove stale entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.updated_at.elapsed() < self.ttl;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_fresh(&self, entry: &TypingEntry) -> bool {
        entry.updated_at.elapsed() < self.ttl
    }
}

/// Run [`TypingStore::sweep`] every `interval` until `shutdown` fires.
pub fn spawn_sweeper(
    store: Arc<TypingStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // skip immediate first tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = store.sweep();
                    if removed > 0 {
                        tracing::trace!(removed, "typing sweep: expired stale entries");
                    }
                }
            }
        }
        tracing::debug!("typing sweeper stopped");
    })
}
