use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chorus_models::UserId;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Which per-user bucket an inbound message is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateClass {
    Typing,
    Other,
}

/// User-level limiters shared by every connection of the same user, so
/// opening more tabs does not buy more budget.
pub struct UserRateLimits {
    /// Every inbound message except `auth`.
    messages: DefaultKeyedRateLimiter<UserId>,
    /// `typing:start` / `typing:stop`.
    typing: DefaultKeyedRateLimiter<UserId>,
}

impl UserRateLimits {
    /// A zero limit is treated as one per minute.
    pub fn new(max_messages_per_minute: u32, max_typing_events_per_minute: u32) -> Self {
        Self {
            messages: RateLimiter::keyed(per_minute(max_messages_per_minute)),
            typing: RateLimiter::keyed(per_minute(max_typing_events_per_minute)),
        }
    }

    /// Returns `Ok(())` if allowed, or `Err(retry_after_ms)` if rate limited.
    pub fn check(&self, user_id: UserId, class: RateClass) -> Result<(), u64> {
        let now = DefaultClock::default().now();

        if let Err(not_until) = self.messages.check_key(&user_id) {
            let wait = not_until.wait_time_from(now);
            return Err(wait.as_millis().max(1) as u64);
        }

        let not_until = match class {
            RateClass::Typing => self.typing.check_key(&user_id).err(),
            RateClass::Other => None,
        };
        match not_until {
            Some(not_until) => Err(not_until.wait_time_from(now).as_millis().max(1) as u64),
            None => Ok(()),
        }
    }

    fn prune(&self) {
        self.messages.retain_recent();
        self.typing.retain_recent();
        self.messages.shrink_to_fit();
        self.typing.shrink_to_fit();
    }
}

fn per_minute(limit: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(limit).unwrap_or(NonZeroU32::MIN))
}

/// Periodic cleanup of stale limiter keys so idle users do not accumulate.
pub fn spawn_cleanup(limits: Arc<UserRateLimits>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.tick().await; // skip immediate first tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    limits.prune();
                    tracing::trace!("rate limiter cleanup: pruned stale entries");
                }
            }
        }
    })
}
