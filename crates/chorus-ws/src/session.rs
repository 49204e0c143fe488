use chorus_models::gateway::ClientMessage;
use chorus_models::{ConnectionId, UserId};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Unauthenticated,
    Authenticated,
    Active,
    Closing,
    Closed,
}

/// Per-socket lifecycle. Owned by the connection task; the hub only ever
/// sees the id.
pub struct Connection {
    pub id: ConnectionId,
    pub created_at: Instant,
    user_id: Option<UserId>,
    state: ConnectionState,
    last_activity: Instant,
}

impl Connection {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            created_at: now,
            user_id: None,
            state: ConnectionState::Connecting,
            last_activity: now,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn opened(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Unauthenticated;
        }
    }

    /// Bind the first identity. Later identities are refused.
    pub fn authenticate(&mut self, user_id: UserId) -> bool {
        if self.state != ConnectionState::Unauthenticated {
            return false;
        }
        self.user_id = Some(user_id);
        self.state = ConnectionState::Authenticated;
        true
    }

    /// Registration failed after authentication; fall back so the socket can
    /// be closed cleanly without a registry entry.
    pub fn reject(&mut self) {
        self.user_id = None;
        self.state = ConnectionState::Closing;
    }

    pub fn activate(&mut self) {
        if self.state == ConnectionState::Authenticated {
            self.state = ConnectionState::Active;
        }
    }

    pub fn begin_close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closing;
        }
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Whether `message` may be processed in the current state. Before
    /// authentication only `auth` gets through.
    pub fn accepts(&self, message: &ClientMessage) -> bool {
        match self.state {
            ConnectionState::Unauthenticated => matches!(message, ClientMessage::Auth { .. }),
            ConnectionState::Active => true,
            _ => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(user_id: UserId) -> ClientMessage {
        ClientMessage::Auth {
            user_id,
            token: None,
        }
    }

    #[test]
    fn only_auth_passes_before_authentication() {
        let mut conn = Connection::new();
        assert!(!conn.accepts(&auth(1)));
        conn.opened();
        assert!(conn.accepts(&auth(1)));
        assert!(!conn.accepts(&ClientMessage::FeedSubscribe));
    }

    #[test]
    fn first_identity_wins() {
        let mut conn = Connection::new();
        conn.opened();
        assert!(conn.authenticate(7));
        assert!(!conn.authenticate(8));
        conn.activate();
        assert!(!conn.authenticate(9));
        assert_eq!(conn.user_id(), Some(7));
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(conn.accepts(&ClientMessage::FeedSubscribe));
    }

    #[test]
    fn closing_connection_accepts_nothing() {
        let mut conn = Connection::new();
        conn.opened();
        conn.authenticate(1);
        conn.activate();
        conn.begin_close();
        assert!(!conn.accepts(&ClientMessage::NotificationReadAll));
        conn.close();
        conn.begin_close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn rejected_connection_drops_identity() {
        let mut conn = Connection::new();
        conn.opened();
        conn.authenticate(3);
        conn.reject();
        assert_eq!(conn.user_id(), None);
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_clock() {
        let mut conn = Connection::new();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(conn.idle_for() >= Duration::from_secs(10));
        conn.touch();
        assert!(conn.idle_for() < Duration::from_secs(1));
    }
}
