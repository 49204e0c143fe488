pub mod auth;
pub mod error;
pub mod hub;
pub mod notify;
pub mod rate_limit;
pub mod registry;
pub mod rooms;
pub mod typing;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use auth::SessionVerifier;
use hub::RelayHub;
use notify::Notifier;
use rate_limit::UserRateLimits;
use tokio_util::sync::CancellationToken;
use typing::TypingStore;

pub use error::CoreError;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    /// Name of the cookie carrying the session token on the upgrade request.
    pub session_cookie_name: String,
    /// Accept `auth {userId}` without a token.
    pub trust_client_auth: bool,
    /// Bearer token for the internal event ingress. `None` disables it.
    pub internal_api_token: Option<String>,
    pub session_cache_ttl: Duration,
    pub typing_ttl: Duration,
    pub typing_sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub max_connections_per_user: usize,
    /// Bounded per-connection outbound queue; overflow drops deliveries.
    pub outbound_queue_capacity: usize,
    pub max_message_size: usize,
    pub max_messages_per_minute: u32,
    pub max_typing_events_per_minute: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            session_cookie_name: "session".to_string(),
            trust_client_auth: true,
            internal_api_token: None,
            session_cache_ttl: Duration::from_secs(60),
            typing_ttl: typing::DEFAULT_TYPING_TTL,
            typing_sweep_interval: typing::DEFAULT_SWEEP_INTERVAL,
            heartbeat_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            max_connections: 10_000,
            max_connections_per_user: 10,
            outbound_queue_capacity: 256,
            max_message_size: 64 * 1024,
            max_messages_per_minute: 240,
            max_typing_events_per_minute: 120,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub hub: Arc<RelayHub>,
    pub notifier: Notifier,
    pub verifier: Arc<dyn SessionVerifier>,
    pub rate_limits: Arc<UserRateLimits>,
    /// Live gateway sockets, bounded by `max_connections`.
    pub active_connections: Arc<AtomicUsize>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, verifier: Arc<dyn SessionVerifier>) -> Self {
        let typing = Arc::new(TypingStore::new(config.typing_ttl));
        let hub = Arc::new(RelayHub::new(typing, config.max_connections_per_user));
        let rate_limits = Arc::new(UserRateLimits::new(
            config.max_messages_per_minute,
            config.max_typing_events_per_minute,
        ));
        Self {
            notifier: Notifier::new(hub.clone()),
            hub,
            verifier,
            rate_limits,
            config: Arc::new(config),
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the typing sweeper and limiter cleanup. Both stop on `shutdown`.
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            typing::spawn_sweeper(
                self.hub.typing().clone(),
                self.config.typing_sweep_interval,
                self.shutdown.clone(),
            ),
            rate_limit::spawn_cleanup(self.rate_limits.clone(), self.shutdown.clone()),
        ]
    }
}
