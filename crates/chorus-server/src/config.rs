use std::fs;
use std::time::Duration;

use anyhow::Result;
use chorus_core::AppConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub typing: TypingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Shared with the application backend that issues session tokens.
    pub jwt_secret: String,
    #[serde(default = "default_session_cookie_name")]
    pub session_cookie_name: String,
    /// Accept a bare `auth {userId}` frame without a token.
    #[serde(default = "default_true")]
    pub trust_client_auth: bool,
    /// Bearer token for `POST /api/v1/internal/events`. Unset disables it.
    #[serde(default)]
    pub internal_api_token: Option<String>,
    #[serde(default = "default_session_cache_ttl")]
    pub session_cache_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
            session_cookie_name: default_session_cookie_name(),
            trust_client_auth: true,
            internal_api_token: None,
            session_cache_ttl_seconds: default_session_cache_ttl(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            idle_timeout_seconds: default_idle_timeout(),
            max_connections: default_max_connections(),
            max_connections_per_user: default_max_connections_per_user(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TypingConfig {
    #[serde(default = "default_typing_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_typing_sweep")]
    pub sweep_interval_seconds: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_typing_ttl(),
            sweep_interval_seconds: default_typing_sweep(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_messages_per_minute")]
    pub max_messages_per_minute: u32,
    #[serde(default = "default_max_typing_events_per_minute")]
    pub max_typing_events_per_minute: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_messages_per_minute: default_max_messages_per_minute(),
            max_typing_events_per_minute: default_max_typing_events_per_minute(),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..16u32), 16).unwrap_or('0'))
        .collect()
}

fn default_bind_address() -> String {
    "0.0.0.0:3001".into()
}
fn default_session_cookie_name() -> String {
    "session".into()
}
fn default_true() -> bool {
    true
}
fn default_session_cache_ttl() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    20
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_max_connections() -> usize {
    10_000
}
fn default_max_connections_per_user() -> usize {
    10
}
fn default_outbound_queue_capacity() -> usize {
    256
}
fn default_max_message_size() -> usize {
    64 * 1024
}
fn default_typing_ttl() -> u64 {
    5
}
fn default_typing_sweep() -> u64 {
    5
}
fn default_max_messages_per_minute() -> u32 {
    240
}
fn default_max_typing_events_per_minute() -> u32 {
    120
}

fn looks_like_placeholder_secret(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    ["change_me", "changeme", "replace_me", "secret", "example"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn validate_secret_configuration(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }
    if let Some(token) = &config.auth.internal_api_token {
        if token.trim().len() < 16 {
            anyhow::bail!("Invalid auth.internal_api_token: must be at least 16 characters");
        }
    }
    if config.typing.ttl_seconds == 0 || config.typing.sweep_interval_seconds == 0 {
        anyhow::bail!("Invalid [typing]: ttl_seconds and sweep_interval_seconds must be non-zero");
    }
    if config.gateway.heartbeat_interval_seconds == 0 {
        anyhow::bail!("Invalid gateway.heartbeat_interval_seconds: must be non-zero");
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Chorus Relay Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"

[auth]
# Must match the secret the application backend signs session tokens with.
jwt_secret = "{jwt_secret}"
session_cookie_name = "{cookie}"
# Accept `auth` frames that carry only a user id. Disable once every client
# sends a session token.
trust_client_auth = {trust}
# Enables POST /api/v1/internal/events for the application backend.
# internal_api_token = "a-long-random-token"
session_cache_ttl_seconds = {cache_ttl}

[gateway]
heartbeat_interval_seconds = {heartbeat}
idle_timeout_seconds = {idle}
max_connections = {max_connections}
max_connections_per_user = {max_per_user}
outbound_queue_capacity = {queue}
max_message_size = {max_message_size}

[typing]
ttl_seconds = {typing_ttl}
sweep_interval_seconds = {typing_sweep}

[limits]
max_messages_per_minute = {messages}
max_typing_events_per_minute = {typing_events}
"#,
        bind_address = config.server.bind_address,
        jwt_secret = config.auth.jwt_secret,
        cookie = config.auth.session_cookie_name,
        trust = config.auth.trust_client_auth,
        cache_ttl = config.auth.session_cache_ttl_seconds,
        heartbeat = config.gateway.heartbeat_interval_seconds,
        idle = config.gateway.idle_timeout_seconds,
        max_connections = config.gateway.max_connections,
        max_per_user = config.gateway.max_connections_per_user,
        queue = config.gateway.outbound_queue_capacity,
        max_message_size = config.gateway.max_message_size,
        typing_ttl = config.typing.ttl_seconds,
        typing_sweep = config.typing.sweep_interval_seconds,
        messages = config.limits.max_messages_per_minute,
        typing_events = config.limits.max_typing_events_per_minute,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };
        let _ = harden_secret_file_permissions(path);

        config.apply_env_overrides();
        validate_secret_configuration(&config)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("CHORUS_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("CHORUS_JWT_SECRET") {
            self.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("CHORUS_SESSION_COOKIE_NAME") {
            if !value.trim().is_empty() {
                self.auth.session_cookie_name = value;
            }
        }
        if let Ok(value) = std::env::var("CHORUS_TRUST_CLIENT_AUTH") {
            if let Ok(parsed) = value.parse::<bool>() {
                self.auth.trust_client_auth = parsed;
            }
        }
        if let Ok(value) = std::env::var("CHORUS_INTERNAL_API_TOKEN") {
            let trimmed = value.trim();
            self.auth.internal_api_token = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
        if let Ok(value) = std::env::var("CHORUS_MAX_CONNECTIONS") {
            if let Ok(parsed) = value.parse::<usize>() {
                self.gateway.max_connections = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CHORUS_MAX_CONNECTIONS_PER_USER") {
            if let Ok(parsed) = value.parse::<usize>() {
                self.gateway.max_connections_per_user = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CHORUS_HEARTBEAT_INTERVAL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.gateway.heartbeat_interval_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("CHORUS_IDLE_TIMEOUT_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.gateway.idle_timeout_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("CHORUS_TYPING_TTL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.typing.ttl_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("CHORUS_MAX_MESSAGES_PER_MINUTE") {
            if let Ok(parsed) = value.parse::<u32>() {
                self.limits.max_messages_per_minute = parsed;
            }
        }
    }

    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            jwt_secret: self.auth.jwt_secret.clone(),
            session_cookie_name: self.auth.session_cookie_name.clone(),
            trust_client_auth: self.auth.trust_client_auth,
            internal_api_token: self.auth.internal_api_token.clone(),
            session_cache_ttl: Duration::from_secs(self.auth.session_cache_ttl_seconds),
            typing_ttl: Duration::from_secs(self.typing.ttl_seconds),
            typing_sweep_interval: Duration::from_secs(self.typing.sweep_interval_seconds),
            heartbeat_interval: Duration::from_secs(self.gateway.heartbeat_interval_seconds),
            idle_timeout: Duration::from_secs(self.gateway.idle_timeout_seconds),
            max_connections: self.gateway.max_connections,
            max_connections_per_user: self.gateway.max_connections_per_user,
            outbound_queue_capacity: self.gateway.outbound_queue_capacity,
            max_message_size: self.gateway.max_message_size,
            max_messages_per_minute: self.limits.max_messages_per_minute,
            max_typing_events_per_minute: self.limits.max_typing_events_per_minute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_defaults_when_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("chorus.toml");
        let path = path.to_str().expect("config path utf8");

        let config = Config::load(path).expect("load config");
        assert!(std::path::Path::new(path).exists());
        assert!(config.auth.jwt_secret.len() >= 32);

        // The generated file round-trips to the same secret.
        let reloaded = Config::load(path).expect("reload config");
        assert_eq!(reloaded.auth.jwt_secret, config.auth.jwt_secret);
        assert_eq!(reloaded.typing.ttl_seconds, 5);
    }

    #[test]
    fn partial_file_takes_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("chorus.toml");
        fs::write(
            &path,
            "[auth]\njwt_secret = \"0123456789abcdef0123456789abcdef\"\n\n[typing]\nttl_seconds = 8\n",
        )
        .expect("write config");

        let config = Config::load(path.to_str().expect("utf8")).expect("load config");
        assert_eq!(config.typing.ttl_seconds, 8);
        assert_eq!(config.typing.sweep_interval_seconds, 5);
        assert_eq!(config.gateway.heartbeat_interval_seconds, 20);

        let app = config.app_config();
        assert_eq!(app.typing_ttl, Duration::from_secs(8));
        assert_eq!(app.session_cookie_name, "session");
    }

    #[test]
    fn rejects_weak_or_placeholder_secrets() {
        let mut config = Config::default();
        validate_secret_configuration(&config).expect("generated secret is valid");

        config.auth.jwt_secret = "short".into();
        assert!(validate_secret_configuration(&config).is_err());

        config.auth.jwt_secret = "changeme-changeme-changeme-changeme".into();
        assert!(validate_secret_configuration(&config).is_err());

        config.auth.jwt_secret = generate_random_hex(64);
        config.auth.internal_api_token = Some("tiny".into());
        assert!(validate_secret_configuration(&config).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("chorus-env.toml");
        std::env::set_var("CHORUS_MAX_CONNECTIONS_PER_USER", "3");
        std::env::set_var("CHORUS_INTERNAL_API_TOKEN", "internal-token-0123456789");
        let config = Config::load(path.to_str().expect("utf8")).expect("load config");
        std::env::remove_var("CHORUS_MAX_CONNECTIONS_PER_USER");
        std::env::remove_var("CHORUS_INTERNAL_API_TOKEN");

        assert_eq!(config.gateway.max_connections_per_user, 3);
        assert_eq!(
            config.auth.internal_api_token.as_deref(),
            Some("internal-token-0123456789")
        );
    }
}
