//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{
    DEFAULT_CALL_RING_TIMEOUT_SECS, DEFAULT_CONNECTION_BUFFER, DEFAULT_HTTP_PORT,
    DEFAULT_PROFILE_CACHE_TTL_SECS, DEFAULT_WITHDRAW_WINDOW_SECS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP / WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./courier.db`
    pub database_path: PathBuf,

    /// Base URL of the identity service (profiles, friendships).
    /// Env: `IDENTITY_URL`
    pub identity_url: String,

    /// Base URL of the media service (file metadata).
    /// Env: `MEDIA_URL`
    pub media_url: String,

    /// How long plain senders may withdraw a message.
    /// Env: `WITHDRAW_WINDOW_SECS`
    pub withdraw_window: Duration,

    /// Call sessions that never become active expire after this.
    /// Env: `CALL_RING_TIMEOUT_SECS`
    pub call_ring_timeout: Duration,

    /// Lifetime of cached identity profiles.
    /// Env: `PROFILE_CACHE_TTL_SECS`
    pub profile_cache_ttl: Duration,

    /// Outbound frames buffered per connection.
    /// Env: `CONNECTION_BUFFER`
    pub connection_buffer: usize,

    /// Request timeout for identity and media calls.
    /// Env: `UPSTREAM_TIMEOUT_SECS`
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./courier.db"),
            identity_url: "http://127.0.0.1:20021".to_string(),
            media_url: "http://127.0.0.1:20025".to_string(),
            withdraw_window: Duration::from_secs(DEFAULT_WITHDRAW_WINDOW_SECS),
            call_ring_timeout: Duration::from_secs(DEFAULT_CALL_RING_TIMEOUT_SECS),
            profile_cache_ttl: Duration::from_secs(DEFAULT_PROFILE_CACHE_TTL_SECS),
            connection_buffer: DEFAULT_CONNECTION_BUFFER,
            upstream_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("IDENTITY_URL") {
            config.identity_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("MEDIA_URL") {
            config.media_url = url.trim_end_matches('/').to_string();
        }

        parse_secs_into(&lookup, "WITHDRAW_WINDOW_SECS", &mut config.withdraw_window);
        parse_secs_into(&lookup, "CALL_RING_TIMEOUT_SECS", &mut config.call_ring_timeout);
        parse_secs_into(&lookup, "PROFILE_CACHE_TTL_SECS", &mut config.profile_cache_ttl);
        parse_secs_into(&lookup, "UPSTREAM_TIMEOUT_SECS", &mut config.upstream_timeout);

        parse_into(&lookup, "CONNECTION_BUFFER", &mut config.connection_buffer);
        if config.connection_buffer == 0 {
            tracing::warn!("CONNECTION_BUFFER must be positive, using default");
            config.connection_buffer = DEFAULT_CONNECTION_BUFFER;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(value = %raw, "Invalid {name}, using default"),
    }
}

fn parse_secs_into(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut Duration,
) {
    let mut secs = slot.as_secs();
    parse_into(lookup, name, &mut secs);
    *slot = Duration::from_secs(secs);
}
