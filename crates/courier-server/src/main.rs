//! # courier-server
//!
//! Real-time core of the Courier messenger.
//!
//! This binary provides:
//! - **WebSocket endpoint** for live connections, one receive loop and one
//!   writer task per connection
//! - **Dispatcher** validating, persisting and fanning out direct and group
//!   messages
//! - **Call signaling** between two online users, with expiry of calls that
//!   never become active
//! - **REST API** (axum) for health, presence, history and per-user hiding

mod api;
mod calls;
mod collaborators;
mod config;
mod dispatcher;
mod error;
mod lifecycle;
mod presence;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_store::Database;

use crate::api::AppState;
use crate::calls::CallCoordinator;
use crate::collaborators::{CachedIdentity, HttpIdentity, HttpMedia, IdentityService};
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::lifecycle::MessageLifecycle;
use crate::presence::PresenceRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting Courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    let db = Arc::new(Mutex::new(db));

    let http_identity: Arc<dyn IdentityService> =
        Arc::new(HttpIdentity::new(&config.identity_url, config.upstream_timeout)?);
    let cached_identity = Arc::new(CachedIdentity::new(http_identity, config.profile_cache_ttl));
    let identity: Arc<dyn IdentityService> = cached_identity.clone();
    let media = Arc::new(HttpMedia::new(&config.media_url, config.upstream_timeout)?);

    let lifecycle = MessageLifecycle::new(db, identity.clone(), config.withdraw_window);
    let dispatcher = Dispatcher::new(
        PresenceRegistry::new(),
        CallCoordinator::new(config.call_ring_timeout),
        lifecycle,
        identity.clone(),
        media,
    );

    let app_state = AppState {
        dispatcher: dispatcher.clone(),
        identity,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Expire ringing and negotiating calls (every 5 seconds)
    let calls_dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            calls_dispatcher.expire_calls(Utc::now()).await;
        }
    });

    // Profile cache cleanup (every 10 minutes)
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            cached_identity.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP / WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
