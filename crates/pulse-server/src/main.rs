//! # pulse-server
//!
//! Real-time messaging and call-signaling backend.
//!
//! This binary provides:
//! - **WebSocket endpoint** (`/ws`) carrying presence, conversation and
//!   message events, and call signaling, one connection per user
//! - **Membership cache** with a local tier and a shared tier (Redis, or
//!   in-process on a single node) kept coherent by invalidation broadcasts
//! - **Durable delivery accounting** per (message, recipient) in SQLite
//! - **Push fallback** for recipients without a live socket
//! - **REST surface** (axum) for health checks and instance info, behind a
//!   per-IP rate limiter

mod api;
mod auth;
mod broadcast;
mod calls;
mod config;
mod error;
mod handler;
mod ledger;
mod membership;
mod notifier;
mod rate_limit;
mod redis_cache;
mod registry;
mod store;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::handler::{spawn_call_event_relay, Hub};
use crate::membership::{InMemorySharedCache, MembershipCache, SharedCache};
use crate::notifier::{LogNotifier, Notifier, WebhookNotifier};
use crate::rate_limit::RateLimiter;
use crate::redis_cache::RedisSharedCache;
use crate::store::{MembershipSource, SqliteStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pulse_server=debug")),
        )
        .init();

    info!("Starting pulse server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        ring_timeout = ?config.call_ring_timeout,
        stale_after = ?config.stale_after,
        push_webhook = config.push_webhook_url.is_some(),
        internal_api = config.internal_token.is_some(),
        redis = config.redis_url.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Durable store (runs migrations on open)
    let store = SqliteStore::open(&config.database_path)?;
    info!(path = %config.database_path.display(), "Database ready");

    // Membership cache: local tier in front of the shared tier
    let shared: Arc<dyn SharedCache> = match &config.redis_url {
        Some(url) => Arc::new(RedisSharedCache::connect(url).await?),
        None => {
            info!("No REDIS_URL, shared membership tier is in-process");
            Arc::new(InMemorySharedCache::new())
        }
    };
    let membership = Arc::new(MembershipCache::new(
        Arc::new(store.clone()) as Arc<dyn MembershipSource>,
        shared,
        config.membership_ttl_min,
        config.membership_ttl_max,
    ));
    let _invalidations = membership.spawn_invalidation_listener();

    // Push fallback
    let notifier: Arc<dyn Notifier> = match &config.push_webhook_url {
        Some(url) => {
            info!(url = %url, "Push notifications go to webhook");
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => Arc::new(LogNotifier),
    };

    let (hub, call_events) = Hub::new(
        Arc::new(store) as Arc<dyn Store>,
        membership,
        notifier,
        config.call_ring_timeout,
        config.outbound_queue_capacity,
    );

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    let app_state = AppState {
        hub: Arc::clone(&hub),
        verifier: TokenVerifier::new(config.auth_pubkey),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Ring timeouts -> call:end frames and missed-call pushes
    spawn_call_event_relay(Arc::clone(&hub), call_events);

    // Stale connection sweep
    let sweeper = Arc::clone(&hub);
    let stale_after = config.stale_after;
    tokio::spawn(async move {
        let period = (stale_after / 3).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let swept = sweeper.sweep_stale(stale_after).await;
            if swept > 0 {
                info!(swept, "Swept stale connections");
            }
        }
    });

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(Duration::from_secs(600)).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(
                online = hub.registry.len(),
                active_calls = hub.calls.active_count(),
                "Received Ctrl+C, shutting down"
            );
        }
    }

    Ok(())
}
