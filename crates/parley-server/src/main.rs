//! # parley-server
//!
//! One-to-one chat engine.
//!
//! This binary provides:
//! - **REST API** (axum) for listing and fetching conversations, message
//!   history, media sends, clearing and blocking
//! - **WebSocket channel** for real-time messages, delivery and read
//!   receipts, typing indicators and online presence
//! - **Media storage** on the local filesystem, with compensation when a
//!   send fails after upload
//! - **Push notifications** through a webhook, or logged when none is set
//! - **Rate limiting** per IP for REST and per user for socket sends

mod api;
mod auth;
mod blocking;
mod config;
mod db;
mod delivery;
mod error;
mod hub;
mod media;
mod presence;
mod push;
mod rate_limit;
mod send;
mod view;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use parley_shared::constants::APP_NAME;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::media::{FsMediaStorage, MediaStorage};
use crate::push::{LogNotifier, PushNotifier, WebhookNotifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug,parley_store=info")),
        )
        .init();

    info!("Starting {} chat server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = Store::open(&config.database_path)?;

    let media: Arc<dyn MediaStorage> = Arc::new(
        FsMediaStorage::new(
            config.media_storage_path.clone(),
            config.media_public_url.clone(),
        )
        .await?,
    );

    let notifier: Arc<dyn PushNotifier> = match &config.push_webhook_url {
        Some(url) => {
            info!(url = %url, "Push notifications via webhook");
            Arc::new(WebhookNotifier::new(url.clone())?)
        }
        None => {
            info!("No push transport configured, notifications are logged only");
            Arc::new(LogNotifier)
        }
    };

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, store, media, notifier);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Evict rate-limit buckets idle for 10 minutes, every 5 minutes.
    const IDLE_BUCKET: Duration = Duration::from_secs(600);
    let http_limiter = app_state.rate_limiter.clone();
    let socket_limiter = app_state.socket_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            http_limiter.purge_idle(IDLE_BUCKET).await;
            socket_limiter.purge_idle(IDLE_BUCKET).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
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
