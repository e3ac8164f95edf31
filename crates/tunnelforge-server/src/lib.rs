pub mod auth;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod registry;
pub mod state;
pub mod tunnel;
pub mod ws_passthrough;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tunnelforge_core::events::{channel, EventReceiver};
use tunnelforge_core::subdomain::SubdomainCache;

use crate::config::ServerConfig;
use crate::state::AppState;

/// Initialize tracing/logging for the server. Call once before `serve()`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelforge_server=info,tower_http=info".into()),
        )
        .init();
}

/// Build the axum router: health/verify/status/connect under `/__tunnel__/`,
/// everything else falls through to the subdomain proxy (§4.4).
pub fn build_router(state: Arc<AppState>) -> Router {
    let control = Router::new()
        .route("/__tunnel__/health", get(dispatcher::health))
        .route("/__tunnel__/verify", get(auth::verify))
        .route("/__tunnel__/status", get(dispatcher::status))
        .route("/__tunnel__/connect", get(dispatcher::connect));

    Router::new()
        .merge(control)
        .fallback(dispatcher::proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawn a task that listens for Ctrl+C and SIGTERM, then cancels the token.
pub fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received Ctrl+C, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received Ctrl+C, shutting down");
        }
        shutdown.cancel();
    });
}

/// Grace period (§5 timers) given to in-flight tunnel requests to finish
/// before the listener is torn down.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Run the tunnel server until `shutdown` is cancelled. On shutdown, waits up
/// to `SHUTDOWN_GRACE_PERIOD` for every tunnel's pending requests to drain,
/// then lets axum's own graceful shutdown close the listener and
/// force-flushes the subdomain cache before returning.
pub async fn serve(config: ServerConfig, shutdown: CancellationToken) -> color_eyre::Result<()> {
    let cache = SubdomainCache::load(&config.cache_path).await?;
    let (events, _receiver): (_, EventReceiver) = channel();

    let addr = format!("0.0.0.0:{}", config.tunnel_port);
    let state = Arc::new(AppState::new(config, cache, events));
    let router = build_router(state.clone());

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "tunnel server listening");

    let registry = state.registry.clone();
    let shutdown_signal = async move {
        shutdown.cancelled().await;
        info!("shutdown requested, draining pending requests");
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE_PERIOD;
        while registry.has_pending_requests() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if registry.has_pending_requests() {
            warn!("shutdown grace period elapsed with requests still pending");
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("flushing subdomain cache before exit");
    state.cache.flush().await?;
    info!("tunnel server stopped");

    Ok(())
}
