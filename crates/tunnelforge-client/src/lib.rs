pub mod compress;
pub mod config;
pub mod control;
pub mod handler;
pub mod state;
pub mod ws_bridge;

use tokio_util::sync::CancellationToken;
use tracing::info;

use tunnelforge_core::events::{channel, EventReceiver, EventSender};

use crate::config::ClientConfig;
use crate::control::ReconnectOptions;

/// Initialize tracing/logging for the client. Call once before `run()`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelforge_client=info".into()),
        )
        .init();
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

/// Resolve the subdomain to request for this connection: an explicit
/// override wins, otherwise fall back to whatever was last remembered for
/// this local port (§4.7 subdomain stickiness, client side).
pub fn resolve_subdomain(config: &ClientConfig, local_port: u16, explicit: Option<String>) -> Option<String> {
    explicit.or_else(|| config.port_subdomains.get(&local_port).cloned())
}

/// Run the client until `shutdown` is cancelled. Returns an error only if
/// the very first connection attempt fails (§5 exit codes); after that,
/// `control::run` reconnects forever.
pub async fn run(
    server_url: String,
    api_key: String,
    local_port: u16,
    subdomain: Option<String>,
    config_path: std::path::PathBuf,
    shutdown: CancellationToken,
) -> color_eyre::Result<()> {
    let (events, _receiver): (EventSender, EventReceiver) = channel();

    let config = ClientConfig::load(&config_path).await.unwrap_or_default();
    let subdomain = resolve_subdomain(&config, local_port, subdomain);

    info!(%server_url, local_port, "connecting to tunnel server");

    control::run(
        ReconnectOptions { server_url, api_key, local_port, subdomain, config_path },
        events,
        shutdown,
    )
    .await
}
