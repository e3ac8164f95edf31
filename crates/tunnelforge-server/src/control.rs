//! The control connection actor (§4.1, §4.2, §5): one read loop and one
//! writer task per tunnel, talking JSON text frames and raw binary frames
//! over the axum `WebSocket` obtained on `/__tunnel__/connect`.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use tunnelforge_core::protocol::{decode_client_message, ServerMessage};

use crate::registry::TunnelRegistry;
use crate::tunnel::{OutboundCommand, Tunnel};

/// WebSocket protocol-level ping interval (§4.2).
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// No pong/traffic within this window closes the tunnel (§4.2).
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Drive one tunnel's control connection until it closes, then unregister it.
/// Spawned as its own task by the dispatcher immediately after a successful
/// authenticated upgrade.
pub async fn run(socket: WebSocket, registry: TunnelRegistry, subdomain: String, api_key: String) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundCommand>();

    let tunnel = Tunnel::new(subdomain.clone(), api_key, outbound_tx);
    registry.register(tunnel.clone());
    tunnel.send(ServerMessage::Connected { subdomain: subdomain.clone() });

    let writer_subdomain = subdomain.clone();
    let writer = tokio::spawn(async move {
        while let Some(command) = outbound_rx.recv().await {
            match command {
                OutboundCommand::Message(message) => {
                    if sink.send(Message::Text(message.encode().into())).await.is_err() {
                        break;
                    }
                }
                OutboundCommand::WsBinary { ws_id, data } => {
                    let header = ServerMessage::WsMessageBinary { ws_id }.encode();
                    if sink.send(Message::Text(header.into())).await.is_err() {
                        break;
                    }
                    if sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                OutboundCommand::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        info!(subdomain = %writer_subdomain, "control connection writer stopped");
    });

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.tick().await; // first tick fires immediately; skip it

    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_client_message(&text) {
                    Ok(message) => tunnel.handle_client_message(message).await,
                    Err(e) => warn!(%subdomain, "dropping malformed control frame: {e}"),
                },
                Some(Ok(Message::Binary(data))) => {
                    tunnel.handle_binary_frame(data.into()).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                    *tunnel.last_pong.lock().await = std::time::Instant::now();
                }
                Some(Ok(Message::Close(_))) => break "control channel closed by client",
                Some(Err(e)) => {
                    warn!(%subdomain, "control connection read error: {e}");
                    break "control connection error";
                }
                None => break "control connection closed",
            },
            _ = ping_timer.tick() => {
                let idle = tunnel.last_pong.lock().await.elapsed();
                if idle >= IDLE_TIMEOUT {
                    warn!(%subdomain, ?idle, "tunnel idle timeout, disconnecting");
                    break "idle timeout";
                }
                tunnel.send(ServerMessage::Ping);
            }
        }
    };

    writer.abort();
    registry.unregister(&subdomain, reason).await;
}
