//! The client reconnect supervisor (§4.7): one connect attempt at a time,
//! exponential backoff between them, and the single writer/reader pair that
//! drives a live control connection. Mirrors the server's `control::run` in
//! shape but owns the *connecting* side of the handshake too.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use tunnelforge_core::events::{publish, ConnectionState, EventSender, TunnelEvent};
use tunnelforge_core::protocol::{decode_server_message, ClientMessage, ServerMessage};

use crate::config::ClientConfig;
use crate::handler::handle_request;
use crate::state::{ClientState, LocalWsCommand, OutboundCommand};
use crate::ws_bridge;

/// Backoff ceiling (§4.7): `min(60s, 1s * 2^(n-1))`.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before reconnect attempt `n` (1-indexed): `min(60s, 1s * 2^(n-1))`.
/// The exponent is capped at 6 (`2^6 = 64s`) purely to keep the shift from
/// overflowing on an arbitrarily long-running reconnect loop; the outer
/// `min` with `MAX_BACKOFF` already does the real clamping at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    std::cmp::min(MAX_BACKOFF, Duration::from_secs(1).saturating_mul(1u32 << exponent))
}

pub struct ReconnectOptions {
    pub server_url: String,
    pub api_key: String,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub config_path: std::path::PathBuf,
}

/// Run the reconnect loop until `shutdown` fires. Never returns an error
/// once the first connection has succeeded; an initial failure is returned
/// to the caller so the process can exit non-zero (§5 exit codes).
pub async fn run(
    options: ReconnectOptions,
    events: EventSender,
    shutdown: tokio_util::sync::CancellationToken,
) -> color_eyre::Result<()> {
    let mut subdomain = options.subdomain.clone();
    let mut attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        match connect_once(&options, subdomain.clone(), events.clone(), shutdown.clone()).await {
            Ok(last_subdomain) => {
                ever_connected = true;
                subdomain = Some(last_subdomain);
                attempt = 0;
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                warn!("control connection closed, reconnecting");
                publish(
                    &events,
                    TunnelEvent::ConnectionStateChanged {
                        subdomain: subdomain.clone().unwrap_or_default(),
                        state: ConnectionState::Reconnecting,
                    },
                );
            }
            Err(e) if !ever_connected => {
                error!("initial connection failed: {e}");
                return Err(e);
            }
            Err(e) => {
                warn!("reconnect attempt failed: {e}");
            }
        }

        attempt += 1;
        let delay = backoff_delay(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

/// Connect, register with the server, and drive the connection until it
/// closes. Returns the subdomain the server confirmed, so the caller can
/// resend it on the next attempt.
async fn connect_once(
    options: &ReconnectOptions,
    subdomain: Option<String>,
    events: EventSender,
    shutdown: tokio_util::sync::CancellationToken,
) -> color_eyre::Result<String> {
    let mut url = format!(
        "{}/__tunnel__/connect?port={}",
        options.server_url.trim_end_matches('/'),
        options.local_port
    );
    if let Some(subdomain) = &subdomain {
        url.push_str(&format!("&subdomain={subdomain}"));
    }

    let mut request = url.clone().into_client_request()?;
    request
        .headers_mut()
        .insert("x-api-key", HeaderValue::from_str(&options.api_key)?);

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
    let (mut sink, mut stream) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundCommand>();
    let state = ClientState::new(options.local_port, outbound_tx, events.clone());

    let writer = tokio::spawn(async move {
        while let Some(command) = outbound_rx.recv().await {
            match command {
                OutboundCommand::Message(message) => {
                    if sink.send(Message::Text(message.encode().into())).await.is_err() {
                        break;
                    }
                }
                OutboundCommand::Paired(message, body) => {
                    if sink.send(Message::Text(message.encode().into())).await.is_err() {
                        break;
                    }
                    if sink.send(Message::Binary(body.to_vec().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut confirmed_subdomain = subdomain.clone().unwrap_or_default();

    let result: color_eyre::Result<()> = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_server_message(&text) {
                    Ok(message) => {
                        if let ServerMessage::Connected { subdomain } = &message {
                            confirmed_subdomain = subdomain.clone();
                            persist_subdomain(options, subdomain.clone()).await;
                            publish(&events, TunnelEvent::ConnectionStateChanged {
                                subdomain: subdomain.clone(),
                                state: ConnectionState::Connected,
                            });
                        }
                        dispatch(state.clone(), message).await;
                    }
                    Err(e) => warn!("dropping malformed server message: {e}"),
                },
                Some(Ok(Message::Binary(data))) => {
                    handle_binary_frame(&state, data.to_vec().into()).await;
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
            },
            _ = shutdown.cancelled() => break Ok(()),
        }
    };

    writer.abort();
    teardown_local_sockets(&state).await;
    result?;
    Ok(confirmed_subdomain)
}

async fn persist_subdomain(options: &ReconnectOptions, subdomain: String) {
    let mut config = ClientConfig::load(&options.config_path).await.unwrap_or_default();
    config.server_url = options.server_url.clone();
    config.api_key = options.api_key.clone();
    config.remember_subdomain(options.local_port, subdomain);
    if let Err(e) = config.save(&options.config_path).await {
        warn!("failed to persist client config: {e}");
    }
}

async fn dispatch(state: Arc<ClientState>, message: ServerMessage) {
    match message {
        ServerMessage::Connected { .. } => {}
        ServerMessage::HttpRequest { request_id, method, path, headers, body } => {
            tokio::spawn(handle_request(state, request_id, method, path, headers, body));
        }
        ServerMessage::RequestTiming { .. } => {}
        ServerMessage::Ping => state.send(ClientMessage::Pong),
        ServerMessage::Error { message } => warn!("server error: {message}"),
        ServerMessage::WsOpen { ws_id, path, headers, protocol } => {
            tokio::spawn(ws_bridge::open(state, ws_id, path, headers, protocol));
        }
        ServerMessage::WsMessage { ws_id, data } => {
            forward_to_local_ws(&state, ws_id, LocalWsCommand::Forward(Message::Text(data.into()))).await;
        }
        ServerMessage::WsMessageBinary { ws_id } => {
            *state.ws_binary_slot.lock().await = Some(ws_id);
        }
        ServerMessage::WsClose { ws_id, code, reason } => {
            forward_to_local_ws(
                &state,
                ws_id,
                LocalWsCommand::Close { code: code.unwrap_or(1000), reason: reason.unwrap_or_default() },
            )
            .await;
        }
    }
}

async fn handle_binary_frame(state: &Arc<ClientState>, data: bytes::Bytes) {
    let ws_id = state.ws_binary_slot.lock().await.take();
    if let Some(ws_id) = ws_id {
        forward_to_local_ws(state, ws_id, LocalWsCommand::Forward(Message::Binary(data.to_vec().into()))).await;
    } else {
        warn!("dropping unannounced binary frame from server");
    }
}

async fn forward_to_local_ws(state: &Arc<ClientState>, ws_id: uuid::Uuid, command: LocalWsCommand) {
    let active = state.active_ws.read().await;
    if let Some(sender) = active.get(&ws_id) {
        let _ = sender.send(command);
    }
}

async fn teardown_local_sockets(state: &Arc<ClientState>) {
    let mut active = state.active_ws.write().await;
    for (_, sender) in active.drain() {
        let _ = sender.send(LocalWsCommand::Close { code: 1001, reason: "Tunnel disconnected".to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_to_cap() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(7), Duration::from_secs(60));
        assert_eq!(backoff_delay(20), Duration::from_secs(60));
    }

    fn make_state() -> Arc<ClientState> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (events, _) = tunnelforge_core::events::channel();
        ClientState::new(8080, tx, events)
    }

    #[tokio::test]
    async fn dispatch_ping_replies_with_pong() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (events, _) = tunnelforge_core::events::channel();
        let state = ClientState::new(8080, tx, events);

        dispatch(state, ServerMessage::Ping).await;

        match rx.recv().await.unwrap() {
            OutboundCommand::Message(ClientMessage::Pong) => {}
            other => panic!("expected a Pong reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_ws_message_binary_arms_the_slot() {
        let state = make_state();
        let ws_id = uuid::Uuid::new_v4();
        dispatch(state.clone(), ServerMessage::WsMessageBinary { ws_id }).await;
        assert_eq!(*state.ws_binary_slot.lock().await, Some(ws_id));
    }

    #[tokio::test]
    async fn handle_binary_frame_consumes_the_slot_once() {
        let state = make_state();
        let ws_id = uuid::Uuid::new_v4();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        state.register_ws(ws_id, sender).await;
        *state.ws_binary_slot.lock().await = Some(ws_id);

        handle_binary_frame(&state, bytes::Bytes::from_static(b"payload")).await;
        assert!(state.ws_binary_slot.lock().await.is_none());
        match receiver.recv().await.unwrap() {
            LocalWsCommand::Forward(Message::Binary(data)) => assert_eq!(&data[..], b"payload"),
            other => panic!("expected a forwarded binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handle_binary_frame_with_no_announcement_is_dropped_not_panicked() {
        let state = make_state();
        handle_binary_frame(&state, bytes::Bytes::from_static(b"stray")).await;
        assert!(state.ws_binary_slot.lock().await.is_none());
    }

    #[tokio::test]
    async fn forward_to_local_ws_for_an_unknown_id_is_a_silent_no_op() {
        let state = make_state();
        forward_to_local_ws(&state, uuid::Uuid::new_v4(), LocalWsCommand::Close { code: 1000, reason: String::new() }).await;
    }

    #[tokio::test]
    async fn teardown_closes_and_clears_every_active_socket() {
        let state = make_state();
        let ws_id = uuid::Uuid::new_v4();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        state.register_ws(ws_id, sender).await;

        teardown_local_sockets(&state).await;

        assert!(state.active_ws.read().await.is_empty());
        match receiver.recv().await.unwrap() {
            LocalWsCommand::Close { code, reason } => {
                assert_eq!(code, 1001);
                assert_eq!(reason, "Tunnel disconnected");
            }
            other => panic!("expected a close command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persist_subdomain_remembers_the_port_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let options = ReconnectOptions {
            server_url: "https://tunnel.example.com".to_string(),
            api_key: "secret".to_string(),
            local_port: 4000,
            subdomain: None,
            config_path: config_path.clone(),
        };

        persist_subdomain(&options, "brave-fox-abcd".to_string()).await;

        let saved = ClientConfig::load(&config_path).await.unwrap();
        assert_eq!(saved.server_url, "https://tunnel.example.com");
        assert_eq!(saved.port_subdomains.get(&4000).cloned(), Some("brave-fox-abcd".to_string()));
    }
}
