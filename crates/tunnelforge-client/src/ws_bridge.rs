//! Client side of browser WebSocket passthrough (§4.5): opens a local
//! WebSocket in response to `ws_open`, then bridges it to the control
//! channel under the matching `ws_id`.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;
use uuid::Uuid;

use tunnelforge_core::protocol::{ClientMessage, Headers};

use crate::state::{ClientState, LocalWsCommand};

pub async fn open(state: Arc<ClientState>, ws_id: Uuid, path: String, headers: Headers, protocol: Option<String>) {
    let url = format!("ws://localhost:{}{}", state.local_port, path);
    let mut request = match url.into_client_request() {
        Ok(request) => request,
        Err(e) => {
            state.send(ClientMessage::WsError { ws_id, error: e.to_string() });
            return;
        }
    };
    if let Some(protocol) = &protocol {
        if let Ok(value) = HeaderValue::from_str(protocol) {
            request.headers_mut().insert("sec-websocket-protocol", value);
        }
    }
    for (name, value) in forwarded_request_headers(&headers) {
        if let (Ok(name), Ok(value)) = (
            tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            request.headers_mut().insert(name, value);
        }
    }

    let socket = match tokio_tungstenite::connect_async(request).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            state.send(ClientMessage::WsError { ws_id, error: e.to_string() });
            return;
        }
    };

    state.send(ClientMessage::WsOpened { ws_id, protocol });

    let (mut sink, mut stream) = socket.split();
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<LocalWsCommand>();
    state.register_ws(ws_id, local_tx).await;

    let writer = tokio::spawn(async move {
        while let Some(command) = local_rx.recv().await {
            let result = match command {
                LocalWsCommand::Forward(message) => sink.send(message).await,
                LocalWsCommand::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                            code: code.into(),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                state.send(ClientMessage::WsMessage { ws_id, data: text.to_string() });
            }
            Some(Ok(Message::Binary(data))) => {
                state.send_paired(ClientMessage::WsMessageBinary { ws_id }, data.to_vec().into());
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (Some(u16::from(f.code)), Some(f.reason.to_string())))
                    .unwrap_or((None, None));
                state.send(ClientMessage::WsClose { ws_id, code, reason });
                break;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                warn!(%ws_id, "local websocket read error: {e}");
                break;
            }
            None => break,
        }
    }

    writer.abort();
    state.remove_ws(&ws_id).await;
}

/// Only a small allow-list of headers makes sense to replay onto the local
/// WebSocket handshake; most of what the browser sent (host, upgrade,
/// connection, sec-websocket-*) is either already handled by the local
/// dialer or meaningless on a loopback connection.
fn forwarded_request_headers(headers: &Headers) -> Vec<(String, String)> {
    const ALLOWED: &[&str] = &["cookie", "authorization", "origin", "user-agent"];
    headers
        .iter()
        .filter(|(name, _)| ALLOWED.contains(&name.to_ascii_lowercase().as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
