//! Browser-initiated WebSocket passthrough (§4.5): the dispatcher asks the
//! client to open a local WebSocket on its behalf, then bridges the browser's
//! real socket to the client's control-channel-relayed one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use tunnelforge_core::protocol::ServerMessage;

use crate::dispatcher::resolve_subdomain;
use crate::state::AppState;
use crate::tunnel::BrowserCommand;

/// How long the dispatcher waits for `ws_opened`/`ws_error` from the client
/// before giving up (§4.5 step 1, §5 timers).
const WS_UPGRADE_TIMEOUT: Duration = Duration::from_secs(30);

fn snapshot_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), value.to_string());
        }
    }
    map
}

pub async fn handle(state: Arc<AppState>, request: Request<Body>) -> Response {
    let headers = request.headers().clone();
    let Some(subdomain) = resolve_subdomain(&headers) else {
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };
    let Some(tunnel) = state.registry.get(&subdomain) else {
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let protocol = headers
        .get(axum::http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let ws_id = Uuid::new_v4();
    let rx = tunnel.begin_ws_upgrade(ws_id);
    tunnel.send(ServerMessage::WsOpen {
        ws_id,
        path,
        headers: snapshot_headers(&headers),
        protocol: protocol.clone(),
    });

    let outcome = match tokio::time::timeout(WS_UPGRADE_TIMEOUT, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err("tunnel disconnected".to_string()),
        Err(_) => {
            tunnel.cancel_ws_upgrade(&ws_id);
            Err("timed out waiting for local websocket".to_string())
        }
    };

    let negotiated_protocol = match outcome {
        Ok(protocol) => protocol,
        Err(error) => {
            warn!(%subdomain, %ws_id, %error, "websocket passthrough upgrade failed");
            return (StatusCode::BAD_GATEWAY, error).into_response();
        }
    };

    let Ok(upgrade) = WebSocketUpgrade::from_request(request, &()) else {
        return (StatusCode::BAD_REQUEST, "not a websocket upgrade").into_response();
    };
    let mut upgrade = upgrade;
    if let Some(protocol) = &negotiated_protocol {
        upgrade = upgrade.protocols([protocol.clone()]);
    }

    upgrade
        .on_upgrade(move |socket| bridge(socket, tunnel, ws_id))
        .into_response()
}

async fn bridge(socket: WebSocket, tunnel: Arc<crate::tunnel::Tunnel>, ws_id: Uuid) {
    let (mut sink, mut stream) = socket.split();
    let (browser_tx, mut browser_rx) = mpsc::unbounded_channel::<BrowserCommand>();
    tunnel.register_browser_socket(ws_id, browser_tx);

    let writer = tokio::spawn(async move {
        while let Some(command) = browser_rx.recv().await {
            let result = match command {
                BrowserCommand::Forward(message) => sink.send(message).await,
                BrowserCommand::Close { code, reason } => {
                    let _ = sink.send(WsMessage::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
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
            Some(Ok(WsMessage::Text(text))) => {
                tunnel.send(ServerMessage::WsMessage { ws_id, data: text.to_string() });
            }
            Some(Ok(WsMessage::Binary(data))) => {
                tunnel.send_ws_binary(ws_id, data);
            }
            Some(Ok(WsMessage::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (f.code, f.reason.to_string()))
                    .unwrap_or((1000, String::new()));
                tunnel.send(ServerMessage::WsClose {
                    ws_id,
                    code: Some(code),
                    reason: Some(reason),
                });
                break;
            }
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
            Some(Err(e)) => {
                warn!(%ws_id, "browser websocket read error: {e}");
                break;
            }
            None => break,
        }
    }

    writer.abort();
    tunnel.remove_browser_socket(&ws_id);
}
