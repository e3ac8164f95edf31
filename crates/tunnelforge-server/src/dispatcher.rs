//! Public HTTP surface (§4.4, §6): health/verify/status, the `/connect`
//! control-channel upgrade, and the catch-all proxy that turns an incoming
//! request into an `http_request` control message and waits for the reply.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use tunnelforge_core::auth::keys_match;
use tunnelforge_core::events::TunnelEvent;
use tunnelforge_core::protocol::{Headers, ServerMessage};
use tunnelforge_core::subdomain::{allocate_subdomain, cache_key, is_valid_subdomain};

use crate::auth::check_api_key;
use crate::state::AppState;
use crate::tunnel::{PendingOutcome, StreamEvent};

/// Maximum request body this server will buffer before giving up (§4.4 step 2
/// reads the whole body; this bounds it against a single misbehaving edge).
const MAX_REQUEST_BODY_BYTES: usize = 100 * 1024 * 1024;
/// Per-request timeout before any response arrives (§4.4 step 5, §5 timers).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusTunnel {
    subdomain: String,
    #[serde(rename = "createdAt")]
    created_at: u64,
    #[serde(rename = "pendingRequests")]
    pending_requests: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(rename = "activeTunnels")]
    active_tunnels: usize,
    tunnels: Vec<StatusTunnel>,
}

pub async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !check_api_key(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let tunnels: Vec<StatusTunnel> = state
        .registry
        .enumerate()
        .into_iter()
        .map(|t| StatusTunnel {
            subdomain: t.subdomain.clone(),
            created_at: t.created_at_ms,
            pending_requests: t.pending_request_count(),
        })
        .collect();
    Json(StatusResponse {
        active_tunnels: tunnels.len(),
        tunnels,
    })
    .into_response()
}

#[derive(Deserialize)]
pub struct ConnectQuery {
    subdomain: Option<String>,
    port: Option<u16>,
}

/// `GET /__tunnel__/connect` (§4.2, §4.3, §4.8): resolve/validate the
/// subdomain, apply the reconnect-eviction policy, then upgrade.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let candidate = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !keys_match(&candidate, &state.config.api_key) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let subdomain = match resolve_subdomain_for_connect(&state, &query, &candidate).await {
        Ok(subdomain) => subdomain,
        Err(status) => return status.into_response(),
    };

    if let Some(existing) = state.registry.get(&subdomain) {
        if existing.api_key != candidate {
            return StatusCode::CONFLICT.into_response();
        }
        existing.request_close(1000, "Reconnecting");
        state.registry.unregister(&subdomain, "Reconnecting").await;
    }

    if let Some(port) = query.port {
        state.cache.set(cache_key(&candidate, port), subdomain.clone()).await;
    }

    let registry = state.registry.clone();
    let api_key = candidate;
    let subdomain_for_upgrade = subdomain.clone();
    ws.on_upgrade(move |socket| crate::control::run(socket, registry, subdomain_for_upgrade, api_key))
}

async fn resolve_subdomain_for_connect(
    state: &AppState,
    query: &ConnectQuery,
    api_key: &str,
) -> Result<String, StatusCode> {
    if let Some(requested) = &query.subdomain {
        if !is_valid_subdomain(requested) {
            return Err(StatusCode::BAD_REQUEST);
        }
        if let Some(port) = query.port {
            if state.cache.reserved_by_other(&cache_key(api_key, port), requested).await {
                return Err(StatusCode::CONFLICT);
            }
        }
        return Ok(requested.clone());
    }

    if let Some(port) = query.port {
        let key = cache_key(api_key, port);
        if let Some(cached) = state.cache.get(&key).await {
            return Ok(cached);
        }
    }

    loop {
        let candidate = allocate_subdomain();
        if !state.registry.has(&candidate) {
            return Ok(candidate);
        }
    }
}

/// Subdomain resolution shared by the catch-all proxy and the WS passthrough
/// path (§4.4): `X-Tunnel-Subdomain` header set by the trusted edge, else the
/// leftmost label of `Host`.
pub fn resolve_subdomain(headers: &HeaderMap) -> Option<String> {
    if let Some(explicit) = headers.get("x-tunnel-subdomain").and_then(|v| v.to_str().ok()) {
        return Some(explicit.to_string());
    }
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|host| host.split('.').next())
        .map(|s| s.to_string())
}

pub fn is_ws_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let has_connection_upgrade = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_upgrade && has_connection_upgrade
}

fn snapshot_headers(headers: &HeaderMap) -> Headers {
    let mut map = BTreeMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), value.to_string());
        }
    }
    map
}

fn apply_headers(mut builder: axum::http::response::Builder, headers: &Headers) -> axum::http::response::Builder {
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
}

/// Catch-all handler for every public request that isn't one of the
/// `/__tunnel__/*` control endpoints (§4.4).
pub async fn proxy(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let headers = request.headers().clone();

    if is_ws_upgrade(&headers) {
        return crate::ws_passthrough::handle(state, request).await;
    }

    let Some(subdomain) = resolve_subdomain(&headers) else {
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };
    let Some(tunnel) = state.registry.get(&subdomain) else {
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };

    let method = request.method().to_string();
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let body_text = if method == "GET" || method == "HEAD" {
        None
    } else {
        match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                warn!(%subdomain, "failed to read request body: {e}");
                return (StatusCode::BAD_GATEWAY, "Bad Gateway: could not read request body").into_response();
            }
        }
    };

    let request_id = Uuid::new_v4();
    let start = Instant::now();
    tunnelforge_core::events::publish(
        &state.events,
        TunnelEvent::RequestStarted {
            request_id,
            subdomain: subdomain.clone(),
            method: method.clone(),
            path: path.clone(),
        },
    );

    let rx = tunnel.begin_request(request_id);
    tunnel.send(ServerMessage::HttpRequest {
        request_id,
        method,
        path,
        headers: snapshot_headers(&parts.headers),
        body: body_text,
    });

    let outcome = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => PendingOutcome::Disconnected,
        Err(_) => {
            tunnel.cancel_request(&request_id);
            tunnelforge_core::events::publish(&state.events, TunnelEvent::RequestTimedOut { request_id });
            return (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response();
        }
    };

    let response = match outcome {
        PendingOutcome::Buffered { status, headers, body } => {
            let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let builder = apply_headers(Response::builder().status(status_code), &headers);
            builder.body(Body::from(body)).unwrap_or_else(|_| {
                (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response()
            })
        }
        PendingOutcome::StreamStarted { status, headers, events, .. } => {
            let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let builder = apply_headers(Response::builder().status(status_code), &headers);
            let body_stream = stream::unfold(events, |mut events| async move {
                match events.recv().await {
                    Some(StreamEvent::Chunk(bytes)) => Some((Ok(bytes), events)),
                    Some(StreamEvent::End) | None => None,
                    Some(StreamEvent::Error(err)) => Some((Err(std::io::Error::other(err)), events)),
                }
            });
            builder
                .body(Body::from_stream(body_stream))
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response())
        }
        PendingOutcome::Disconnected => (StatusCode::BAD_GATEWAY, "Bad Gateway: tunnel disconnected").into_response(),
    };

    let duration = start.elapsed();
    tunnel.send(ServerMessage::RequestTiming {
        request_id,
        duration: duration.as_millis() as u64,
    });
    tunnelforge_core::events::publish(
        &state.events,
        TunnelEvent::RequestCompleted {
            request_id,
            status: response.status().as_u16(),
            duration_ms: duration.as_millis() as u64,
        },
    );
    info!(%subdomain, %request_id, status = response.status().as_u16(), ?duration, "request completed");

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn resolve_subdomain_prefers_explicit_header_over_host() {
        let h = headers(&[("x-tunnel-subdomain", "brave-fox-abcd"), ("host", "other.example.com")]);
        assert_eq!(resolve_subdomain(&h).as_deref(), Some("brave-fox-abcd"));
    }

    #[test]
    fn resolve_subdomain_falls_back_to_leftmost_host_label() {
        let h = headers(&[("host", "brave-fox-abcd.tunnel.example.com")]);
        assert_eq!(resolve_subdomain(&h).as_deref(), Some("brave-fox-abcd"));
    }

    #[test]
    fn resolve_subdomain_is_none_without_header_or_host() {
        assert_eq!(resolve_subdomain(&HeaderMap::new()), None);
    }

    #[test]
    fn is_ws_upgrade_requires_both_headers_case_insensitively() {
        assert!(is_ws_upgrade(&headers(&[("upgrade", "WebSocket"), ("connection", "Upgrade")])));
        assert!(is_ws_upgrade(&headers(&[("upgrade", "websocket"), ("connection", "keep-alive, Upgrade")])));
        assert!(!is_ws_upgrade(&headers(&[("upgrade", "websocket")])));
        assert!(!is_ws_upgrade(&headers(&[("connection", "upgrade")])));
        assert!(!is_ws_upgrade(&HeaderMap::new()));
    }

    #[test]
    fn snapshot_then_apply_headers_round_trips() {
        let original = headers(&[("content-type", "application/json"), ("x-custom", "value")]);
        let snapshot = snapshot_headers(&original);
        let builder = apply_headers(Response::builder(), &snapshot);
        let response = builder.body(Body::empty()).unwrap();
        assert_eq!(response.headers().get("content-type").unwrap(), "application/json");
        assert_eq!(response.headers().get("x-custom").unwrap(), "value");
    }
}
