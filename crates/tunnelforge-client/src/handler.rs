//! The client request handler (§4.6): forwards an `http_request` to the
//! loopback app, picks a response mode, and replies on the control channel.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap as ReqwestHeaders, HeaderName, HeaderValue};
use tracing::warn;
use uuid::Uuid;

use tunnelforge_core::events::TunnelEvent;
use tunnelforge_core::protocol::{ClientMessage, Headers};

use crate::compress::{compress, is_compressible_content_type, negotiate, MIN_COMPRESSIBLE_BYTES};
use crate::state::ClientState;

/// `contentLength ≤ 256 KiB` stays Inline; above goes to Compressed-stream.
const INLINE_MAX_BYTES: usize = 256 * 1024;
/// `contentLength > 100 MiB` is sent as a Raw stream: no buffering, no
/// compression.
const RAW_STREAM_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
/// Within Inline mode, a final body at or above this size is sent as binary
/// rather than inline text, even if compression wasn't applied.
const INLINE_BINARY_MIN_BYTES: usize = 64 * 1024;
/// Chunk size for Compressed-stream mode.
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

pub async fn handle_request(
    state: Arc<ClientState>,
    request_id: Uuid,
    method: String,
    path: String,
    headers: Headers,
    body: Option<String>,
) {
    tunnelforge_core::events::publish(
        &state.events,
        TunnelEvent::RequestStarted {
            request_id,
            subdomain: String::new(),
            method: method.clone(),
            path: path.clone(),
        },
    );

    let start = Instant::now();
    let url = format!("http://localhost:{}{}", state.local_port, path);
    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            state.send(ClientMessage::HttpResponse {
                request_id,
                status: 502,
                headers: Headers::new(),
                body: "Bad Gateway: invalid method".to_string(),
            });
            return;
        }
    };

    let mut outgoing_headers = ReqwestHeaders::new();
    for (name, value) in &headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || lower == "x-tunnel-subdomain" {
            continue;
        }
        if body.is_none() && (lower == "content-length" || lower == "transfer-encoding") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            outgoing_headers.insert(name, value);
        }
    }

    let mut request = state.http_client.request(method, &url).headers(outgoing_headers);
    if let Some(body) = &body {
        request = request.body(body.clone());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(%request_id, "failed to reach loopback server: {e}");
            state.send(ClientMessage::HttpResponse {
                request_id,
                status: 502,
                headers: Headers::new(),
                body: format!("Bad Gateway: {e}"),
            });
            return;
        }
    };

    let status = response.status().as_u16();
    let response_headers = snapshot_response_headers(response.headers());

    if let Some(not_modified) = try_conditional_get(&headers, status, &response_headers) {
        state.send(ClientMessage::HttpResponse {
            request_id,
            status: 304,
            headers: not_modified,
            body: String::new(),
        });
        return;
    }

    let is_sse = response_headers
        .get("content-type")
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
        || response_headers
            .get("x-accel-buffering")
            .map(|v| v.eq_ignore_ascii_case("no"))
            .unwrap_or(false);

    let content_length = response.content_length();

    if is_sse || content_length.map(|len| len > RAW_STREAM_THRESHOLD_BYTES).unwrap_or(false) {
        stream_raw(
            state.clone(),
            request_id,
            status,
            response_headers,
            response,
            if is_sse { None } else { content_length },
            is_sse,
        )
        .await;
    } else {
        match response.bytes().await {
            Ok(bytes) => send_buffered(&state, request_id, status, response_headers, bytes, &headers),
            Err(e) => {
                warn!(%request_id, "failed reading loopback response body: {e}");
                state.send(ClientMessage::HttpResponse {
                    request_id,
                    status: 502,
                    headers: Headers::new(),
                    body: format!("Bad Gateway: {e}"),
                });
            }
        }
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    tunnelforge_core::events::publish(
        &state.events,
        TunnelEvent::RequestCompleted { request_id, status, duration_ms },
    );
}

fn snapshot_response_headers(headers: &ReqwestHeaders) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_string(), value.to_string());
        }
    }
    map
}

fn strip_hygiene_headers(headers: &mut Headers) {
    headers.remove("content-encoding");
    headers.remove("content-length");
    headers.remove("transfer-encoding");
}

fn strip_weak(etag: &str) -> &str {
    etag.strip_prefix("W/").unwrap_or(etag)
}

/// If the request carried `If-None-Match` and the upstream response was a
/// fresh `200` with a matching `ETag`, synthesize the `304` headers to send
/// instead (§4.6 step 4). Returns `None` when no short-circuit applies.
fn try_conditional_get(request_headers: &Headers, status: u16, response_headers: &Headers) -> Option<Headers> {
    if status != 200 {
        return None;
    }
    let if_none_match = request_headers.get("if-none-match")?;
    let etag = response_headers.get("etag")?;
    let matches = if_none_match
        .split(',')
        .map(|candidate| candidate.trim())
        .any(|candidate| strip_weak(candidate) == strip_weak(etag));
    if !matches {
        return None;
    }

    let mut out = Headers::new();
    out.insert("etag".to_string(), etag.clone());
    if let Some(cache_control) = response_headers.get("cache-control") {
        out.insert("cache-control".to_string(), cache_control.clone());
    }
    if let Some(vary) = response_headers.get("vary") {
        out.insert("vary".to_string(), vary.clone());
    }
    Some(out)
}

fn send_buffered(
    state: &ClientState,
    request_id: Uuid,
    status: u16,
    mut headers: Headers,
    body: Bytes,
    request_headers: &Headers,
) {
    strip_hygiene_headers(&mut headers);
    let original_len = body.len();

    let mut final_body = body;
    let mut compressed = false;
    if status != 304 && original_len >= MIN_COMPRESSIBLE_BYTES {
        let content_type = headers.get("content-type").cloned().unwrap_or_default();
        if is_compressible_content_type(&content_type) {
            let accept_encoding = request_headers.get("accept-encoding").cloned().unwrap_or_default();
            if let Some(encoding) = negotiate(&accept_encoding) {
                if let Ok(compressed_bytes) = compress(encoding, &final_body) {
                    headers.insert("content-encoding".to_string(), encoding.wire_name().to_string());
                    final_body = Bytes::from(compressed_bytes);
                    compressed = true;
                }
            }
        }
    }
    headers.insert("content-length".to_string(), final_body.len().to_string());

    if original_len <= INLINE_MAX_BYTES {
        if compressed || final_body.len() >= INLINE_BINARY_MIN_BYTES {
            let body_size = final_body.len() as u64;
            state.send_paired(
                ClientMessage::HttpResponseBinary { request_id, status, headers, body_size },
                final_body,
            );
        } else {
            match String::from_utf8(final_body.to_vec()) {
                Ok(text) => state.send(ClientMessage::HttpResponse { request_id, status, headers, body: text }),
                Err(e) => {
                    let bytes = Bytes::from(e.into_bytes());
                    let body_size = bytes.len() as u64;
                    state.send_paired(
                        ClientMessage::HttpResponseBinary { request_id, status, headers, body_size },
                        bytes,
                    );
                }
            }
        }
        return;
    }

    state.send(ClientMessage::HttpResponseStreamStart {
        request_id,
        status,
        headers,
        total_size: Some(final_body.len() as u64),
    });
    for chunk in final_body.chunks(STREAM_CHUNK_BYTES) {
        let chunk_bytes = Bytes::copy_from_slice(chunk);
        state.send_paired(
            ClientMessage::HttpResponseStreamChunk { request_id, chunk_size: chunk_bytes.len() as u64 },
            chunk_bytes,
        );
    }
    state.send(ClientMessage::HttpResponseStreamEnd { request_id });
}

async fn stream_raw(
    state: Arc<ClientState>,
    request_id: Uuid,
    status: u16,
    mut headers: Headers,
    response: reqwest::Response,
    total_size: Option<u64>,
    is_sse: bool,
) {
    // Header hygiene only applies to non-raw-stream responses (§4.6): an SSE
    // stream has no fixed length and no encoding to report, but a raw-stream
    // download keeps its upstream `content-length`/`content-type` as-is.
    if is_sse {
        strip_hygiene_headers(&mut headers);
    }
    state.send(ClientMessage::HttpResponseStreamStart { request_id, status, headers, total_size });

    let mut body_stream = response.bytes_stream();
    while let Some(chunk) = body_stream.next().await {
        match chunk {
            Ok(bytes) => {
                tunnelforge_core::events::publish(
                    &state.events,
                    TunnelEvent::StreamProgress { request_id, bytes_so_far: bytes.len() as u64 },
                );
                state.send_paired(
                    ClientMessage::HttpResponseStreamChunk { request_id, chunk_size: bytes.len() as u64 },
                    bytes,
                );
            }
            Err(e) => {
                state.send(ClientMessage::HttpResponseStreamError { request_id, error: e.to_string() });
                return;
            }
        }
    }
    state.send(ClientMessage::HttpResponseStreamEnd { request_id });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn conditional_get_matches_on_strong_etag() {
        let request_headers = headers_with(&[("if-none-match", "\"abc123\"")]);
        let response_headers = headers_with(&[("etag", "\"abc123\""), ("cache-control", "no-cache")]);
        let out = try_conditional_get(&request_headers, 200, &response_headers).unwrap();
        assert_eq!(out.get("etag").map(String::as_str), Some("\"abc123\""));
        assert_eq!(out.get("cache-control").map(String::as_str), Some("no-cache"));
    }

    #[test]
    fn conditional_get_matches_ignoring_weak_prefix() {
        let request_headers = headers_with(&[("if-none-match", "W/\"abc123\"")]);
        let response_headers = headers_with(&[("etag", "\"abc123\"")]);
        assert!(try_conditional_get(&request_headers, 200, &response_headers).is_some());
    }

    #[test]
    fn conditional_get_does_not_fire_on_mismatch() {
        let request_headers = headers_with(&[("if-none-match", "\"old\"")]);
        let response_headers = headers_with(&[("etag", "\"new\"")]);
        assert!(try_conditional_get(&request_headers, 200, &response_headers).is_none());
    }

    #[test]
    fn conditional_get_ignored_on_non_200() {
        let request_headers = headers_with(&[("if-none-match", "\"abc123\"")]);
        let response_headers = headers_with(&[("etag", "\"abc123\"")]);
        assert!(try_conditional_get(&request_headers, 404, &response_headers).is_none());
    }
}
