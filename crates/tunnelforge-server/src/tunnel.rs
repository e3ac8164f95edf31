//! Per-tunnel state (§3): the control connection's outbound queue, the
//! pending-request/stream/browser-socket/ws-upgrade tables, and the two
//! binary-announcement slots. A `Tunnel` is exclusively owned by the
//! registry and is torn down atomically on disconnect, eviction or shutdown.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::Message as WsMessage;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;
use uuid::Uuid;

use tunnelforge_core::protocol::{ClientMessage, Headers, HttpBinarySlot, ServerMessage};

/// What a `PendingRequest`'s one-shot completion slot resolves to.
pub enum PendingOutcome {
    Buffered {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    StreamStarted {
        status: u16,
        headers: Headers,
        total_size: Option<u64>,
        events: mpsc::Receiver<StreamEvent>,
    },
    Disconnected,
}

#[derive(Debug)]
pub enum StreamEvent {
    Chunk(Bytes),
    End,
    Error(String),
}

/// What a browser-initiated WebSocket upgrade resolves to once the client
/// confirms (`ws_opened`) or rejects (`ws_error`/timeout) it.
pub type WsUpgradeOutcome = Result<Option<String>, String>;

/// Command queue feeding the task that owns the real, browser-facing
/// `axum::extract::ws::WebSocket`.
#[derive(Debug)]
pub enum BrowserCommand {
    Forward(WsMessage),
    Close { code: u16, reason: String },
}

/// What the single writer task drains from the outbound queue: either a
/// protocol message, a binary payload that must be written immediately after
/// its own `ws_message_binary` announcement with nothing interleaved (so the
/// pairing holds even though other tasks share this queue), or a request to
/// close the underlying connection outright (reconnect-eviction, §4.2).
pub enum OutboundCommand {
    Message(ServerMessage),
    WsBinary { ws_id: Uuid, data: Bytes },
    Close { code: u16, reason: String },
}

struct PendingRequest {
    sender: oneshot::Sender<PendingOutcome>,
}

/// Bounded capacity for a stream's chunk channel: backpressure from this
/// channel is how the client handler feels the public response's backpressure
/// (§5 suspension points).
const STREAM_CHANNEL_CAPACITY: usize = 16;

pub struct Tunnel {
    pub subdomain: String,
    pub api_key: String,
    pub created_at_ms: u64,
    outbound: mpsc::UnboundedSender<OutboundCommand>,
    pending_requests: DashMap<Uuid, PendingRequest>,
    streams: DashMap<Uuid, mpsc::Sender<StreamEvent>>,
    browser_sockets: DashMap<Uuid, mpsc::UnboundedSender<BrowserCommand>>,
    pending_ws_upgrades: DashMap<Uuid, oneshot::Sender<WsUpgradeOutcome>>,
    http_binary_slot: Mutex<HttpBinarySlot>,
    ws_binary_slot: Mutex<Option<Uuid>>,
    pub last_pong: Mutex<Instant>,
}

impl Tunnel {
    pub fn new(subdomain: String, api_key: String, outbound: mpsc::UnboundedSender<OutboundCommand>) -> Arc<Self> {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Arc::new(Self {
            subdomain,
            api_key,
            created_at_ms,
            outbound,
            pending_requests: DashMap::new(),
            streams: DashMap::new(),
            browser_sockets: DashMap::new(),
            pending_ws_upgrades: DashMap::new(),
            http_binary_slot: Mutex::new(HttpBinarySlot::Idle),
            ws_binary_slot: Mutex::new(None),
            last_pong: Mutex::new(Instant::now()),
        })
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    /// Enqueue a message on the single-writer outbound queue. Never fails the
    /// caller even if the writer task has already shut down — the control
    /// connection is tearing down anyway in that case.
    pub fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(OutboundCommand::Message(message));
    }

    /// Enqueue a `ws_message_binary` announcement and its payload as one
    /// atomic unit, so no other sender can slip a frame between them.
    pub fn send_ws_binary(&self, ws_id: Uuid, data: Bytes) {
        let _ = self.outbound.send(OutboundCommand::WsBinary { ws_id, data });
    }

    /// Request that the writer task close the underlying connection with the
    /// given WebSocket close code and reason, used by the reconnect-eviction
    /// policy (§4.2) to disconnect a superseded registration.
    pub fn request_close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.outbound.send(OutboundCommand::Close { code, reason: reason.into() });
    }

    /// Register a new in-flight request before the `http_request` message is
    /// sent, per the PendingRequest invariant (§3).
    pub fn begin_request(&self, request_id: Uuid) -> oneshot::Receiver<PendingOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(request_id, PendingRequest { sender: tx });
        rx
    }

    /// Remove a PendingRequest without resolving it — used when the caller
    /// (e.g. the 30s timeout) has already given up on the oneshot receiver.
    pub fn cancel_request(&self, request_id: &Uuid) {
        self.pending_requests.remove(request_id);
    }

    fn complete_request(&self, request_id: &Uuid, outcome: PendingOutcome) {
        if let Some((_, pending)) = self.pending_requests.remove(request_id) {
            // Replaying a response for an already-completed/unknown request is a
            // documented no-op (§8); a dropped receiver is exactly that case.
            let _ = pending.sender.send(outcome);
        } else {
            warn!(%request_id, "response for unknown or already-completed request, ignoring");
        }
    }

    pub fn register_stream(&self, request_id: Uuid) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.streams.insert(request_id, tx);
        rx
    }

    pub fn begin_ws_upgrade(&self, ws_id: Uuid) -> oneshot::Receiver<WsUpgradeOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending_ws_upgrades.insert(ws_id, tx);
        rx
    }

    pub fn cancel_ws_upgrade(&self, ws_id: &Uuid) {
        self.pending_ws_upgrades.remove(ws_id);
    }

    pub fn register_browser_socket(&self, ws_id: Uuid, sender: mpsc::UnboundedSender<BrowserCommand>) {
        self.browser_sockets.insert(ws_id, sender);
    }

    pub fn remove_browser_socket(&self, ws_id: &Uuid) {
        self.browser_sockets.remove(ws_id);
    }

    /// Dispatch a decoded `ClientMessage`. Called from the control
    /// connection's read loop (one task per tunnel, so no interleaving).
    pub async fn handle_client_message(&self, message: ClientMessage) {
        match message {
            ClientMessage::HttpResponse { request_id, status, headers, body } => {
                self.complete_request(
                    &request_id,
                    PendingOutcome::Buffered { status, headers, body: Bytes::from(body.into_bytes()) },
                );
            }
            ClientMessage::HttpResponseBinary { request_id, status, headers, .. } => {
                let mut slot = self.http_binary_slot.lock().await;
                if !slot.is_idle() {
                    warn!(%request_id, "new http_response_binary while a binary frame was still pending; discarding previous header");
                }
                *slot = HttpBinarySlot::Header { request_id, status, headers };
            }
            ClientMessage::HttpResponseStreamStart { request_id, status, headers, total_size } => {
                let events = self.register_stream(request_id);
                self.complete_request(
                    &request_id,
                    PendingOutcome::StreamStarted { status, headers, total_size, events },
                );
            }
            ClientMessage::HttpResponseStreamChunk { request_id, chunk_size } => {
                let mut slot = self.http_binary_slot.lock().await;
                if !slot.is_idle() {
                    warn!(%request_id, "new stream chunk announcement while a binary frame was still pending; discarding previous header");
                }
                *slot = HttpBinarySlot::Chunk { request_id, chunk_size };
            }
            ClientMessage::HttpResponseStreamEnd { request_id } => {
                if let Some((_, tx)) = self.streams.remove(&request_id) {
                    let _ = tx.send(StreamEvent::End).await;
                }
            }
            ClientMessage::HttpResponseStreamError { request_id, error } => {
                if let Some((_, tx)) = self.streams.remove(&request_id) {
                    let _ = tx.send(StreamEvent::Error(error)).await;
                }
            }
            ClientMessage::Pong => {
                *self.last_pong.lock().await = Instant::now();
            }
            ClientMessage::WsOpened { ws_id, protocol } => {
                if let Some((_, tx)) = self.pending_ws_upgrades.remove(&ws_id) {
                    let _ = tx.send(Ok(protocol));
                }
            }
            ClientMessage::WsError { ws_id, error } => {
                if let Some((_, tx)) = self.pending_ws_upgrades.remove(&ws_id) {
                    let _ = tx.send(Err(error));
                }
            }
            ClientMessage::WsMessage { ws_id, data } => {
                if let Some(sender) = self.browser_sockets.get(&ws_id) {
                    let _ = sender.send(BrowserCommand::Forward(WsMessage::Text(data.into())));
                }
            }
            ClientMessage::WsMessageBinary { ws_id } => {
                let mut slot = self.ws_binary_slot.lock().await;
                if slot.is_some() {
                    warn!(%ws_id, "new ws_message_binary announcement while one was still pending; discarding previous");
                }
                *slot = Some(ws_id);
            }
            ClientMessage::WsClose { ws_id, code, reason } => {
                if let Some((_, sender)) = self.browser_sockets.remove(&ws_id) {
                    let _ = sender.send(BrowserCommand::Close {
                        code: code.unwrap_or(1000),
                        reason: reason.unwrap_or_default(),
                    });
                }
            }
        }
    }

    /// Dispatch a raw binary frame following the fixed consultation order
    /// from §4.1: pending HTTP header, then awaiting-chunk stream, then the
    /// WS binary slot, else drop with a warning.
    pub async fn handle_binary_frame(&self, data: Bytes) {
        let http_slot = {
            let mut slot = self.http_binary_slot.lock().await;
            std::mem::replace(&mut *slot, HttpBinarySlot::Idle)
        };

        match http_slot {
            HttpBinarySlot::Header { request_id, status, headers } => {
                self.complete_request(&request_id, PendingOutcome::Buffered { status, headers, body: data });
                return;
            }
            HttpBinarySlot::Chunk { request_id, .. } => {
                if let Some(tx) = self.streams.get(&request_id) {
                    let _ = tx.send(StreamEvent::Chunk(data)).await;
                } else {
                    warn!(%request_id, "binary chunk for unknown or already-closed stream, dropping");
                }
                return;
            }
            HttpBinarySlot::Idle => {}
        }

        let ws_id = self.ws_binary_slot.lock().await.take();
        match ws_id {
            Some(ws_id) => {
                if let Some(sender) = self.browser_sockets.get(&ws_id) {
                    let _ = sender.send(BrowserCommand::Forward(WsMessage::Binary(data)));
                } else {
                    warn!(%ws_id, "binary websocket payload for unknown socket, dropping");
                }
            }
            None => {
                warn!("binary frame with no pending announcement, dropping");
            }
        }
    }

    /// Tear down every table: reject pending requests/upgrades, abort
    /// streams, close browser sockets with 1001. Idempotent.
    pub async fn teardown(&self, reason: &str) {
        let pending_ids: Vec<Uuid> = self.pending_requests.iter().map(|e| *e.key()).collect();
        for id in pending_ids {
            if let Some((_, pending)) = self.pending_requests.remove(&id) {
                let _ = pending.sender.send(PendingOutcome::Disconnected);
            }
        }

        let stream_ids: Vec<Uuid> = self.streams.iter().map(|e| *e.key()).collect();
        for id in stream_ids {
            if let Some((_, tx)) = self.streams.remove(&id) {
                let _ = tx.send(StreamEvent::Error(reason.to_string())).await;
            }
        }

        let upgrade_ids: Vec<Uuid> = self.pending_ws_upgrades.iter().map(|e| *e.key()).collect();
        for id in upgrade_ids {
            if let Some((_, tx)) = self.pending_ws_upgrades.remove(&id) {
                let _ = tx.send(Err(reason.to_string()));
            }
        }

        let socket_ids: Vec<Uuid> = self.browser_sockets.iter().map(|e| *e.key()).collect();
        for id in socket_ids {
            if let Some((_, sender)) = self.browser_sockets.remove(&id) {
                let _ = sender.send(BrowserCommand::Close { code: 1001, reason: reason.to_string() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tunnel() -> Arc<Tunnel> {
        let (tx, _rx) = mpsc::unbounded_channel::<OutboundCommand>();
        Tunnel::new("brave-fox-abcd".to_string(), "key".to_string(), tx)
    }

    #[tokio::test]
    async fn begin_request_then_buffered_response_resolves_the_waiter() {
        let tunnel = make_tunnel();
        let request_id = Uuid::new_v4();
        let rx = tunnel.begin_request(request_id);
        assert_eq!(tunnel.pending_request_count(), 1);

        tunnel
            .handle_client_message(ClientMessage::HttpResponse {
                request_id,
                status: 200,
                headers: Headers::new(),
                body: "hello".to_string(),
            })
            .await;

        let outcome = rx.await.unwrap();
        match outcome {
            PendingOutcome::Buffered { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, Bytes::from_static(b"hello"));
            }
            PendingOutcome::StreamStarted { .. } => panic!("expected a buffered outcome"),
            PendingOutcome::Disconnected => panic!("expected a buffered outcome"),
        }
        assert_eq!(tunnel.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn response_for_unknown_request_is_a_silent_no_op() {
        let tunnel = make_tunnel();
        tunnel
            .handle_client_message(ClientMessage::HttpResponse {
                request_id: Uuid::new_v4(),
                status: 200,
                headers: Headers::new(),
                body: String::new(),
            })
            .await;
        assert_eq!(tunnel.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn binary_announcement_then_frame_completes_as_buffered() {
        let tunnel = make_tunnel();
        let request_id = Uuid::new_v4();
        let rx = tunnel.begin_request(request_id);

        tunnel
            .handle_client_message(ClientMessage::HttpResponseBinary {
                request_id,
                status: 200,
                headers: Headers::new(),
                body_size: 3,
            })
            .await;
        tunnel.handle_binary_frame(Bytes::from_static(b"abc")).await;

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, PendingOutcome::Buffered { body, .. } if body == Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn binary_frame_with_no_announcement_is_dropped_not_panicked() {
        let tunnel = make_tunnel();
        tunnel.handle_binary_frame(Bytes::from_static(b"orphan")).await;
    }

    #[tokio::test]
    async fn http_binary_slot_is_consulted_before_ws_binary_slot() {
        let tunnel = make_tunnel();
        let request_id = Uuid::new_v4();
        let rx = tunnel.begin_request(request_id);

        let ws_id = Uuid::new_v4();
        let (browser_tx, mut browser_rx) = mpsc::unbounded_channel::<BrowserCommand>();
        tunnel.register_browser_socket(ws_id, browser_tx);

        tunnel
            .handle_client_message(ClientMessage::WsMessageBinary { ws_id })
            .await;
        tunnel
            .handle_client_message(ClientMessage::HttpResponseBinary {
                request_id,
                status: 200,
                headers: Headers::new(),
                body_size: 1,
            })
            .await;
        tunnel.handle_binary_frame(Bytes::from_static(b"x")).await;

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, PendingOutcome::Buffered { .. }));
        assert!(
            browser_rx.try_recv().is_err(),
            "binary frame should have gone to the HTTP slot, not the browser socket"
        );
    }

    #[tokio::test]
    async fn stream_chunk_announcement_then_frame_is_delivered_to_the_stream() {
        let tunnel = make_tunnel();
        let request_id = Uuid::new_v4();
        let mut events = tunnel.register_stream(request_id);

        tunnel
            .handle_client_message(ClientMessage::HttpResponseStreamChunk { request_id, chunk_size: 2 })
            .await;
        tunnel.handle_binary_frame(Bytes::from_static(b"ok")).await;

        match events.recv().await.unwrap() {
            StreamEvent::Chunk(data) => assert_eq!(data, Bytes::from_static(b"ok")),
            other => panic!("unexpected stream event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_rejects_pending_request_and_aborts_stream() {
        let tunnel = make_tunnel();
        let request_id = Uuid::new_v4();
        let rx = tunnel.begin_request(request_id);
        let mut events = tunnel.register_stream(Uuid::new_v4());

        tunnel.teardown("tunnel disconnected").await;

        assert!(matches!(rx.await.unwrap(), PendingOutcome::Disconnected));
        assert!(matches!(events.recv().await.unwrap(), StreamEvent::Error(reason) if reason == "tunnel disconnected"));
        assert_eq!(tunnel.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let tunnel = make_tunnel();
        tunnel.teardown("first").await;
        tunnel.teardown("second").await;
    }

    #[tokio::test]
    async fn ws_close_removes_the_browser_socket_and_forwards_the_command() {
        let tunnel = make_tunnel();
        let ws_id = Uuid::new_v4();
        let (browser_tx, mut browser_rx) = mpsc::unbounded_channel::<BrowserCommand>();
        tunnel.register_browser_socket(ws_id, browser_tx);

        tunnel
            .handle_client_message(ClientMessage::WsClose { ws_id, code: Some(1000), reason: Some("bye".to_string()) })
            .await;

        match browser_rx.recv().await.unwrap() {
            BrowserCommand::Close { code, reason } => {
                assert_eq!(code, 1000);
                assert_eq!(reason, "bye");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
