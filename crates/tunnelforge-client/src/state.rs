//! Client-side shared state: the outbound control-channel queue, the table of
//! locally-bridged WebSockets, and the WS binary announcement slot (§4.5,
//! §4.6). Mirrors the server's `Tunnel` in spirit but scoped to what the
//! client side needs.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use tunnelforge_core::events::EventSender;
use tunnelforge_core::protocol::ClientMessage;

/// Command queue feeding the task that owns a locally-bridged WebSocket
/// (browser-initiated passthrough, client side of §4.5).
#[derive(Debug)]
pub enum LocalWsCommand {
    Forward(tokio_tungstenite::tungstenite::Message),
    Close { code: u16, reason: String },
}

/// What the single writer task drains from the outbound queue. `Paired`
/// keeps an announcement and its binary payload atomic on the wire, so no
/// other sender can interleave a frame between them (mirrors the server's
/// `OutboundCommand::WsBinary`).
#[derive(Debug)]
pub enum OutboundCommand {
    Message(ClientMessage),
    Paired(ClientMessage, Bytes),
}

pub struct ClientState {
    pub local_port: u16,
    pub outbound: mpsc::UnboundedSender<OutboundCommand>,
    pub active_ws: RwLock<HashMap<Uuid, mpsc::UnboundedSender<LocalWsCommand>>>,
    pub ws_binary_slot: Mutex<Option<Uuid>>,
    pub http_client: reqwest::Client,
    pub events: EventSender,
}

impl ClientState {
    pub fn new(local_port: u16, outbound: mpsc::UnboundedSender<OutboundCommand>, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            local_port,
            outbound,
            active_ws: RwLock::new(HashMap::new()),
            ws_binary_slot: Mutex::new(None),
            http_client: reqwest::Client::new(),
            events,
        })
    }

    pub fn send(&self, message: ClientMessage) {
        let _ = self.outbound.send(OutboundCommand::Message(message));
    }

    pub fn send_paired(&self, message: ClientMessage, body: Bytes) {
        let _ = self.outbound.send(OutboundCommand::Paired(message, body));
    }

    pub async fn register_ws(&self, ws_id: Uuid, sender: mpsc::UnboundedSender<LocalWsCommand>) {
        self.active_ws.write().await.insert(ws_id, sender);
    }

    pub async fn remove_ws(&self, ws_id: &Uuid) {
        self.active_ws.write().await.remove(ws_id);
    }
}
