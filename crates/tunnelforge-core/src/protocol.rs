//! The control-channel wire protocol.
//!
//! The control channel carries two interleaved kinds of frames: text frames
//! that are UTF-8 JSON objects with a `type` discriminator (below), and
//! binary frames that carry opaque bytes belonging to whichever text frame
//! most recently announced a binary follow-up (`http_response_binary`,
//! `http_response_stream_chunk`, `ws_message_binary`). Exactly one binary
//! frame follows each such announcement; the codec itself never multiplexes
//! inside that window (see `BinarySlot`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Case-preserved header snapshot. Keys are the original header names as seen
/// on the wire; order is not significant but a `BTreeMap` gives a canonical
/// encoding, which keeps round-trip tests simple.
pub type Headers = BTreeMap<String, String>;

/// Messages sent from the tunnel server to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        subdomain: String,
    },
    HttpRequest {
        request_id: Uuid,
        method: String,
        path: String,
        headers: Headers,
        /// Present (possibly empty) for methods with a body; absent for GET/HEAD.
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    RequestTiming {
        request_id: Uuid,
        /// Milliseconds, server-measured.
        duration: u64,
    },
    Ping,
    Error {
        message: String,
    },
    WsOpen {
        ws_id: Uuid,
        path: String,
        headers: Headers,
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    WsMessage {
        ws_id: Uuid,
        data: String,
    },
    WsMessageBinary {
        ws_id: Uuid,
    },
    WsClose {
        ws_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Messages sent from the client back to the tunnel server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    HttpResponse {
        request_id: Uuid,
        status: u16,
        headers: Headers,
        body: String,
    },
    HttpResponseBinary {
        request_id: Uuid,
        status: u16,
        headers: Headers,
        /// Advisory; the actual following binary frame's length prevails.
        body_size: u64,
    },
    HttpResponseStreamStart {
        request_id: Uuid,
        status: u16,
        headers: Headers,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_size: Option<u64>,
    },
    HttpResponseStreamChunk {
        request_id: Uuid,
        chunk_size: u64,
    },
    HttpResponseStreamEnd {
        request_id: Uuid,
    },
    HttpResponseStreamError {
        request_id: Uuid,
        error: String,
    },
    Pong,
    WsOpened {
        ws_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    WsError {
        ws_id: Uuid,
        error: String,
    },
    WsMessage {
        ws_id: Uuid,
        data: String,
    },
    WsMessageBinary {
        ws_id: Uuid,
    },
    WsClose {
        ws_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}

impl ClientMessage {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("ClientMessage always serializes")
    }
}

/// Decode a text frame. Unknown `type` values and malformed JSON are the
/// caller's responsibility to log-and-drop (§4.1); this just reports them as
/// an error rather than panicking.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn decode_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Tracks which destination the next binary frame on the HTTP side of a
/// tunnel belongs to. At most one of these is ever occupied per tunnel; the
/// receiver consults it in this order before falling back to the separate WS
/// slot (see `WsBinarySlot`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpBinarySlot {
    Idle,
    /// Awaiting the body for a pending `http_response_binary` header.
    Header {
        request_id: Uuid,
        status: u16,
        headers: Headers,
    },
    /// Awaiting the chunk for a pending `http_response_stream_chunk` header.
    Chunk { request_id: Uuid, chunk_size: u64 },
}

impl Default for HttpBinarySlot {
    fn default() -> Self {
        HttpBinarySlot::Idle
    }
}

impl HttpBinarySlot {
    pub fn is_idle(&self) -> bool {
        matches!(self, HttpBinarySlot::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_headers() -> Headers {
        let mut h = Headers::new();
        h.insert("content-type".to_string(), "text/plain".to_string());
        h
    }

    #[test]
    fn http_request_round_trips() {
        let msg = ServerMessage::HttpRequest {
            request_id: Uuid::nil(),
            method: "GET".to_string(),
            path: "/index.html".to_string(),
            headers: sample_headers(),
            body: None,
        };
        let encoded = msg.encode();
        let decoded = decode_server_message(&encoded).unwrap();
        match decoded {
            ServerMessage::HttpRequest { method, path, .. } => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/index.html");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn http_request_omits_body_when_none() {
        let msg = ServerMessage::HttpRequest {
            request_id: Uuid::nil(),
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: Headers::new(),
            body: None,
        };
        assert!(!msg.encode().contains("\"body\""));
    }

    #[test]
    fn response_binary_round_trips() {
        let msg = ClientMessage::HttpResponseBinary {
            request_id: Uuid::nil(),
            status: 200,
            headers: sample_headers(),
            body_size: 4096,
        };
        let encoded = msg.encode();
        let decoded = decode_client_message(&encoded).unwrap();
        match decoded {
            ClientMessage::HttpResponseBinary {
                status, body_size, ..
            } => {
                assert_eq!(status, 200);
                assert_eq!(body_size, 4096);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected_not_panicked() {
        let err = decode_client_message(r#"{"type":"something_new"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn malformed_json_is_rejected_not_panicked() {
        let err = decode_server_message("{not json");
        assert!(err.is_err());
    }

    #[test]
    fn type_discriminant_is_snake_case() {
        let msg = ClientMessage::Pong;
        assert_eq!(msg.encode(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn http_binary_slot_defaults_idle() {
        assert!(HttpBinarySlot::default().is_idle());
    }
}
