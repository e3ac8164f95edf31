use thiserror::Error;

/// Errors surfaced by the tunnel server: the public-facing side of the control channel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel not found: {0}")]
    NotFound(String),

    #[error("tunnel disconnected")]
    Disconnected,

    #[error("request timed out")]
    Timeout,

    #[error("bad subdomain format: {0}")]
    BadSubdomain(String),

    #[error("subdomain already in use: {0}")]
    SubdomainTaken(String),

    #[error("invalid api key")]
    BadApiKey,

    #[error("stream error: {0}")]
    Stream(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors surfaced by the tunnel client: the side holding the control connection
/// open from an untrusted network and forwarding to the loopback app.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("control connection closed: {0}")]
    ConnectionClosed(String),

    #[error("failed to reach loopback server: {0}")]
    LoopbackUnreachable(String),

    #[error("failed to open local websocket: {0}")]
    WsUnreachable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
