use tokio_tungstenite::tungstenite;

/// Errors from the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Send attempted on a closed socket, or the socket closed while an
    /// acknowledgement was pending.
    #[error("socket is not connected")]
    Disconnected,

    /// The acknowledgement did not arrive within the timeout.
    #[error("acknowledgement timed out")]
    AckTimeout,

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A credential or correlation id could not be encoded as a header.
    #[error("invalid handshake header: {0}")]
    Handshake(String),
}
