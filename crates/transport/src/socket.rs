//! One physical WebSocket connection.
//!
//! A [`Socket`] owns the three pump tasks (read, write, keepalive) for a
//! single connection. Shared state (the pending-ack table, the handler
//! registry, and the RPC callback slot) outlives socket generations and is
//! handed in by the transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::warn;

use happy_protocol::Credential;
use happy_protocol::constants::EVENT_RPC_RESPONSE;
use happy_protocol::frame::Frame;
use happy_protocol::messages::RpcRequestPayload;

use crate::acks::PendingAcks;
use crate::error::SocketError;
use crate::handlers::HandlerRegistry;

/// Callback invoked for every inbound `rpc-request` frame. The handler is
/// spawned as its own task; the [`RpcResponder`] posts the reply.
pub type RpcRequestHandler = Arc<
    dyn Fn(RpcRequestPayload, RpcResponder) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// The single RPC callback slot of a transport.
pub(crate) type RpcSlot = Mutex<Option<RpcRequestHandler>>;

/// Invoked by the read pump when the connection dies, with the close code
/// if the peer sent one.
pub(crate) type CloseCallback = Arc<dyn Fn(Option<u16>) + Send + Sync>;

/// Posts the response to one `rpc-request` back over the wire.
pub struct RpcResponder {
    ack_id: String,
    write_tx: mpsc::Sender<tungstenite::Message>,
}

impl RpcResponder {
    pub(crate) fn new(ack_id: String, write_tx: mpsc::Sender<tungstenite::Message>) -> Self {
        Self { ack_id, write_tx }
    }

    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    /// Sends `{event:"rpc-response", ackId, ack}`. Best-effort: a dead
    /// socket drops the response (the server will time the request out).
    pub async fn respond<T: serde::Serialize>(self, ack: &T) {
        let json = Frame::ack_reply(EVENT_RPC_RESPONSE, &self.ack_id, ack)
            .and_then(|frame| serde_json::to_string(&frame));
        match json {
            Ok(text) => {
                let _ = self
                    .write_tx
                    .send(tungstenite::Message::Text(text.into()))
                    .await;
            }
            Err(e) => warn!(ack_id = %self.ack_id, error = %e, "failed to encode rpc response"),
        }
    }
}

/// Shared state the pumps feed.
pub(crate) struct SocketShared {
    pub(crate) pending: Arc<PendingAcks>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) rpc_slot: Arc<RpcSlot>,
    pub(crate) on_close: CloseCallback,
}

pub(crate) struct Socket {
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: tokio_util::sync::CancellationToken,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
    keepalive_handle: tokio::task::JoinHandle<()>,
}

impl Socket {
    /// Dials the server and starts the pumps. The handshake carries the
    /// credential in headers only.
    pub(crate) async fn connect(
        url: &str,
        credential: &Credential,
        correlation_id: Option<&str>,
        shared: SocketShared,
    ) -> Result<Self, SocketError> {
        let request = build_request(url, credential, correlation_id)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let cancel = tokio_util::sync::CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };
        let read_handle = {
            let cancel = cancel.clone();
            let write_tx = write_tx.clone();
            tokio::spawn(crate::pumps::read::read_pump(read, shared, write_tx, cancel))
        };
        let keepalive_handle = {
            let cancel = cancel.clone();
            let write_tx = write_tx.clone();
            tokio::spawn(crate::pumps::keepalive::keepalive_pump(write_tx, cancel))
        };

        Ok(Self {
            write_tx,
            cancel,
            read_handle,
            write_handle,
            keepalive_handle,
        })
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<tungstenite::Message> {
        self.write_tx.clone()
    }

    /// Stops the pumps; the write pump sends a close frame on its way out.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.keepalive_handle.abort();
    }
}

/// Builds the handshake request: URL without credentials, identity in
/// headers. Optional headers are omitted entirely when absent.
pub(crate) fn build_request(
    url: &str,
    credential: &Credential,
    correlation_id: Option<&str>,
) -> Result<tungstenite::handshake::client::Request, SocketError> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();

    let bearer = format!("Bearer {}", credential.token);
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&bearer)
            .map_err(|_| SocketError::Handshake("token is not header-safe".into()))?,
    );
    headers.insert(
        "X-Client-Type",
        HeaderValue::from_static(credential.client_type.as_str()),
    );
    if let Some(sid) = &credential.session_id {
        headers.insert(
            "X-Session-Id",
            HeaderValue::from_str(sid)
                .map_err(|_| SocketError::Handshake("session id is not header-safe".into()))?,
        );
    }
    if let Some(mid) = &credential.machine_id {
        headers.insert(
            "X-Machine-Id",
            HeaderValue::from_str(mid)
                .map_err(|_| SocketError::Handshake("machine id is not header-safe".into()))?,
        );
    }
    if let Some(cid) = correlation_id {
        headers.insert(
            "X-Correlation-ID",
            HeaderValue::from_str(cid)
                .map_err(|_| SocketError::Handshake("correlation id is not header-safe".into()))?,
        );
    }
    Ok(request)
}
