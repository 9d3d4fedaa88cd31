//! The transport facade: one persistent WebSocket per endpoint.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite;
use tracing::trace;
use uuid::Uuid;

use happy_protocol::Credential;
use happy_protocol::constants::{EVENT_DISCONNECT, close_reason};
use happy_protocol::frame::Frame;

use crate::acks::PendingAcks;
use crate::config::{TransportConfig, websocket_url};
use crate::error::SocketError;
use crate::handlers::{EventCallback, HandlerRegistry};
use crate::metrics::{TransportCounters, TransportMetrics};
use crate::reconnect::{self, TransportCtx};
use crate::socket::RpcRequestHandler;

/// Lifecycle of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Reconnecting { attempt: u32 },
}

/// One persistent WebSocket endpoint with reconnection, a bounded handler
/// registry, and request/response acknowledgements.
pub struct Transport {
    ctx: TransportCtx,
    ack_timeout: Duration,
    flush_delay: Duration,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Transport {
    pub fn new(config: TransportConfig, credential: Credential) -> Result<Self, SocketError> {
        let url = websocket_url(&config.base_url, &config.path)?;
        let ctx = TransportCtx {
            url,
            credential,
            correlation_id: config.correlation_id.clone(),
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect.clone(),
            registry: Arc::new(HandlerRegistry::new()),
            pending: Arc::new(PendingAcks::new()),
            rpc_slot: Arc::new(Mutex::new(None)),
            counters: Arc::new(TransportCounters::default()),
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            socket: Arc::new(Mutex::new(None)),
            socket_gen: Arc::new(AtomicU64::new(0)),
            manual_close: Arc::new(AtomicBool::new(false)),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
            reconnect_cancel: Arc::new(Mutex::new(None)),
            disconnect_warned: Arc::new(AtomicBool::new(false)),
        };
        Ok(Self {
            ctx,
            ack_timeout: config.ack_timeout,
            flush_delay: config.flush_delay,
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Connects to the server. Idempotent: concurrent callers coalesce on
    /// the in-flight attempt, and a connected transport returns immediately.
    /// A failed dial enters the reconnect schedule before returning the
    /// error.
    pub async fn connect(&self) -> Result<(), SocketError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.ctx.manual_close.store(false, Ordering::SeqCst);
        reconnect::cancel_reconnect(&self.ctx.reconnect_cancel);

        match reconnect::dial(&self.ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                reconnect::schedule_reconnect(&self.ctx);
                Err(e)
            }
        }
    }

    /// Tears the connection down and stops reconnection. Local handlers see
    /// one final `disconnect` with the clean-close reason.
    pub async fn close(&self) {
        self.ctx.manual_close.store(true, Ordering::SeqCst);
        reconnect::cancel_reconnect(&self.ctx.reconnect_cancel);
        reconnect::set_state(&self.ctx, ConnectionState::Closing);

        // Bump the generation first so the socket's own close callback is
        // stale by the time the pumps unwind.
        self.ctx.socket_gen.fetch_add(1, Ordering::SeqCst);
        let socket = self.ctx.socket.lock().ok().and_then(|mut s| s.take());
        if let Some(socket) = socket {
            socket.close();
        }
        self.ctx.pending.reject_all();
        reconnect::set_state(&self.ctx, ConnectionState::Closed);
        self.ctx.registry.dispatch(
            EVENT_DISCONNECT,
            serde_json::Value::String(close_reason(Some(1000))),
        );
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx
            .state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    // -----------------------------------------------------------------------
    // Emits
    // -----------------------------------------------------------------------

    /// Sends `{event, data}`. Fails with [`SocketError::Disconnected`] when
    /// the socket is not open.
    pub async fn emit<T: serde::Serialize>(
        &self,
        event: &str,
        data: &T,
    ) -> Result<(), SocketError> {
        let tx = self.connected_sender().ok_or(SocketError::Disconnected)?;
        let frame = Frame::event(event, Some(data))?;
        let json = serde_json::to_string(&frame)?;
        tx.send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| SocketError::Disconnected)
    }

    /// Like [`emit`](Self::emit) but silently drops when disconnected.
    pub async fn emit_volatile<T: serde::Serialize>(
        &self,
        event: &str,
        data: &T,
    ) -> Result<(), SocketError> {
        let Some(tx) = self.connected_sender() else {
            trace!(event, "volatile emit dropped while disconnected");
            return Ok(());
        };
        let frame = Frame::event(event, Some(data))?;
        let json = serde_json::to_string(&frame)?;
        let _ = tx.send(tungstenite::Message::Text(json.into())).await;
        Ok(())
    }

    /// Sends `{event, data, ackId}` and waits for the matching ack.
    pub async fn emit_with_ack<T: serde::Serialize>(
        &self,
        event: &str,
        data: &T,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, SocketError> {
        let tx = self.connected_sender().ok_or(SocketError::Disconnected)?;
        let ack_id = Uuid::new_v4().to_string();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.ctx.pending.insert(&ack_id, ack_tx);

        let frame = Frame::with_ack_id(event, Some(data), &ack_id)?;
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                self.ctx.pending.remove(&ack_id);
                return Err(e.into());
            }
        };
        if tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.ctx.pending.remove(&ack_id);
            return Err(SocketError::Disconnected);
        }

        let wait = timeout.unwrap_or(self.ack_timeout);
        match tokio::time::timeout(wait, ack_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                // Sender dropped: the socket closed and rejected the entry.
                self.ctx.pending.remove(&ack_id);
                Err(SocketError::Disconnected)
            }
            Err(_) => {
                // Remove the entry before reporting the timeout.
                self.ctx.pending.remove(&ack_id);
                Err(SocketError::AckTimeout)
            }
        }
    }

    /// Yields briefly so queued frames drain.
    pub async fn flush(&self) {
        tokio::time::sleep(self.flush_delay).await;
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    /// Registers an event callback. The registry holds it weakly: keep the
    /// `Arc` alive for as long as the subscription should last. Returns
    /// `false` when the per-event handler limit rejected the registration.
    pub fn on(&self, event: &str, callback: &Arc<EventCallback>) -> bool {
        self.ctx.registry.on(event, callback)
    }

    /// Removes a callback by identity.
    pub fn off(&self, event: &str, callback: &Arc<EventCallback>) {
        self.ctx.registry.off(event, callback)
    }

    /// Removes handlers for one event, or all handlers.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        self.ctx.registry.remove_all(event)
    }

    /// Dispatches an event to local handlers without touching the wire.
    pub fn emit_local(&self, event: &str, data: serde_json::Value) {
        self.ctx.registry.dispatch(event, data)
    }

    /// Installs the single RPC request callback.
    pub fn set_rpc_handler(&self, handler: RpcRequestHandler) {
        if let Ok(mut slot) = self.ctx.rpc_slot.lock() {
            *slot = Some(handler);
        }
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    pub fn metrics(&self) -> TransportMetrics {
        TransportMetrics {
            live_handlers: self.ctx.registry.live_handlers(),
            event_types: self.ctx.registry.event_types(),
            pending_acks: self.ctx.pending.len(),
            memory_pressure_count: self.ctx.counters.memory_pressure_count(),
            acks_cleaned_total: self.ctx.pending.cleaned_total(),
            handlers_rejected_total: self.ctx.registry.rejected_total(),
        }
    }

    /// Reaps orphaned ack entries and dead handler slots.
    pub fn on_memory_pressure(&self) {
        self.ctx.counters.record_memory_pressure();
        let acks = self.ctx.pending.reap_orphans();
        let handlers = self.ctx.registry.reap();
        let oldest_ack_ms = self
            .ctx
            .pending
            .oldest_age()
            .map(|age| age.as_millis() as u64);
        trace!(acks, handlers, oldest_ack_ms, "memory pressure sweep");
    }

    fn connected_sender(&self) -> Option<tokio::sync::mpsc::Sender<tungstenite::Message>> {
        if !self.is_connected() {
            return None;
        }
        self.ctx
            .socket
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|s| s.sender()))
    }
}
