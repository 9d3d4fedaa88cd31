//! Connection establishment and the reconnect loop.
//!
//! The shared [`TransportCtx`] bundles the state the dial path, the close
//! callback, and the reconnect loop all touch, so free functions can run
//! from spawned tasks without threading a dozen Arc parameters.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use happy_protocol::Credential;
use happy_protocol::constants::{
    EVENT_CONNECT, EVENT_DISCONNECT, EVENT_RECONNECT_ATTEMPT, EVENT_RECONNECT_FAILED,
    close_reason,
};

use crate::acks::PendingAcks;
use crate::config::ReconnectConfig;
use crate::error::SocketError;
use crate::handlers::HandlerRegistry;
use crate::metrics::TransportCounters;
use crate::socket::{RpcSlot, Socket, SocketShared};
use crate::transport::ConnectionState;

/// Shared state behind one transport endpoint.
#[derive(Clone)]
pub(crate) struct TransportCtx {
    pub(crate) url: String,
    pub(crate) credential: Credential,
    pub(crate) correlation_id: Option<String>,
    pub(crate) connect_timeout: Duration,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) pending: Arc<PendingAcks>,
    pub(crate) rpc_slot: Arc<RpcSlot>,
    pub(crate) counters: Arc<TransportCounters>,
    pub(crate) state: Arc<Mutex<ConnectionState>>,
    pub(crate) socket: Arc<Mutex<Option<Socket>>>,
    /// Socket generation; a close callback from a superseded socket is stale
    /// and must not touch shared state.
    pub(crate) socket_gen: Arc<AtomicU64>,
    pub(crate) manual_close: Arc<AtomicBool>,
    pub(crate) reconnect_attempts: Arc<AtomicU32>,
    pub(crate) reconnect_cancel: Arc<Mutex<Option<CancellationToken>>>,
    pub(crate) disconnect_warned: Arc<AtomicBool>,
}

pub(crate) fn set_state(ctx: &TransportCtx, state: ConnectionState) {
    if let Ok(mut guard) = ctx.state.lock() {
        *guard = state;
    }
}

pub(crate) fn cancel_reconnect(slot: &Mutex<Option<CancellationToken>>) {
    if let Ok(mut guard) = slot.lock()
        && let Some(token) = guard.take()
    {
        token.cancel();
    }
}

/// Dials the server once. On success the socket is installed, the attempt
/// counter resets, and `connect` is dispatched to local handlers.
pub(crate) async fn dial(ctx: &TransportCtx) -> Result<(), SocketError> {
    set_state(ctx, ConnectionState::Connecting);
    let generation = ctx.socket_gen.fetch_add(1, Ordering::SeqCst) + 1;

    let shared = SocketShared {
        pending: ctx.pending.clone(),
        registry: ctx.registry.clone(),
        rpc_slot: ctx.rpc_slot.clone(),
        on_close: close_callback(ctx.clone(), generation),
    };

    let connect = Socket::connect(
        &ctx.url,
        &ctx.credential,
        ctx.correlation_id.as_deref(),
        shared,
    );
    let socket = match tokio::time::timeout(ctx.connect_timeout, connect).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            set_state(ctx, ConnectionState::Closed);
            return Err(e);
        }
        Err(_) => {
            set_state(ctx, ConnectionState::Closed);
            return Err(SocketError::ConnectTimeout);
        }
    };

    // A competing dial may have superseded this one while the handshake was
    // in flight; the newest generation owns the slot.
    if ctx.socket_gen.load(Ordering::SeqCst) != generation {
        socket.close();
        return Err(SocketError::Disconnected);
    }
    if let Ok(mut slot) = ctx.socket.lock() {
        *slot = Some(socket);
    }
    ctx.reconnect_attempts.store(0, Ordering::SeqCst);
    ctx.disconnect_warned.store(false, Ordering::SeqCst);
    set_state(ctx, ConnectionState::Open);
    info!(url = %ctx.url, "connected");
    ctx.registry.dispatch(EVENT_CONNECT, serde_json::Value::Null);
    Ok(())
}

/// Builds the close callback for one socket generation. Handles shared-state
/// teardown, the single per-episode warning, and the `disconnect` event,
/// then schedules reconnection unless the close was manual.
fn close_callback(
    ctx: TransportCtx,
    generation: u64,
) -> Arc<dyn Fn(Option<u16>) + Send + Sync> {
    Arc::new(move |code| {
        if ctx.socket_gen.load(Ordering::SeqCst) != generation {
            debug!(generation, "stale socket closed, ignoring");
            return;
        }
        if let Ok(mut slot) = ctx.socket.lock() {
            *slot = None;
        }
        set_state(&ctx, ConnectionState::Closed);
        ctx.pending.reject_all();

        let reason = close_reason(code);
        if !ctx.disconnect_warned.swap(true, Ordering::SeqCst) {
            warn!(%reason, "disconnected from server");
        }
        ctx.registry
            .dispatch(EVENT_DISCONNECT, serde_json::Value::String(reason));

        if !ctx.manual_close.load(Ordering::SeqCst) {
            let cancel = CancellationToken::new();
            cancel_reconnect(&ctx.reconnect_cancel);
            if let Ok(mut guard) = ctx.reconnect_cancel.lock() {
                *guard = Some(cancel.clone());
            }
            tokio::spawn(reconnect_loop(ctx.clone(), cancel));
        }
    })
}

/// Schedules reconnection after a failed dial (the socket never opened, so
/// no close callback will fire).
pub(crate) fn schedule_reconnect(ctx: &TransportCtx) {
    if ctx.manual_close.load(Ordering::SeqCst) {
        return;
    }
    let cancel = CancellationToken::new();
    cancel_reconnect(&ctx.reconnect_cancel);
    if let Ok(mut guard) = ctx.reconnect_cancel.lock() {
        *guard = Some(cancel.clone());
    }
    tokio::spawn(reconnect_loop(ctx.clone(), cancel));
}

/// Reconnection loop with exponential backoff and centered jitter.
pub(crate) async fn reconnect_loop(ctx: TransportCtx, cancel: CancellationToken) {
    loop {
        let attempt = ctx.reconnect_attempts.load(Ordering::SeqCst);
        if let Some(max) = ctx.reconnect.max_attempts
            && attempt >= max
        {
            warn!(attempt, "reconnection attempts exhausted");
            set_state(&ctx, ConnectionState::Closed);
            ctx.registry
                .dispatch(EVENT_RECONNECT_FAILED, serde_json::Value::Null);
            break;
        }

        let delay = ctx.reconnect.delay_for_attempt(attempt);
        set_state(&ctx, ConnectionState::Reconnecting { attempt: attempt + 1 });
        info!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        if cancel.is_cancelled() {
            return;
        }

        ctx.reconnect_attempts.store(attempt + 1, Ordering::SeqCst);
        ctx.registry
            .dispatch(EVENT_RECONNECT_ATTEMPT, serde_json::json!(attempt + 1));

        match dial(&ctx).await {
            Ok(()) => break,
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed");
            }
        }

        if cancel.is_cancelled() {
            return;
        }
    }

    // Leave the slot alone if a newer loop owns it (ours was cancelled).
    if !cancel.is_cancelled()
        && let Ok(mut guard) = ctx.reconnect_cancel.lock()
    {
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reconnect_clears_and_cancels() {
        let slot = Mutex::new(None);
        let token = CancellationToken::new();
        *slot.lock().unwrap() = Some(token.clone());

        cancel_reconnect(&slot);

        assert!(slot.lock().unwrap().is_none());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_reconnect_on_empty_slot_is_noop() {
        let slot: Mutex<Option<CancellationToken>> = Mutex::new(None);
        cancel_reconnect(&slot);
        assert!(slot.lock().unwrap().is_none());
    }
}
