//! Read pump — parses inbound frames and routes them.
//!
//! Three inbound frame families:
//! - acknowledgements (`ackId` + `ack`) resolve the pending-ack table
//! - `rpc-request` frames with an `ackId` go to the RPC callback slot
//! - everything else is dispatched to the event handler registry
//!
//! A read deadline doubles as liveness detection: any inbound traffic
//! resets it; silence beyond the deadline kills the connection.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use happy_protocol::constants::{EVENT_RPC_REQUEST, WS_PONG_WAIT};
use happy_protocol::frame::Frame;
use happy_protocol::messages::RpcRequestPayload;

use crate::socket::{RpcResponder, SocketShared};

pub(crate) async fn read_pump<S>(
    mut read: S,
    shared: SocketShared,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let mut close_code: Option<u16> = None;
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Manual close; report the clean-close code.
                close_code = Some(1000);
                break;
            }

            () = &mut deadline => {
                warn!("no inbound traffic within read deadline, connection dead");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text(&text, &shared, &write_tx).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                close_code = frame.map(|f| u16::from(f.code));
                                debug!(code = ?close_code, "close frame received");
                                break;
                            }
                            _ => {} // Binary frames are not part of the protocol.
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    (shared.on_close)(close_code);
}

async fn handle_text(
    text: &str,
    shared: &SocketShared,
    write_tx: &mpsc::Sender<tungstenite::Message>,
) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("failed to parse frame: {e}");
            return;
        }
    };

    if frame.is_ack() {
        let Some(ack_id) = frame.ack_id.as_deref() else {
            return;
        };
        let value = frame
            .parse_ack::<serde_json::Value>()
            .ok()
            .flatten()
            .unwrap_or(serde_json::Value::Null);
        if !shared.pending.resolve(ack_id, value) {
            debug!(ack_id, "ack without a pending entry, dropped");
        }
        return;
    }

    if frame.event == EVENT_RPC_REQUEST {
        let Some(ack_id) = frame.ack_id.clone() else {
            warn!("rpc-request without ackId, dropped");
            return;
        };
        let request: RpcRequestPayload = match frame.parse_data() {
            Ok(Some(req)) => req,
            Ok(None) => {
                warn!(ack_id, "rpc-request without data, dropped");
                return;
            }
            Err(e) => {
                warn!(ack_id, "malformed rpc-request: {e}");
                return;
            }
        };
        let handler = shared
            .rpc_slot
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        match handler {
            Some(handler) => {
                trace!(method = %request.method, ack_id, "dispatching rpc request");
                let responder = RpcResponder::new(ack_id, write_tx.clone());
                tokio::spawn(handler(request, responder));
            }
            None => warn!(method = %request.method, "no rpc handler installed, request dropped"),
        }
        return;
    }

    let data = frame
        .parse_data::<serde_json::Value>()
        .ok()
        .flatten()
        .unwrap_or(serde_json::Value::Null);
    trace!(event = %frame.event, "event frame");
    shared.registry.dispatch(&frame.event, data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acks::PendingAcks;
    use crate::handlers::{EventCallback, HandlerRegistry};
    use crate::socket::RpcSlot;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn shared_with(
        on_close: Arc<dyn Fn(Option<u16>) + Send + Sync>,
    ) -> (SocketShared, Arc<PendingAcks>, Arc<HandlerRegistry>, Arc<RpcSlot>) {
        let pending = Arc::new(PendingAcks::new());
        let registry = Arc::new(HandlerRegistry::new());
        let rpc_slot: Arc<RpcSlot> = Arc::new(Mutex::new(None));
        let shared = SocketShared {
            pending: pending.clone(),
            registry: registry.clone(),
            rpc_slot: rpc_slot.clone(),
            on_close,
        };
        (shared, pending, registry, rpc_slot)
    }

    fn noop_close() -> Arc<dyn Fn(Option<u16>) + Send + Sync> {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn ack_frame_resolves_pending_entry() {
        let (shared, pending, _reg, _slot) = shared_with(noop_close());
        let (tx, rx) = oneshot::channel();
        pending.insert("a1", tx);

        let (write_tx, _write_rx) = mpsc::channel(16);
        let text = r#"{"event":"rpc-response","ackId":"a1","ack":{"ok":1}}"#;
        handle_text(text, &shared, &write_tx).await;

        assert_eq!(rx.await.unwrap(), serde_json::json!({"ok": 1}));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn rpc_request_routes_to_slot() {
        let (shared, _pending, _reg, slot) = shared_with(noop_close());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        *slot.lock().unwrap() = Some(Arc::new(move |req: RpcRequestPayload, responder: crate::socket::RpcResponder| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().unwrap().push((req.method, responder.ack_id().to_string()));
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        }) as crate::socket::RpcRequestHandler);

        let (write_tx, _write_rx) = mpsc::channel(16);
        let text = r#"{"event":"rpc-request","ackId":"a7","data":{"method":"abc:foo","params":"cc=="}}"#;
        handle_text(text, &shared, &write_tx).await;
        tokio::task::yield_now().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "abc:foo");
        assert_eq!(seen[0].1, "a7");
    }

    #[tokio::test]
    async fn event_frame_dispatches_to_registry() {
        let (shared, _pending, registry, _slot) = shared_with(noop_close());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb: Arc<EventCallback> = Arc::new(move |v| {
            assert_eq!(v["body"]["t"], "delete-session");
            h.fetch_add(1, Ordering::SeqCst);
        });
        registry.on("update", &cb);

        let (write_tx, _write_rx) = mpsc::channel(16);
        let text = r#"{"event":"update","data":{"body":{"t":"delete-session","sid":"s"}}}"#;
        handle_text(text, &shared, &write_tx).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_ignored() {
        let (shared, _pending, _reg, _slot) = shared_with(noop_close());
        let (write_tx, _write_rx) = mpsc::channel(16);
        handle_text("{{{ nope", &shared, &write_tx).await;
    }

    #[tokio::test]
    async fn stream_end_reports_no_close_code() {
        let code = Arc::new(Mutex::new(Some(Some(9999u16))));
        let c = code.clone();
        let (shared, _p, _r, _s) = shared_with(Arc::new(move |close| {
            *c.lock().unwrap() = Some(close);
        }));

        let (write_tx, _write_rx) = mpsc::channel(16);
        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();
        read_pump(empty, shared, write_tx, CancellationToken::new()).await;

        assert_eq!(*code.lock().unwrap(), Some(None));
    }

    #[tokio::test]
    async fn close_frame_code_is_propagated() {
        let code = Arc::new(Mutex::new(None));
        let c = code.clone();
        let (shared, _p, _r, _s) = shared_with(Arc::new(move |close| {
            *c.lock().unwrap() = close;
        }));

        let close_frame = tungstenite::protocol::CloseFrame {
            code: tungstenite::protocol::frame::coding::CloseCode::from(4000u16),
            reason: "".into(),
        };
        let items = vec![Ok(tungstenite::Message::Close(Some(close_frame)))];
        let (write_tx, _write_rx) = mpsc::channel(16);
        read_pump(
            stream::iter(items),
            shared,
            write_tx,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(*code.lock().unwrap(), Some(4000));
    }

    #[tokio::test]
    async fn silence_past_deadline_kills_connection() {
        tokio::time::pause();
        let closed = Arc::new(Mutex::new(false));
        let flag = closed.clone();
        let (shared, _p, _r, _s) = shared_with(Arc::new(move |_| {
            *flag.lock().unwrap() = true;
        }));

        let (write_tx, _write_rx) = mpsc::channel(16);
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();
        read_pump(silent, shared, write_tx, CancellationToken::new()).await;

        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn inbound_ping_answers_with_pong() {
        let (shared, _p, _r, _s) = shared_with(noop_close());
        let (write_tx, mut write_rx) = mpsc::channel(16);
        let items = vec![Ok(tungstenite::Message::Ping(vec![1].into()))];
        read_pump(
            stream::iter(items),
            shared,
            write_tx,
            CancellationToken::new(),
        )
        .await;

        let reply = write_rx.recv().await;
        assert!(matches!(reply, Some(tungstenite::Message::Pong(_))));
    }
}
