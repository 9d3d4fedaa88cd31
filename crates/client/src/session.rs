//! Session-scoped client: one per hosted agent session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use happy_crypto::EncryptionContext;
use happy_protocol::constants::{
    EVENT_CONNECT, EVENT_DISCONNECT, EVENT_EPHEMERAL, EVENT_MESSAGE, EVENT_RPC_CANCEL,
    EVENT_RPC_REGISTER, EVENT_SESSION_ALIVE, EVENT_UPDATE, EVENT_USAGE_REPORT,
    SESSION_KEEPALIVE_INTERVAL,
};
use happy_protocol::messages::{
    MessageEnvelope, RpcCancelPayload, RpcRegisterPayload, SessionAlivePayload,
    SessionMessagePayload, UpdateBody, UpdateEnvelope, UsageReportPayload,
};
use happy_protocol::types::Credential;
use happy_rpc::{RpcDispatcher, RpcHandlerFn};
use happy_sync::{Replicator, SyncMetrics, SyncScope};
use happy_transport::{EventCallback, SocketError, Transport, TransportConfig};

use crate::pricing::{self, RawUsage};
use crate::{ClientError, epoch_ms};

/// Wire key under which session usage reports are aggregated server-side.
const USAGE_REPORT_KEY: &str = "claude";

/// Keys applied from `kv-batch-update` pushes; everything else is logged
/// and ignored.
const KV_ALLOWLIST: [&str; 1] = ["contextNotificationsEnabled"];

pub struct SessionClientConfig {
    pub server_url: String,
    pub token: String,
    pub session_id: String,
    pub correlation_id: Option<String>,
}

/// The three message shapes a session sends.
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    /// Plain user text.
    UserText(String),
    /// Structured agent output.
    AgentOutput(serde_json::Value),
    /// Codex-style agent output.
    CodexOutput(serde_json::Value),
}

/// Session lifecycle events, sent encrypted under the message envelope.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Switch { mode: String },
    Message { message: serde_json::Value },
    PermissionModeChanged { mode: String },
    Ready,
}

impl SessionEvent {
    fn into_body(self, id: Option<String>) -> serde_json::Value {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        match self {
            SessionEvent::Switch { mode } => {
                serde_json::json!({"type": "switch", "mode": mode, "id": id})
            }
            SessionEvent::Message { message } => {
                serde_json::json!({"type": "message", "message": message, "id": id})
            }
            SessionEvent::PermissionModeChanged { mode } => {
                serde_json::json!({"type": "permission-mode-changed", "mode": mode, "id": id})
            }
            SessionEvent::Ready => serde_json::json!({"type": "ready", "id": id}),
        }
    }
}

type MessageCallback = Box<dyn Fn(serde_json::Value) + Send + Sync>;
type SessionDeletedCallback = Box<dyn Fn(String) + Send + Sync>;

struct InboundMessages {
    callback: Option<MessageCallback>,
    queue: VecDeque<serde_json::Value>,
}

/// Binds one transport, dispatcher, and replicator to a session scope.
pub struct SessionClient {
    sid: String,
    transport: Arc<Transport>,
    dispatcher: Arc<RpcDispatcher>,
    replicator: Arc<Replicator>,
    crypto: Arc<EncryptionContext>,
    inbound: Mutex<InboundMessages>,
    session_deleted: Mutex<Option<SessionDeletedCallback>>,
    context_notifications: AtomicBool,
    thinking: AtomicBool,
    mode: Mutex<String>,
    verbose_keepalive: bool,
    shutdown: CancellationToken,
    /// Owner side of the transport's weak handler registry.
    subscriptions: Mutex<Vec<Arc<EventCallback>>>,
}

impl SessionClient {
    pub fn new(
        config: SessionClientConfig,
        crypto: Arc<EncryptionContext>,
    ) -> Result<Arc<Self>, SocketError> {
        let credential = Credential::session(&config.token, &config.session_id);
        let mut transport_config = TransportConfig::new(&config.server_url);
        transport_config.correlation_id = config.correlation_id;
        let transport = Arc::new(Transport::new(transport_config, credential)?);

        let dispatcher = Arc::new(RpcDispatcher::new(&config.session_id, crypto.clone()));
        let replicator = Arc::new(Replicator::new(
            SyncScope::Session {
                sid: config.session_id.clone(),
            },
            transport.clone(),
            crypto.clone(),
            Arc::new(SyncMetrics::new()),
        ));

        let client = Arc::new(Self {
            sid: config.session_id,
            transport,
            dispatcher,
            replicator,
            crypto,
            inbound: Mutex::new(InboundMessages {
                callback: None,
                queue: VecDeque::new(),
            }),
            session_deleted: Mutex::new(None),
            context_notifications: AtomicBool::new(true),
            thinking: AtomicBool::new(false),
            mode: Mutex::new("default".into()),
            verbose_keepalive: std::env::var("DEBUG").is_ok(),
            shutdown: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
        });
        client.install_handlers();
        Ok(client)
    }

    pub fn session_id(&self) -> &str {
        &self.sid
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<RpcDispatcher> {
        &self.dispatcher
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub async fn connect(&self) -> Result<(), SocketError> {
        self.transport.connect().await
    }

    /// Stops the keepalive and closes the connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.transport.close().await;
    }

    /// Registers an RPC handler under this session's scope.
    pub fn register_rpc(&self, method: &str, handler: RpcHandlerFn) {
        self.dispatcher.register(method, handler);
    }

    // -----------------------------------------------------------------------
    // Outbound messages
    // -----------------------------------------------------------------------

    /// Encrypts and sends one message. Agent output carrying usage numbers
    /// additionally emits a normalized `usage-report`.
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<(), ClientError> {
        let (envelope, usage) = match message {
            OutgoingMessage::UserText(text) => (
                MessageEnvelope::from_cli(
                    "user",
                    serde_json::json!({"type": "text", "text": text}),
                ),
                None,
            ),
            OutgoingMessage::AgentOutput(data) => {
                let usage = extract_usage(&data);
                (
                    MessageEnvelope::from_cli(
                        "agent",
                        serde_json::json!({"type": "output", "data": data}),
                    ),
                    usage,
                )
            }
            OutgoingMessage::CodexOutput(data) => (
                MessageEnvelope::from_cli(
                    "agent",
                    serde_json::json!({"type": "codex", "data": data}),
                ),
                None,
            ),
        };

        self.send_envelope(&envelope).await?;

        if let Some((model, usage)) = usage {
            let (tokens, cost) = pricing::normalize(model.as_deref(), &usage);
            let report = UsageReportPayload {
                key: USAGE_REPORT_KEY.into(),
                session_id: self.sid.clone(),
                model,
                tokens,
                cost,
            };
            self.transport.emit(EVENT_USAGE_REPORT, &report).await?;
        }
        Ok(())
    }

    /// Sends a session lifecycle event. Pass `id` to correlate an upstream
    /// event; a fresh UUID is assigned otherwise.
    pub async fn send_session_event(
        &self,
        event: SessionEvent,
        id: Option<String>,
    ) -> Result<(), ClientError> {
        let body = event.into_body(id);
        let envelope =
            MessageEnvelope::from_cli("agent", serde_json::json!({"type": "event", "data": body}));
        self.send_envelope(&envelope).await
    }

    async fn send_envelope(&self, envelope: &MessageEnvelope) -> Result<(), ClientError> {
        let ciphertext = self.crypto.encrypt(envelope)?;
        let payload = SessionMessagePayload {
            sid: self.sid.clone(),
            message: ciphertext,
        };
        self.transport.emit(EVENT_MESSAGE, &payload).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Keepalive
    // -----------------------------------------------------------------------

    pub fn set_thinking(&self, thinking: bool) {
        self.thinking.store(thinking, Ordering::Relaxed);
    }

    pub fn set_mode(&self, mode: &str) {
        if let Ok(mut guard) = self.mode.lock() {
            *guard = mode.to_string();
        }
    }

    /// Starts the periodic `session-alive` task. Volatile: skipped while
    /// disconnected.
    pub fn start_keepalive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_KEEPALIVE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(client) = weak.upgrade() else { break };
                if client.shutdown.is_cancelled() {
                    break;
                }
                client.send_keepalive().await;
            }
        });
    }

    async fn send_keepalive(&self) {
        if !self.transport.is_connected() {
            if self.verbose_keepalive {
                trace!(sid = %self.sid, "keepalive skipped while disconnected");
            }
            return;
        }
        let payload = SessionAlivePayload {
            sid: self.sid.clone(),
            time: epoch_ms(),
            thinking: self.thinking.load(Ordering::Relaxed),
            mode: self
                .mode
                .lock()
                .map(|m| m.clone())
                .unwrap_or_else(|_| "default".into()),
        };
        if self.verbose_keepalive {
            trace!(sid = %self.sid, thinking = payload.thinking, "session keepalive");
        }
        let _ = self
            .transport
            .emit_volatile(EVENT_SESSION_ALIVE, &payload)
            .await;
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Installs the callback for decrypted inbound user messages, draining
    /// anything queued while no callback was set.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        let drained: Vec<serde_json::Value> = {
            let Ok(mut inbound) = self.inbound.lock() else {
                return;
            };
            let drained = inbound.queue.drain(..).collect();
            inbound.callback = Some(callback);
            drained
        };
        if let Ok(inbound) = self.inbound.lock()
            && let Some(cb) = inbound.callback.as_ref()
        {
            for message in drained {
                cb(message);
            }
        }
    }

    pub fn set_session_deleted_callback(&self, callback: SessionDeletedCallback) {
        if let Ok(mut slot) = self.session_deleted.lock() {
            *slot = Some(callback);
        }
    }

    /// Current value of the `contextNotificationsEnabled` server-side flag.
    pub fn context_notifications_enabled(&self) -> bool {
        self.context_notifications.load(Ordering::Relaxed)
    }

    fn install_handlers(self: &Arc<Self>) {
        let mut subscriptions = Vec::new();

        // Reconnect: announce RPC methods, then reconcile state.
        let weak = Arc::downgrade(self);
        let on_connect: Arc<EventCallback> = Arc::new(move |_| {
            let Some(client) = weak.upgrade() else { return };
            client.replicator.metrics().on_reconnect();
            tokio::spawn(async move {
                client.register_rpc_methods().await;
                client.replicator.reconcile().await;
            });
        });
        self.transport.on(EVENT_CONNECT, &on_connect);
        subscriptions.push(on_connect);

        let weak = Arc::downgrade(self);
        let on_disconnect: Arc<EventCallback> = Arc::new(move |_| {
            let Some(client) = weak.upgrade() else { return };
            client.dispatcher.cancel_all_pending_requests();
            client.replicator.metrics().on_disconnect();
        });
        self.transport.on(EVENT_DISCONNECT, &on_disconnect);
        subscriptions.push(on_disconnect);

        let weak = Arc::downgrade(self);
        let on_update: Arc<EventCallback> = Arc::new(move |value| {
            let Some(client) = weak.upgrade() else { return };
            client.route_update(value);
        });
        self.transport.on(EVENT_UPDATE, &on_update);
        subscriptions.push(on_update);

        let weak = Arc::downgrade(self);
        let on_cancel: Arc<EventCallback> = Arc::new(move |value| {
            let Some(client) = weak.upgrade() else { return };
            match serde_json::from_value::<RpcCancelPayload>(value) {
                Ok(cancel) => client.dispatcher.cancel(&cancel.request_id),
                Err(e) => warn!("malformed rpc-cancel: {e}"),
            }
        });
        self.transport.on(EVENT_RPC_CANCEL, &on_cancel);
        subscriptions.push(on_cancel);

        let on_ephemeral: Arc<EventCallback> = Arc::new(move |value| {
            trace!(kind = %value["type"], "ephemeral event");
        });
        self.transport.on(EVENT_EPHEMERAL, &on_ephemeral);
        subscriptions.push(on_ephemeral);

        // RPC intake: sessions dispatch directly, no revival layer.
        let weak = Arc::downgrade(self);
        self.transport.set_rpc_handler(Arc::new(move |request, responder| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(client) = weak.upgrade() else { return };
                let response = client.dispatcher.dispatch(&request).await;
                responder.respond(&response).await;
            })
        }));

        if let Ok(mut slot) = self.subscriptions.lock() {
            *slot = subscriptions;
        }
    }

    async fn register_rpc_methods(&self) {
        for method in self.dispatcher.known_methods() {
            let payload = RpcRegisterPayload { method };
            if let Err(e) = self.transport.emit(EVENT_RPC_REGISTER, &payload).await {
                warn!(error = %e, "rpc-register failed");
                return;
            }
        }
    }

    fn route_update(self: &Arc<Self>, value: serde_json::Value) {
        let envelope: UpdateEnvelope = match serde_json::from_value(value) {
            Ok(env) => env,
            Err(e) => {
                warn!("malformed update push: {e}");
                return;
            }
        };
        match envelope.body {
            UpdateBody::NewMessage { sid, message } => {
                if sid != self.sid {
                    debug!(%sid, "new-message for another session ignored");
                    return;
                }
                self.handle_new_message(&message);
            }
            UpdateBody::UpdateSession {
                sid,
                agent_state,
                metadata,
            } => {
                if sid != self.sid {
                    return;
                }
                let client = self.clone();
                tokio::spawn(async move {
                    if let Some(blob) = agent_state {
                        client
                            .replicator
                            .apply_remote(
                                happy_protocol::messages::BlobKind::AgentState,
                                blob.version,
                                &blob.value,
                            )
                            .await;
                    }
                    if let Some(blob) = metadata {
                        client
                            .replicator
                            .apply_remote(
                                happy_protocol::messages::BlobKind::Metadata,
                                blob.version,
                                &blob.value,
                            )
                            .await;
                    }
                });
            }
            UpdateBody::DeleteSession { sid } => {
                if let Ok(slot) = self.session_deleted.lock()
                    && let Some(cb) = slot.as_ref()
                {
                    cb(sid);
                }
            }
            UpdateBody::KvBatchUpdate { changes } => {
                for change in changes {
                    self.apply_kv_change(&change.key, change.value.as_deref());
                }
            }
            UpdateBody::UpdateMachine { .. } | UpdateBody::DeleteMachine { .. } => {
                // Machine-scope kinds are not for session clients.
            }
            UpdateBody::Unknown => {}
        }
    }

    fn handle_new_message(&self, ciphertext: &str) {
        let message = match self.crypto.decrypt(ciphertext) {
            Ok(message) => message,
            Err(_) => {
                warn!(sid = %self.sid, "inbound message was undecryptable");
                return;
            }
        };
        if is_user_message(&message) {
            let Ok(mut inbound) = self.inbound.lock() else {
                return;
            };
            match inbound.callback.as_ref() {
                Some(cb) => cb(message),
                None => inbound.queue.push_back(message),
            }
        } else {
            // Not a user message; hand off for external handling.
            self.transport.emit_local(EVENT_MESSAGE, message);
        }
    }

    fn apply_kv_change(&self, key: &str, value: Option<&str>) {
        if !KV_ALLOWLIST.contains(&key) {
            debug!(key, "kv update for unhandled key ignored");
            return;
        }
        match key {
            "contextNotificationsEnabled" => {
                let enabled = value
                    .and_then(|raw| serde_json::from_str::<bool>(raw).ok())
                    .unwrap_or(true);
                self.context_notifications.store(enabled, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

fn is_user_message(value: &serde_json::Value) -> bool {
    value["role"] == "user"
        && value["content"]["type"] == "text"
        && value["content"]["text"].is_string()
}

fn extract_usage(data: &serde_json::Value) -> Option<(Option<String>, RawUsage)> {
    let usage = data.get("usage")?;
    let usage: RawUsage = serde_json::from_value(usage.clone()).ok()?;
    let model = data
        .get("model")
        .and_then(|m| m.as_str())
        .map(String::from);
    Some((model, usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use happy_crypto::KeyVariant;
    use happy_protocol::messages::BlobKind;

    fn crypto() -> Arc<EncryptionContext> {
        Arc::new(EncryptionContext::new([8u8; 32], KeyVariant::Legacy))
    }

    fn client() -> Arc<SessionClient> {
        SessionClient::new(
            SessionClientConfig {
                server_url: "https://api.example.com".into(),
                token: "tok".into(),
                session_id: "bb6ca0a47cde4b5a9d3109f6b43210c5".into(),
                correlation_id: None,
            },
            crypto(),
        )
        .unwrap()
    }

    fn update_frame(body: serde_json::Value) -> serde_json::Value {
        serde_json::json!({"body": body})
    }

    #[tokio::test]
    async fn user_messages_queue_until_callback() {
        let c = client();
        let inbound = crypto()
            .encrypt(&serde_json::json!({
                "role": "user",
                "content": {"type": "text", "text": "hello"},
            }))
            .unwrap();
        c.route_update(update_frame(serde_json::json!({
            "t": "new-message",
            "sid": c.session_id(),
            "message": inbound,
        })));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        c.set_message_callback(Box::new(move |m| {
            s.lock().unwrap().push(m);
        }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["content"]["text"], "hello");
    }

    #[tokio::test]
    async fn non_user_messages_go_to_local_event() {
        let c = client();
        let external = Arc::new(Mutex::new(Vec::new()));
        let e = external.clone();
        let cb: Arc<EventCallback> = Arc::new(move |v| {
            e.lock().unwrap().push(v);
        });
        c.transport().on(EVENT_MESSAGE, &cb);

        let inbound = crypto()
            .encrypt(&serde_json::json!({"role": "system", "note": "x"}))
            .unwrap();
        c.route_update(update_frame(serde_json::json!({
            "t": "new-message",
            "sid": c.session_id(),
            "message": inbound,
        })));

        assert_eq!(external.lock().unwrap().len(), 1);
        // Nothing queued for the user-message path.
        assert!(c.inbound.lock().unwrap().queue.is_empty());
    }

    #[tokio::test]
    async fn undecryptable_inbound_message_is_dropped() {
        let c = client();
        c.route_update(update_frame(serde_json::json!({
            "t": "new-message",
            "sid": c.session_id(),
            "message": "!!notciphertext!!",
        })));
        assert!(c.inbound.lock().unwrap().queue.is_empty());
    }

    #[tokio::test]
    async fn update_session_push_adopts_newer_blob() {
        let c = client();
        let pushed = crypto().encrypt(&serde_json::json!({"step": 2})).unwrap();
        c.route_update(update_frame(serde_json::json!({
            "t": "update-session",
            "sid": c.session_id(),
            "agentState": {"value": pushed, "version": 3},
        })));
        // Adoption happens on a spawned task.
        tokio::task::yield_now().await;

        let blob = c.replicator().snapshot(BlobKind::AgentState).await.unwrap();
        assert_eq!(blob.version, 3);
        assert_eq!(blob.value, Some(serde_json::json!({"step": 2})));
    }

    #[tokio::test]
    async fn delete_session_fires_callback() {
        let c = client();
        let deleted = Arc::new(Mutex::new(None));
        let d = deleted.clone();
        c.set_session_deleted_callback(Box::new(move |sid| {
            *d.lock().unwrap() = Some(sid);
        }));

        c.route_update(update_frame(serde_json::json!({
            "t": "delete-session",
            "sid": "gone-1",
        })));
        assert_eq!(deleted.lock().unwrap().as_deref(), Some("gone-1"));
    }

    #[tokio::test]
    async fn kv_allowlist_application() {
        let c = client();
        assert!(c.context_notifications_enabled());

        c.route_update(update_frame(serde_json::json!({
            "t": "kv-batch-update",
            "changes": [
                {"key": "contextNotificationsEnabled", "value": "false"},
                {"key": "someFutureKey", "value": "42"},
            ],
        })));
        assert!(!c.context_notifications_enabled());
    }

    #[tokio::test]
    async fn unknown_update_kinds_are_ignored() {
        let c = client();
        c.route_update(update_frame(serde_json::json!({
            "t": "new-artifact",
            "artifactId": "a1",
        })));
    }

    #[tokio::test]
    async fn send_message_requires_connection() {
        let c = client();
        let result = c
            .send_message(OutgoingMessage::UserText("hi".into()))
            .await;
        assert!(matches!(
            result,
            Err(ClientError::Transport(SocketError::Disconnected))
        ));
    }

    #[tokio::test]
    async fn send_session_event_requires_connection() {
        let c = client();
        let result = c
            .send_session_event(SessionEvent::Ready, Some("evt-1".into()))
            .await;
        assert!(matches!(
            result,
            Err(ClientError::Transport(SocketError::Disconnected))
        ));
    }

    #[test]
    fn session_event_bodies_carry_ids() {
        let body = SessionEvent::Switch {
            mode: "plan".into(),
        }
        .into_body(None);
        assert_eq!(body["type"], "switch");
        assert_eq!(body["mode"], "plan");
        assert!(body["id"].is_string());

        let body = SessionEvent::Ready.into_body(Some("fixed-id".into()));
        assert_eq!(body["type"], "ready");
        assert_eq!(body["id"], "fixed-id");
    }

    #[test]
    fn user_message_schema_detection() {
        assert!(is_user_message(&serde_json::json!({
            "role": "user", "content": {"type": "text", "text": "hi"},
        })));
        assert!(!is_user_message(&serde_json::json!({
            "role": "agent", "content": {"type": "text", "text": "hi"},
        })));
        assert!(!is_user_message(&serde_json::json!({
            "role": "user", "content": {"type": "output"},
        })));
    }

    #[test]
    fn usage_extraction() {
        let data = serde_json::json!({
            "model": "claude-opus-4",
            "usage": {"input_tokens": 5, "output_tokens": 7},
        });
        let (model, usage) = extract_usage(&data).unwrap();
        assert_eq!(model.as_deref(), Some("claude-opus-4"));
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 7);

        assert!(extract_usage(&serde_json::json!({"no": "usage"})).is_none());
    }
}
