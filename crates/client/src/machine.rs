//! Machine-scoped client: the daemon's connection to the coordination
//! server, plus the session revival controller.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use happy_crypto::EncryptionContext;
use happy_protocol::constants::{
    EVENT_CONNECT, EVENT_DISCONNECT, EVENT_EPHEMERAL, EVENT_MACHINE_ALIVE, EVENT_RPC_CANCEL,
    EVENT_RPC_REGISTER, EVENT_SESSION_REVIVAL_PAUSED, EVENT_SESSION_REVIVED, EVENT_UPDATE,
    HANDLER_READY_POLL_INTERVAL, HANDLER_READY_TIMEOUT, MACHINE_KEEPALIVE_INTERVAL,
    MACHINE_KEEPALIVE_JITTER, REVIVAL_COOLDOWN, REVIVAL_FAILURE_THRESHOLD,
    REVIVAL_FAILURE_WINDOW,
};
use happy_protocol::messages::{
    BlobKind, DaemonStateBody, MachineAlivePayload, RpcCancelPayload, RpcRegisterPayload,
    RpcRequestPayload, SessionRevivalPausedPayload, SessionRevivedPayload, UpdateBody,
    UpdateEnvelope,
};
use happy_protocol::types::{Credential, is_valid_session_id, normalize_session_id};
use happy_rpc::{HandlerError, RpcDispatcher, codes};
use happy_sync::{Replicator, SyncMetrics, SyncScope};
use happy_transport::{EventCallback, SocketError, Transport, TransportConfig};

use crate::daemon::{DaemonHandler, SessionStatus, SpawnOutcome, SpawnRequest};
use crate::epoch_ms;
use crate::revival::{RevivalConfig, RevivalController, RevivalResult};

/// Identity of the local daemon process, published as `daemonState`.
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    pub pid: u32,
    pub http_port: Option<u16>,
    /// Epoch milliseconds.
    pub started_at: i64,
    pub mcp_config: Option<serde_json::Value>,
}

pub struct MachineClientConfig {
    pub server_url: String,
    pub token: String,
    pub machine_id: String,
    pub correlation_id: Option<String>,
    pub daemon_info: DaemonInfo,
    /// Revival tunables; `None` reads the environment.
    pub revival: Option<RevivalConfig>,
}

/// One per daemon process. Owns the machine-scoped transport, dispatcher,
/// and replicator, and drives session revival for RPCs that target sessions
/// no longer hosted here.
pub struct MachineClient {
    machine_id: String,
    transport: Arc<Transport>,
    dispatcher: Arc<RpcDispatcher>,
    replicator: Arc<Replicator>,
    crypto: Arc<EncryptionContext>,
    daemon: Mutex<Option<Arc<dyn DaemonHandler>>>,
    revival: RevivalController,
    /// Sessions the server deleted or archived; revival never targets them.
    archived: Mutex<HashSet<String>>,
    daemon_info: DaemonInfo,
    shutdown: CancellationToken,
    keepalive_started: AtomicBool,
    subscriptions: Mutex<Vec<Arc<EventCallback>>>,
}

impl MachineClient {
    pub fn new(
        config: MachineClientConfig,
        crypto: Arc<EncryptionContext>,
    ) -> Result<Arc<Self>, SocketError> {
        let credential = Credential::machine(&config.token, &config.machine_id);
        let mut transport_config = TransportConfig::new(&config.server_url);
        transport_config.correlation_id = config.correlation_id;
        let transport = Arc::new(Transport::new(transport_config, credential)?);

        let dispatcher = Arc::new(RpcDispatcher::new(&config.machine_id, crypto.clone()));
        let replicator = Arc::new(Replicator::new(
            SyncScope::Machine {
                machine_id: config.machine_id.clone(),
            },
            transport.clone(),
            crypto.clone(),
            Arc::new(SyncMetrics::new()),
        ));
        let revival =
            RevivalController::new(config.revival.unwrap_or_else(RevivalConfig::from_env));

        let client = Arc::new(Self {
            machine_id: config.machine_id,
            transport,
            dispatcher,
            replicator,
            crypto,
            daemon: Mutex::new(None),
            revival,
            archived: Mutex::new(HashSet::new()),
            daemon_info: config.daemon_info,
            shutdown: CancellationToken::new(),
            keepalive_started: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        });
        client.install_handlers();
        client.register_machine_methods();
        Ok(client)
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// The machine-wide RPC registry. Sessions hosted by the daemon register
    /// their scope-prefixed handlers here.
    pub fn dispatcher(&self) -> &Arc<RpcDispatcher> {
        &self.dispatcher
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Supplies the daemon callbacks. Revival refuses to run until this has
    /// been called.
    pub fn set_daemon_handler(&self, daemon: Arc<dyn DaemonHandler>) {
        if let Ok(mut slot) = self.daemon.lock() {
            *slot = Some(daemon);
        }
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), SocketError> {
        let result = self.transport.connect().await;
        if result.is_ok() && !self.keepalive_started.swap(true, Ordering::SeqCst) {
            self.start_keepalive();
        }
        result
    }

    /// Best-effort `daemonState = offline`, then teardown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.revival.reset();
        if self.transport.is_connected() {
            let result = self
                .replicator
                .update(BlobKind::DaemonState, |previous| {
                    let mut state = previous
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({}));
                    state["status"] = serde_json::json!("offline");
                    state
                })
                .await;
            if let Err(e) = result {
                debug!(error = %e, "offline daemonState write failed");
            }
        }
        self.transport.close().await;
    }

    /// Revival counters `(attempted, succeeded, failed)`.
    pub fn revival_counters(&self) -> (u64, u64, u64) {
        (
            self.revival.attempted.load(Ordering::Relaxed),
            self.revival.succeeded.load(Ordering::Relaxed),
            self.revival.failed.load(Ordering::Relaxed),
        )
    }

    fn daemon(&self) -> Option<Arc<dyn DaemonHandler>> {
        self.daemon.lock().ok().and_then(|slot| slot.clone())
    }

    fn is_archived(&self, scope: &str) -> bool {
        self.archived
            .lock()
            .map(|set| set.contains(scope))
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Wiring
    // -----------------------------------------------------------------------

    fn install_handlers(self: &Arc<Self>) {
        let mut subscriptions = Vec::new();

        let weak = Arc::downgrade(self);
        let on_connect: Arc<EventCallback> = Arc::new(move |_| {
            let Some(client) = weak.upgrade() else { return };
            client.replicator.metrics().on_reconnect();
            tokio::spawn(async move {
                client.publish_daemon_state().await;
                client.register_rpc_methods().await;
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

        // All RPC intake goes through the revive-and-replay wrapper.
        let weak = Arc::downgrade(self);
        self.transport
            .set_rpc_handler(Arc::new(move |request, responder| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(client) = weak.upgrade() else { return };
                    let response = client.handle_rpc_with_revival(&request).await;
                    responder.respond(&response).await;
                })
            }));

        if let Ok(mut slot) = self.subscriptions.lock() {
            *slot = subscriptions;
        }
    }

    /// Registers the daemon-facing machine RPC surface.
    fn register_machine_methods(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.dispatcher.register(
            "spawn-happy-session",
            Arc::new(move |params, _token| {
                let weak = weak.clone();
                Box::pin(async move {
                    let client = weak
                        .upgrade()
                        .ok_or_else(|| HandlerError::new("client shut down"))?;
                    let daemon = client
                        .daemon()
                        .ok_or_else(|| HandlerError::new("RPC handlers not initialized"))?;
                    let directory = params
                        .get("directory")
                        .and_then(|d| d.as_str())
                        .map(PathBuf::from)
                        .unwrap_or_else(default_directory);
                    let session_id = match params.get("sessionId").and_then(|s| s.as_str()) {
                        Some(raw) => Some(
                            normalize_session_id(raw)
                                .ok_or_else(|| HandlerError::new("Invalid session id"))?,
                        ),
                        None => None,
                    };
                    let outcome = daemon
                        .spawn_session(SpawnRequest {
                            directory,
                            session_id,
                        })
                        .await;
                    Ok(spawn_outcome_response(outcome))
                })
            }),
        );

        let weak = Arc::downgrade(self);
        self.dispatcher.register(
            "stop-session",
            Arc::new(move |params, _token| {
                let weak = weak.clone();
                Box::pin(async move {
                    let client = weak
                        .upgrade()
                        .ok_or_else(|| HandlerError::new("client shut down"))?;
                    let daemon = client
                        .daemon()
                        .ok_or_else(|| HandlerError::new("RPC handlers not initialized"))?;
                    let session_id = require_session_id(&params)?;
                    let stopped = daemon.stop_session(&session_id).await;
                    Ok(serde_json::json!({"success": stopped}))
                })
            }),
        );

        let weak = Arc::downgrade(self);
        self.dispatcher.register(
            "stop-daemon",
            Arc::new(move |_params, _token| {
                let weak = weak.clone();
                Box::pin(async move {
                    let client = weak
                        .upgrade()
                        .ok_or_else(|| HandlerError::new("client shut down"))?;
                    let daemon = client
                        .daemon()
                        .ok_or_else(|| HandlerError::new("RPC handlers not initialized"))?;
                    daemon.stop_daemon("requested remotely").await;
                    Ok(serde_json::json!({"message": "Daemon shutting down"}))
                })
            }),
        );

        let weak = Arc::downgrade(self);
        self.dispatcher.register(
            "get-session-status",
            Arc::new(move |params, _token| {
                let weak = weak.clone();
                Box::pin(async move {
                    let client = weak
                        .upgrade()
                        .ok_or_else(|| HandlerError::new("client shut down"))?;
                    let daemon = client
                        .daemon()
                        .ok_or_else(|| HandlerError::new("RPC handlers not initialized"))?;
                    let session_id = require_session_id(&params)?;
                    let status = match daemon.session_status(&session_id).await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(error = %e, session_id, "status probe failed");
                            SessionStatus::Unknown
                        }
                    };
                    Ok(serde_json::json!({"status": status_name(status)}))
                })
            }),
        );
    }

    async fn publish_daemon_state(&self) {
        let body = DaemonStateBody {
            status: "running".into(),
            pid: self.daemon_info.pid,
            http_port: self.daemon_info.http_port,
            started_at: self.daemon_info.started_at,
            mcp_config: self.daemon_info.mcp_config.clone(),
        };
        let value = serde_json::to_value(&body).unwrap_or(serde_json::Value::Null);
        if let Err(e) = self
            .replicator
            .update(BlobKind::DaemonState, move |_| value.clone())
            .await
        {
            warn!(error = %e, "daemonState publication failed");
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
            UpdateBody::UpdateMachine {
                machine_id,
                metadata,
                daemon_state,
            } => {
                if machine_id != self.machine_id {
                    debug!(%machine_id, "update-machine for another machine ignored");
                    return;
                }
                let client = self.clone();
                tokio::spawn(async move {
                    if let Some(blob) = metadata {
                        client
                            .replicator
                            .apply_remote(BlobKind::Metadata, blob.version, &blob.value)
                            .await;
                    }
                    if let Some(blob) = daemon_state {
                        client
                            .replicator
                            .apply_remote(BlobKind::DaemonState, blob.version, &blob.value)
                            .await;
                    }
                });
            }
            UpdateBody::DeleteMachine { machine_id } => {
                if machine_id != self.machine_id {
                    return;
                }
                let client = self.clone();
                tokio::spawn(async move {
                    if let Some(daemon) = client.daemon() {
                        daemon.on_machine_disconnected("machine deleted").await;
                    }
                });
            }
            UpdateBody::DeleteSession { sid } => {
                let scope = normalize_session_id(&sid).unwrap_or(sid);
                debug!(%scope, "session archived");
                if let Ok(mut set) = self.archived.lock() {
                    set.insert(scope);
                }
            }
            UpdateBody::NewMessage { .. }
            | UpdateBody::UpdateSession { .. }
            | UpdateBody::KvBatchUpdate { .. }
            | UpdateBody::Unknown => {}
        }
    }

    fn start_keepalive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let jitter_ms =
                    rand::thread_rng().gen_range(0..MACHINE_KEEPALIVE_JITTER.as_millis() as u64);
                tokio::time::sleep(MACHINE_KEEPALIVE_INTERVAL + Duration::from_millis(jitter_ms))
                    .await;
                let Some(client) = weak.upgrade() else { break };
                if client.shutdown.is_cancelled() {
                    break;
                }
                if !client.transport.is_connected() {
                    continue;
                }
                let payload = MachineAlivePayload {
                    machine_id: client.machine_id.clone(),
                    time: epoch_ms(),
                };
                let _ = client
                    .transport
                    .emit_volatile(EVENT_MACHINE_ALIVE, &payload)
                    .await;
            }
        });
    }

    // -----------------------------------------------------------------------
    // Revival
    // -----------------------------------------------------------------------

    /// RPC intake with revive-and-replay. Dispatches the request; when the
    /// dispatcher reports `SESSION_NOT_ACTIVE` for a revivable session, it
    /// respawns the session, waits for its handlers, and replays the request
    /// under the new session id.
    pub async fn handle_rpc_with_revival(self: &Arc<Self>, request: &RpcRequestPayload) -> String {
        let original = self.dispatcher.dispatch(request).await;

        let Ok(decoded) = self.crypto.decrypt(&original) else {
            return original;
        };
        if decoded.get("code").and_then(|c| c.as_str()) != Some(codes::SESSION_NOT_ACTIVE) {
            return original;
        }

        let parts: Vec<&str> = request.method.split(':').collect();
        let [scope, name] = parts.as_slice() else {
            return original;
        };
        if !is_valid_session_id(scope) {
            return original;
        }
        // An explicit kill of a dead session is already in its desired state.
        if *name == "killSession" {
            return original;
        }
        let Some(scope) = normalize_session_id(scope) else {
            return original;
        };
        if self.is_archived(&scope) {
            debug!(%scope, "archived session, revival skipped");
            return original;
        }

        let directory = match self.session_directory(&scope).await {
            Some(directory) => directory,
            None => default_directory(),
        };

        let result = self.try_revive_session(&scope, directory).await;
        if !result.revived {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".into());
            let response = serde_json::json!({
                "error": format!("Session revival failed: {reason}"),
                "code": codes::SESSION_REVIVAL_FAILED,
                "originalSessionId": scope,
                "revivalResult": result,
            });
            return match self.crypto.encrypt(&response) {
                Ok(ciphertext) => ciphertext,
                Err(e) => {
                    warn!(error = %e, "failed to encrypt revival error");
                    original
                }
            };
        }

        let new_session_id = result
            .new_session_id
            .clone()
            .unwrap_or_else(|| scope.clone());
        self.wait_for_handlers_ready(&new_session_id).await;

        let replay = RpcRequestPayload {
            method: format!("{new_session_id}:{name}"),
            params: request.params.clone(),
            request_id: request.request_id.clone(),
        };
        info!(original = %scope, new = %new_session_id, method = %name, "replaying rpc after revival");
        self.dispatcher.dispatch(&replay).await
    }

    async fn session_directory(&self, scope: &str) -> Option<PathBuf> {
        let daemon = self.daemon()?;
        daemon.session_directory(scope).await
    }

    async fn try_revive_session(self: &Arc<Self>, scope: &str, directory: PathBuf) -> RevivalResult {
        // Global circuit breaker.
        if let Some(remaining) = self.revival.cooldown_remaining() {
            if self.revival.should_notify_paused() {
                let payload = SessionRevivalPausedPayload {
                    reason: "circuit_breaker".into(),
                    remaining_ms: remaining.as_millis() as u64,
                    resumes_at: epoch_ms() + remaining.as_millis() as i64,
                    machine_id: self.machine_id.clone(),
                };
                let _ = self
                    .transport
                    .emit_volatile(EVENT_SESSION_REVIVAL_PAUSED, &payload)
                    .await;
            }
            return RevivalResult::failed(
                scope,
                format!(
                    "Revival paused for {}s by circuit breaker",
                    remaining.as_secs().max(1)
                ),
            );
        }
        self.revival.prune_window();

        // Per-session attempt cap.
        let max_attempts = self.revival.config.max_attempts;
        if self.revival.attempts_for(scope) >= max_attempts {
            info!(
                event = "session_revival_limit_exceeded",
                session_id = %scope,
                limit = max_attempts,
            );
            return RevivalResult::failed(
                scope,
                format!("Max revival attempts ({max_attempts}) exceeded"),
            );
        }

        // Deduplicate concurrent revivals of the same scope.
        let mut in_flight = self.revival.in_flight.lock().await;
        if let Some(existing) = in_flight.get(scope) {
            let existing = existing.clone();
            drop(in_flight);
            debug!(%scope, "joining in-flight revival");
            return existing.await;
        }

        if self.daemon().is_none() {
            return RevivalResult::failed(scope, "RPC handlers not initialized");
        }

        self.revival.increment_attempts(scope);
        self.revival.attempted.fetch_add(1, Ordering::Relaxed);
        info!(
            event = "session_revival_attempt",
            session_id = %scope,
            attempt = self.revival.attempts_for(scope),
        );

        let client = self.clone();
        let scope_owned = scope.to_string();
        let future = async move {
            let result = client
                .execute_session_revival(&scope_owned, &directory)
                .await;
            client.settle_revival(&scope_owned, &result);
            client.revival.in_flight.lock().await.remove(&scope_owned);
            result
        }
        .boxed()
        .shared();
        in_flight.insert(scope.to_string(), future.clone());
        drop(in_flight);

        future.await
    }

    async fn execute_session_revival(
        self: &Arc<Self>,
        scope: &str,
        directory: &std::path::Path,
    ) -> RevivalResult {
        let Some(daemon) = self.daemon() else {
            return RevivalResult::failed(scope, "RPC handlers not initialized");
        };

        match daemon.session_status(scope).await {
            Ok(SessionStatus::Active) => {
                return RevivalResult::failed(scope, "Session is already active");
            }
            Ok(SessionStatus::Unknown) => {}
            Err(e) => warn!(error = %e, %scope, "status probe failed before revival"),
        }

        let timeout = self.revival.config.timeout;
        let spawn = daemon.spawn_session(SpawnRequest {
            directory: directory.to_path_buf(),
            session_id: Some(scope.to_string()),
        });
        match tokio::time::timeout(timeout, spawn).await {
            Ok(SpawnOutcome::Success { session_id }) => {
                if self.transport.is_connected() && session_id != scope {
                    let payload = SessionRevivedPayload {
                        original_session_id: scope.to_string(),
                        new_session_id: session_id.clone(),
                        machine_id: self.machine_id.clone(),
                    };
                    let _ = self
                        .transport
                        .emit_volatile(EVENT_SESSION_REVIVED, &payload)
                        .await;
                }
                RevivalResult {
                    revived: true,
                    new_session_id: Some(session_id),
                    original_session_id: scope.to_string(),
                    error: None,
                    command_replayed: false,
                }
            }
            Ok(SpawnOutcome::RequestToApproveDirectoryCreation { directory }) => {
                RevivalResult::failed(
                    scope,
                    format!(
                        "Directory creation required but not approved: {}",
                        directory.display()
                    ),
                )
            }
            Ok(SpawnOutcome::Error { message }) => RevivalResult::failed(scope, message),
            Err(_) => RevivalResult::failed(
                scope,
                format!("Session revival timed out after {}ms", timeout.as_millis()),
            ),
        }
    }

    fn settle_revival(&self, scope: &str, result: &RevivalResult) {
        if result.revived {
            self.revival.clear_attempts(scope);
            self.revival.succeeded.fetch_add(1, Ordering::Relaxed);
            info!(
                event = "session_revival_success",
                session_id = %scope,
                new_session_id = result.new_session_id.as_deref().unwrap_or(scope),
            );
        } else {
            self.revival.failed.fetch_add(1, Ordering::Relaxed);
            if let Some(trip) = self.revival.record_failure() {
                warn!(
                    event = "session_revival_cooldown_triggered",
                    failure_count = trip.failure_count,
                    cooldown_duration_ms = REVIVAL_COOLDOWN.as_millis() as u64,
                    window_ms = REVIVAL_FAILURE_WINDOW.as_millis() as u64,
                    threshold = REVIVAL_FAILURE_THRESHOLD,
                );
            }
            info!(
                event = "session_revival_failure",
                session_id = %scope,
                reason = result.error.as_deref().unwrap_or("unknown"),
            );
        }
    }

    /// Polls until the revived session's handlers report active, bounded by
    /// [`HANDLER_READY_TIMEOUT`]. Times out silently: the replay proceeds
    /// either way.
    async fn wait_for_handlers_ready(&self, session_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + HANDLER_READY_TIMEOUT;
        loop {
            if let Some(daemon) = self.daemon()
                && let Ok(SessionStatus::Active) = daemon.session_status(session_id).await
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(%session_id, "handler-ready wait timed out, proceeding anyway");
                return false;
            }
            tokio::time::sleep(HANDLER_READY_POLL_INTERVAL).await;
        }
    }
}

fn default_directory() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn status_name(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Unknown => "unknown",
    }
}

fn spawn_outcome_response(outcome: SpawnOutcome) -> serde_json::Value {
    match outcome {
        SpawnOutcome::Success { session_id } => {
            serde_json::json!({"type": "success", "sessionId": session_id})
        }
        SpawnOutcome::RequestToApproveDirectoryCreation { directory } => serde_json::json!({
            "type": "requestToApproveDirectoryCreation",
            "directory": directory.display().to_string(),
        }),
        SpawnOutcome::Error { message } => {
            serde_json::json!({"type": "error", "errorMessage": message})
        }
    }
}

fn require_session_id(params: &serde_json::Value) -> Result<String, HandlerError> {
    let raw = params
        .get("sessionId")
        .and_then(|s| s.as_str())
        .ok_or_else(|| HandlerError::new("sessionId required"))?;
    normalize_session_id(raw).ok_or_else(|| HandlerError::new("Invalid session id"))
}
