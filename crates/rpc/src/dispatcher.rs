//! The scope-keyed RPC dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use happy_crypto::EncryptionContext;
use happy_protocol::messages::RpcRequestPayload;

use crate::codes;

/// Error surfaced by an RPC handler; its message goes back over the wire.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// An RPC handler: decrypted params in, plaintext result out. The token
/// signals cancellation; handlers are expected to observe it.
pub type RpcHandlerFn = Arc<
    dyn Fn(
            serde_json::Value,
            CancellationToken,
        ) -> BoxFuture<'static, Result<serde_json::Value, HandlerError>>
        + Send
        + Sync,
>;

/// Dispatches inbound RPC requests to handlers registered under
/// `scope:method` keys, decrypting params and encrypting replies.
pub struct RpcDispatcher {
    scope: String,
    crypto: Arc<EncryptionContext>,
    handlers: Mutex<HashMap<String, RpcHandlerFn>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl RpcDispatcher {
    pub fn new(scope: impl Into<String>, crypto: Arc<EncryptionContext>) -> Self {
        Self {
            scope: scope.into(),
            crypto,
            handlers: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Registers a handler for `method` under this dispatcher's own scope.
    pub fn register(&self, method: &str, handler: RpcHandlerFn) {
        self.register_scoped(&self.scope, method, handler);
    }

    /// Registers a handler under an explicit scope. Used by the daemon to
    /// host handlers for the sessions it runs.
    pub fn register_scoped(&self, scope: &str, method: &str, handler: RpcHandlerFn) {
        let key = format!("{scope}:{method}");
        if let Ok(mut map) = self.handlers.lock() {
            debug!(%key, "rpc handler registered");
            map.insert(key, handler);
        }
    }

    /// Drops every handler registered under `scope`.
    pub fn unregister_scope(&self, scope: &str) {
        let prefix = format!("{scope}:");
        if let Ok(mut map) = self.handlers.lock() {
            map.retain(|key, _| !key.starts_with(&prefix));
        }
    }

    /// Fully-prefixed method keys, for `rpc-register` re-announcement after
    /// a reconnect.
    pub fn known_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        methods.sort();
        methods
    }

    /// Runs one inbound request to completion and returns the encrypted
    /// response ciphertext.
    pub async fn dispatch(&self, request: &RpcRequestPayload) -> String {
        let token = CancellationToken::new();
        if let Some(id) = &request.request_id
            && let Ok(mut map) = self.cancellations.lock()
        {
            map.insert(id.clone(), token.clone());
        }

        let response = self.run(request, &token).await;

        // Cleared on every path, matching the dispatch contract.
        if let Some(id) = &request.request_id
            && let Ok(mut map) = self.cancellations.lock()
        {
            map.remove(id);
        }

        self.seal(&response)
    }

    async fn run(
        &self,
        request: &RpcRequestPayload,
        token: &CancellationToken,
    ) -> serde_json::Value {
        let handler = self
            .handlers
            .lock()
            .ok()
            .and_then(|map| map.get(&request.method).cloned());

        let Some(handler) = handler else {
            return self.classify_miss(&request.method);
        };

        let params = match self.crypto.decrypt(&request.params) {
            Ok(params) => params,
            Err(_) => {
                warn!(method = %request.method, "request params were undecryptable");
                return serde_json::json!({"error": codes::DECRYPTION_FAILED});
            }
        };

        if token.is_cancelled() {
            return cancelled_response();
        }

        let result = handler(params, token.clone()).await;

        if token.is_cancelled() {
            return cancelled_response();
        }

        match result {
            Ok(value) => value,
            Err(e) => serde_json::json!({
                "error": e.to_string(),
                "cancelled": false,
            }),
        }
    }

    /// Classifies a handler lookup miss by the method's scope prefix. A
    /// prefix of at least 32 characters is a plausible session id, which the
    /// machine client may be able to revive.
    fn classify_miss(&self, method: &str) -> serde_json::Value {
        let (prefix, name) = match method.split_once(':') {
            Some((prefix, name)) => (prefix, name),
            None => (method, method),
        };
        if prefix.len() >= codes::SESSION_SCOPE_MIN_LEN {
            debug!(method, "no handler for session-scoped method");
            serde_json::json!({
                "error": "Session not active",
                "code": codes::SESSION_NOT_ACTIVE,
                "method": name,
                "cancelled": false,
                "message": format!("Session {prefix} is not running on this machine"),
            })
        } else {
            error!(method, "no handler for method");
            serde_json::json!({
                "error": "Method not found",
                "code": codes::METHOD_NOT_FOUND,
                "cancelled": false,
            })
        }
    }

    /// Signals the token recorded for `request_id`, if any.
    pub fn cancel(&self, request_id: &str) {
        let token = self
            .cancellations
            .lock()
            .ok()
            .and_then(|map| map.get(request_id).cloned());
        if let Some(token) = token {
            debug!(request_id, "cancelling in-flight request");
            token.cancel();
        }
    }

    /// Signals every in-flight request. Called on disconnect.
    pub fn cancel_all_pending_requests(&self) {
        if let Ok(map) = self.cancellations.lock() {
            for token in map.values() {
                token.cancel();
            }
        }
    }

    /// In-flight requests with a cancellation entry.
    pub fn pending_cancellations(&self) -> usize {
        self.cancellations.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn seal(&self, response: &serde_json::Value) -> String {
        match self.crypto.encrypt(response) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                error!(error = %e, "failed to encrypt rpc response");
                String::new()
            }
        }
    }
}

fn cancelled_response() -> serde_json::Value {
    serde_json::json!({
        "error": "Request cancelled",
        "code": codes::OPERATION_CANCELLED,
        "cancelled": true,
    })
}
