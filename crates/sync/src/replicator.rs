//! The replicator: per-blob CAS updates, inbound adoption, and the
//! reconnect reconciliation pass.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use happy_crypto::EncryptionContext;
use happy_protocol::messages::{BlobKind, UpdateAck, UpdateResult};
use happy_transport::{SocketError, Transport};

use crate::metrics::SyncMetrics;
use crate::scope::SyncScope;

/// The ack'd send surface the replicator needs from the transport. Split
/// out so the CAS machinery is testable against a scripted channel.
pub trait UpdateChannel: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    fn send_update(
        &self,
        event: &'static str,
        payload: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value, SocketError>>;
}

impl UpdateChannel for Transport {
    fn is_connected(&self) -> bool {
        Transport::is_connected(self)
    }

    fn send_update(
        &self,
        event: &'static str,
        payload: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value, SocketError>> {
        Box::pin(async move { self.emit_with_ack(event, &payload, None).await })
    }
}

/// One replicated blob: the plaintext value (if any) and its monotonic
/// version. The version never decreases locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionedBlob {
    pub value: Option<serde_json::Value>,
    pub version: u64,
}

/// How a reconciliation pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    /// The socket dropped mid-sync.
    Aborted,
    Error,
}

/// Backoff for CAS retries after version conflicts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_retries: 8,
        }
    }
}

impl RetryConfig {
    fn delay(&self, retry: u32) -> Duration {
        let exp = retry.min(31) as i32;
        let ms = (self.initial_delay.as_millis() as f64 * 2f64.powi(exp))
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] SocketError),

    #[error("encryption error: {0}")]
    Encrypt(#[from] happy_crypto::EncryptError),

    #[error("malformed update acknowledgement: {0}")]
    Protocol(String),

    #[error("server rejected the update")]
    Rejected,

    #[error("version conflict retries exhausted")]
    RetriesExhausted,

    #[error("blob {0:?} is not replicated in this scope")]
    UnknownBlob(BlobKind),
}

type ReconciledCallback = Box<dyn Fn() + Send + Sync>;

/// Replicates two versioned blobs for one scope.
pub struct Replicator<C: UpdateChannel = Transport> {
    scope: SyncScope,
    channel: Arc<C>,
    crypto: Arc<EncryptionContext>,
    slots: [(BlobKind, Arc<Mutex<VersionedBlob>>); 2],
    retry: RetryConfig,
    metrics: Arc<SyncMetrics>,
    on_reconciled: StdMutex<Option<ReconciledCallback>>,
}

impl<C: UpdateChannel> Replicator<C> {
    pub fn new(
        scope: SyncScope,
        channel: Arc<C>,
        crypto: Arc<EncryptionContext>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let [a, b] = scope.blobs();
        Self {
            scope,
            channel,
            crypto,
            slots: [
                (a, Arc::new(Mutex::new(VersionedBlob::default()))),
                (b, Arc::new(Mutex::new(VersionedBlob::default()))),
            ],
            retry: RetryConfig::default(),
            metrics,
            on_reconciled: StdMutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn scope(&self) -> &SyncScope {
        &self.scope
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Invoked once per reconciliation in which at least one blob was
    /// updated from the server.
    pub fn set_reconciled_callback(&self, callback: ReconciledCallback) {
        if let Ok(mut slot) = self.on_reconciled.lock() {
            *slot = Some(callback);
        }
    }

    fn slot(&self, kind: BlobKind) -> Option<&Arc<Mutex<VersionedBlob>>> {
        self.slots
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, slot)| slot)
    }

    pub async fn snapshot(&self, kind: BlobKind) -> Option<VersionedBlob> {
        match self.slot(kind) {
            Some(slot) => Some(slot.lock().await.clone()),
            None => None,
        }
    }

    /// Installs local state without talking to the server. Used when the
    /// owner restores persisted state at startup.
    pub async fn seed(&self, kind: BlobKind, value: Option<serde_json::Value>, version: u64) {
        if let Some(slot) = self.slot(kind) {
            let mut guard = slot.lock().await;
            guard.value = value;
            guard.version = version;
        }
    }

    /// Applies `mutate` to the blob and pushes the result with CAS
    /// semantics. Version conflicts adopt a newer server blob and retry the
    /// mutation on the new base, with capped exponential backoff. Resolves
    /// with the accepted version, or the first non-conflict error.
    pub async fn update<F>(&self, kind: BlobKind, mut mutate: F) -> Result<u64, SyncError>
    where
        F: FnMut(Option<&serde_json::Value>) -> serde_json::Value + Send,
    {
        let slot = self.slot(kind).ok_or(SyncError::UnknownBlob(kind))?;
        let event = self
            .scope
            .update_event(kind)
            .ok_or(SyncError::UnknownBlob(kind))?;

        let mut guard = slot.lock().await;
        let mut retries: u32 = 0;
        loop {
            let next = mutate(guard.value.as_ref());
            let ciphertext = self.crypto.encrypt(&next)?;
            let payload = self.scope.update_payload(kind, guard.version, ciphertext);

            let ack = self.channel.send_update(event, payload).await?;
            let ack: UpdateAck = serde_json::from_value(ack)
                .map_err(|e| SyncError::Protocol(e.to_string()))?;

            match ack.result {
                UpdateResult::Success => {
                    let version = ack
                        .version
                        .ok_or_else(|| SyncError::Protocol("success without version".into()))?;
                    match ack.blob(kind) {
                        Some(returned) => match self.crypto.decrypt(returned) {
                            Ok(value) => {
                                guard.value = Some(value);
                                guard.version = version;
                            }
                            Err(_) => {
                                warn!(
                                    blob = kind.wire_field(),
                                    "accepted blob was undecryptable, keeping local state"
                                );
                            }
                        },
                        None => {
                            guard.value = Some(next);
                            guard.version = version;
                        }
                    }
                    return Ok(guard.version);
                }
                UpdateResult::VersionMismatch => {
                    self.metrics.record_mismatch();
                    if let Some(server_version) = ack.version
                        && server_version > guard.version
                        && let Some(returned) = ack.blob(kind)
                    {
                        match self.crypto.decrypt(returned) {
                            Ok(value) => {
                                debug!(
                                    blob = kind.wire_field(),
                                    local = guard.version,
                                    server = server_version,
                                    "adopting newer server blob before retry"
                                );
                                guard.value = Some(value);
                                guard.version = server_version;
                            }
                            Err(_) => warn!(
                                blob = kind.wire_field(),
                                "server blob was undecryptable, retrying on stale base"
                            ),
                        }
                    }
                    if retries >= self.retry.max_retries {
                        return Err(SyncError::RetriesExhausted);
                    }
                    let delay = self.retry.delay(retries);
                    retries += 1;
                    tokio::time::sleep(delay).await;
                }
                UpdateResult::Error => return Err(SyncError::Rejected),
            }
        }
    }

    /// Adopts a server push when its version is strictly newer. The version
    /// is checked under the blob lock to guard against stale ordering.
    pub async fn apply_remote(&self, kind: BlobKind, version: u64, ciphertext: &str) {
        let Some(slot) = self.slot(kind) else {
            return;
        };
        let mut guard = slot.lock().await;
        if version <= guard.version {
            debug!(
                blob = kind.wire_field(),
                local = guard.version,
                pushed = version,
                "stale push ignored"
            );
            return;
        }
        match self.crypto.decrypt(ciphertext) {
            Ok(value) => {
                guard.value = Some(value);
                guard.version = version;
            }
            Err(_) => warn!(
                blob = kind.wire_field(),
                "pushed blob was undecryptable, update skipped"
            ),
        }
    }

    /// Reconciles both blobs with the server after a reconnect. Pushes the
    /// current local `(value, expectedVersion)` for each blob and adopts
    /// whatever the server proves is newer.
    pub async fn reconcile(&self) -> SyncOutcome {
        self.metrics.sync_started(true);
        let started = tokio::time::Instant::now();
        let mut adopted_any = false;
        let mut mismatch = [false; 2];
        let mut outcome = SyncOutcome::Completed;
        let mut error_kind: Option<String> = None;

        for (index, kind) in self.scope.blobs().into_iter().enumerate() {
            if !self.channel.is_connected() {
                outcome = SyncOutcome::Aborted;
                break;
            }
            let (Some(slot), Some(event)) = (self.slot(kind), self.scope.update_event(kind))
            else {
                continue;
            };
            let mut guard = slot.lock().await;
            let value = guard.value.clone().unwrap_or(serde_json::Value::Null);
            let ciphertext = match self.crypto.encrypt(&value) {
                Ok(c) => c,
                Err(e) => {
                    outcome = SyncOutcome::Error;
                    error_kind = Some(error_name(&SyncError::Encrypt(e)));
                    break;
                }
            };
            let payload = self.scope.update_payload(kind, guard.version, ciphertext);

            match self.channel.send_update(event, payload).await {
                Ok(ack) => {
                    let ack: UpdateAck = match serde_json::from_value(ack) {
                        Ok(a) => a,
                        Err(e) => {
                            outcome = SyncOutcome::Error;
                            error_kind = Some(error_name(&SyncError::Protocol(e.to_string())));
                            break;
                        }
                    };
                    match ack.result {
                        UpdateResult::Success => {
                            if let Some(version) = ack.version {
                                guard.version = version;
                            }
                        }
                        UpdateResult::VersionMismatch => {
                            self.metrics.record_mismatch();
                            if let Some(server_version) = ack.version
                                && server_version > guard.version
                                && let Some(returned) = ack.blob(kind)
                                && let Ok(value) = self.crypto.decrypt(returned)
                            {
                                guard.value = Some(value);
                                guard.version = server_version;
                                mismatch[index] = true;
                                adopted_any = true;
                            }
                        }
                        UpdateResult::Error => {
                            outcome = SyncOutcome::Error;
                            error_kind = Some(error_name(&SyncError::Rejected));
                            break;
                        }
                    }
                }
                Err(SocketError::Disconnected) => {
                    outcome = SyncOutcome::Aborted;
                    break;
                }
                Err(e) => {
                    outcome = SyncOutcome::Error;
                    error_kind = Some(error_name(&SyncError::Transport(e)));
                    break;
                }
            }
        }

        if adopted_any
            && let Ok(callback) = self.on_reconciled.lock()
            && let Some(cb) = callback.as_ref()
        {
            cb();
        }

        self.metrics.sync_completed(
            outcome,
            mismatch[0],
            mismatch[1],
            error_kind.as_deref(),
            started.elapsed(),
        );
        outcome
    }
}

/// Short kind name recorded in sync metrics.
fn error_name(error: &SyncError) -> String {
    match error {
        SyncError::Transport(SocketError::AckTimeout) => "AckTimeout".into(),
        SyncError::Transport(SocketError::Disconnected) => "Disconnected".into(),
        SyncError::Transport(_) => "Transport".into(),
        SyncError::Encrypt(_) => "Encrypt".into(),
        SyncError::Protocol(_) => "Protocol".into(),
        SyncError::Rejected => "Rejected".into(),
        SyncError::RetriesExhausted => "RetriesExhausted".into(),
        SyncError::UnknownBlob(_) => "UnknownBlob".into(),
    }
}
