use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// RPC payloads
// ---------------------------------------------------------------------------

/// Server-to-client RPC request. `params` is base64 ciphertext; `method` is
/// scope-prefixed (`<scope>:<name>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequestPayload {
    pub method: String,
    pub params: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Server-to-client cancellation of an in-flight RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCancelPayload {
    pub request_id: String,
    pub method: String,
}

/// Client-to-server registration of one RPC method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRegisterPayload {
    pub method: String,
}

// ---------------------------------------------------------------------------
// Session messages
// ---------------------------------------------------------------------------

/// Encrypted session message emit. `message` is base64 ciphertext of a
/// [`MessageEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessagePayload {
    pub sid: String,
    pub message: String,
}

/// Plaintext shape of an outbound session message before encryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub role: String,
    pub content: Value,
    pub meta: MessageMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    pub sent_from: String,
}

impl MessageEnvelope {
    /// Wraps content under a role with the CLI origin marker.
    pub fn from_cli(role: impl Into<String>, content: Value) -> Self {
        Self {
            role: role.into(),
            content,
            meta: MessageMeta {
                sent_from: "cli".into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Versioned blob CAS
// ---------------------------------------------------------------------------

/// The replicated blobs. Session scope carries `AgentState` + `Metadata`;
/// machine scope carries `Metadata` + `DaemonState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    AgentState,
    Metadata,
    DaemonState,
}

impl BlobKind {
    /// The wire field name carrying this blob's ciphertext.
    pub fn wire_field(&self) -> &'static str {
        match self {
            BlobKind::AgentState => "agentState",
            BlobKind::Metadata => "metadata",
            BlobKind::DaemonState => "daemonState",
        }
    }
}

/// Single-blob ciphertext carrier, flattened into update payloads so the
/// field name on the wire matches the blob kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlobField {
    #[serde(rename = "agentState")]
    AgentState(String),
    #[serde(rename = "metadata")]
    Metadata(String),
    #[serde(rename = "daemonState")]
    DaemonState(String),
}

impl BlobField {
    pub fn new(kind: BlobKind, ciphertext: String) -> Self {
        match kind {
            BlobKind::AgentState => BlobField::AgentState(ciphertext),
            BlobKind::Metadata => BlobField::Metadata(ciphertext),
            BlobKind::DaemonState => BlobField::DaemonState(ciphertext),
        }
    }
}

/// Session-scope CAS update (`update-state` / `update-metadata`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdatePayload {
    pub sid: String,
    pub expected_version: u64,
    #[serde(flatten)]
    pub blob: BlobField,
}

/// Machine-scope CAS update (`machine-update-state` /
/// `machine-update-metadata`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineUpdatePayload {
    pub machine_id: String,
    pub expected_version: u64,
    #[serde(flatten)]
    pub blob: BlobField,
}

/// Server verdict on a CAS update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateResult {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "version-mismatch")]
    VersionMismatch,
    #[serde(rename = "error")]
    Error,
}

/// Acknowledgement payload of a CAS update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAck {
    pub result: UpdateResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_state: Option<String>,
}

impl UpdateAck {
    /// The returned ciphertext for the given blob, if present.
    pub fn blob(&self, kind: BlobKind) -> Option<&str> {
        match kind {
            BlobKind::AgentState => self.agent_state.as_deref(),
            BlobKind::Metadata => self.metadata.as_deref(),
            BlobKind::DaemonState => self.daemon_state.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Keepalive and usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAlivePayload {
    pub sid: String,
    /// Epoch milliseconds.
    pub time: i64,
    pub thinking: bool,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineAlivePayload {
    pub machine_id: String,
    /// Epoch milliseconds.
    pub time: i64,
}

/// Token counts of one usage report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total: u64,
}

/// USD costs of one usage report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTotals {
    pub input: f64,
    pub output: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReportPayload {
    pub key: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub tokens: TokenTotals,
    pub cost: CostTotals,
}

// ---------------------------------------------------------------------------
// Revival broadcasts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRevivedPayload {
    pub original_session_id: String,
    pub new_session_id: String,
    pub machine_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRevivalPausedPayload {
    pub reason: String,
    pub remaining_ms: u64,
    /// Epoch milliseconds.
    pub resumes_at: i64,
    pub machine_id: String,
}

// ---------------------------------------------------------------------------
// Inbound update pushes
// ---------------------------------------------------------------------------

/// Ciphertext paired with the server-side version stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedCiphertext {
    pub value: String,
    pub version: u64,
}

/// Envelope of an inbound `update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    pub body: UpdateBody,
}

/// Discriminated body of an inbound `update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum UpdateBody {
    #[serde(rename = "new-message", rename_all = "camelCase")]
    NewMessage {
        sid: String,
        /// Base64 ciphertext of the message content.
        message: String,
    },
    #[serde(rename = "update-session", rename_all = "camelCase")]
    UpdateSession {
        sid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_state: Option<VersionedCiphertext>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<VersionedCiphertext>,
    },
    #[serde(rename = "delete-session")]
    DeleteSession { sid: String },
    #[serde(rename = "update-machine", rename_all = "camelCase")]
    UpdateMachine {
        machine_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<VersionedCiphertext>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        daemon_state: Option<VersionedCiphertext>,
    },
    #[serde(rename = "delete-machine", rename_all = "camelCase")]
    DeleteMachine { machine_id: String },
    #[serde(rename = "kv-batch-update")]
    KvBatchUpdate { changes: Vec<KvChange> },
    /// Kinds the client recognizes but does not act on (artifact, social,
    /// account updates) plus anything a newer server may send.
    #[serde(other)]
    Unknown,
}

/// One key-value change inside a `kv-batch-update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvChange {
    pub key: String,
    /// JSON-encoded value; `None` clears the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Best-effort server notification kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EphemeralKind {
    Activity,
    Usage,
    MachineActivity,
    MachineDisconnected,
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Daemon state blob
// ---------------------------------------------------------------------------

/// Plaintext shape of the machine `daemonState` blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStateBody {
    pub status: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    /// Epoch milliseconds.
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<Value>,
}
