//! Scope-specific wiring: which blobs a scope replicates and which wire
//! events carry their updates.

use happy_protocol::constants::{
    EVENT_MACHINE_UPDATE_METADATA, EVENT_MACHINE_UPDATE_STATE, EVENT_UPDATE_METADATA,
    EVENT_UPDATE_STATE,
};
use happy_protocol::messages::{
    BlobField, BlobKind, MachineUpdatePayload, SessionUpdatePayload,
};

/// The scope a replicator serves.
#[derive(Debug, Clone)]
pub enum SyncScope {
    Session { sid: String },
    Machine { machine_id: String },
}

impl SyncScope {
    /// The two blobs replicated in this scope, in reconciliation order.
    pub fn blobs(&self) -> [BlobKind; 2] {
        match self {
            SyncScope::Session { .. } => [BlobKind::AgentState, BlobKind::Metadata],
            SyncScope::Machine { .. } => [BlobKind::Metadata, BlobKind::DaemonState],
        }
    }

    /// Whether this scope replicates the given blob.
    pub fn carries(&self, kind: BlobKind) -> bool {
        self.blobs().contains(&kind)
    }

    /// The acknowledged update event for a blob, when the scope carries it.
    pub fn update_event(&self, kind: BlobKind) -> Option<&'static str> {
        match (self, kind) {
            (SyncScope::Session { .. }, BlobKind::AgentState) => Some(EVENT_UPDATE_STATE),
            (SyncScope::Session { .. }, BlobKind::Metadata) => Some(EVENT_UPDATE_METADATA),
            (SyncScope::Machine { .. }, BlobKind::DaemonState) => {
                Some(EVENT_MACHINE_UPDATE_STATE)
            }
            (SyncScope::Machine { .. }, BlobKind::Metadata) => {
                Some(EVENT_MACHINE_UPDATE_METADATA)
            }
            _ => None,
        }
    }

    /// Builds the CAS payload for one update attempt.
    pub fn update_payload(
        &self,
        kind: BlobKind,
        expected_version: u64,
        ciphertext: String,
    ) -> serde_json::Value {
        match self {
            SyncScope::Session { sid } => serde_json::to_value(SessionUpdatePayload {
                sid: sid.clone(),
                expected_version,
                blob: BlobField::new(kind, ciphertext),
            })
            .unwrap_or(serde_json::Value::Null),
            SyncScope::Machine { machine_id } => serde_json::to_value(MachineUpdatePayload {
                machine_id: machine_id.clone(),
                expected_version,
                blob: BlobField::new(kind, ciphertext),
            })
            .unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            SyncScope::Session { sid } => sid,
            SyncScope::Machine { machine_id } => machine_id,
        }
    }
}
