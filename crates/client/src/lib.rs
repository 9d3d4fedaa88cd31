//! Session- and machine-scoped clients.
//!
//! A [`SessionClient`] binds one transport, dispatcher, and replicator to a
//! single agent session. The [`MachineClient`] does the same for the daemon's
//! machine scope and additionally owns the session revival controller: when
//! an RPC targets a session that is no longer hosted locally, it respawns
//! the session, waits for its handlers, and replays the request.

pub mod daemon;
pub mod machine;
pub mod pricing;
pub mod revival;
pub mod session;

pub use daemon::{DaemonError, DaemonHandler, SessionStatus, SpawnOutcome, SpawnRequest};
pub use machine::{DaemonInfo, MachineClient, MachineClientConfig};
pub use revival::{RevivalConfig, RevivalResult};
pub use session::{OutgoingMessage, SessionClient, SessionClientConfig, SessionEvent};

/// Errors surfaced by the client facades.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] happy_transport::SocketError),

    #[error(transparent)]
    Encrypt(#[from] happy_crypto::EncryptError),

    #[error(transparent)]
    Sync(#[from] happy_sync::replicator::SyncError),
}

pub(crate) fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
