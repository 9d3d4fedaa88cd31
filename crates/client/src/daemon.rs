//! Contract between the machine client and the daemon that hosts sessions.
//!
//! The daemon supplies session process management; the client supplies
//! connectivity. Methods return boxed futures so implementors stay
//! object-safe and free to do real async work.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

/// A boxed future returned by daemon methods.
pub type DaemonFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the daemon knows about a session.
///
/// `Archived` is intentionally absent: archival is observed only through
/// `delete-session` updates and tracked by the machine client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Unknown,
}

/// Request to spawn (or respawn) a session.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub directory: PathBuf,
    /// The session id to revive, when this is a revival rather than a fresh
    /// spawn.
    pub session_id: Option<String>,
}

/// Result of a spawn attempt.
#[derive(Debug, Clone)]
pub enum SpawnOutcome {
    Success {
        session_id: String,
    },
    /// The target directory does not exist and the daemon needs approval to
    /// create it.
    RequestToApproveDirectoryCreation {
        directory: PathBuf,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DaemonError(pub String);

impl DaemonError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Daemon-provided callbacks the machine client delegates to.
pub trait DaemonHandler: Send + Sync + 'static {
    /// Spawns a session in `request.directory`.
    fn spawn_session(&self, request: SpawnRequest) -> DaemonFuture<'_, SpawnOutcome>;

    /// Stops a running session. Returns `true` when a session was stopped.
    fn stop_session(&self, session_id: &str) -> DaemonFuture<'_, bool>;

    /// Shuts the daemon down.
    fn stop_daemon(&self, reason: &str) -> DaemonFuture<'_, ()>;

    /// Reports whether a session is currently hosted here.
    fn session_status(
        &self,
        session_id: &str,
    ) -> DaemonFuture<'_, Result<SessionStatus, DaemonError>>;

    /// The working directory a session last ran in, if known.
    fn session_directory(&self, _session_id: &str) -> DaemonFuture<'_, Option<PathBuf>> {
        Box::pin(async { None })
    }

    /// Called when the server deletes this machine.
    fn on_machine_disconnected(&self, _reason: &str) -> DaemonFuture<'_, ()> {
        Box::pin(async {})
    }
}
