//! Version-stamped state replication.
//!
//! Each scope replicates two opaque JSON blobs with the server under
//! compare-and-swap semantics: session scopes carry `agentState` and
//! `metadata`, the machine scope carries `metadata` and `daemonState`.
//! Local writes go through [`Replicator::update`], which retries version
//! conflicts with capped exponential backoff; server pushes and the
//! reconnect reconciliation adopt newer server versions under per-blob
//! locks.

pub mod metrics;
pub mod replicator;
pub mod scope;

pub use metrics::{DisconnectionRecord, SyncMetrics, SyncSnapshot};
pub use replicator::{Replicator, RetryConfig, SyncError, SyncOutcome, VersionedBlob};
pub use scope::SyncScope;
