//! Sync and disconnection metrics with bounded record retention.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::debug;

use crate::replicator::SyncOutcome;

/// Default cap on retained disconnection records and sync durations.
const DEFAULT_RECORD_CAP: usize = 64;

/// Append-only log that keeps the newest `cap` entries and counts what it
/// evicted, so a snapshot can say how much history was dropped.
struct BoundedLog<T> {
    entries: VecDeque<T>,
    cap: usize,
    evicted: u64,
}

impl<T> BoundedLog<T> {
    fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(64)),
            cap: cap.max(1),
            evicted: 0,
        }
    }

    fn push(&mut self, entry: T) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);
    }
}

/// One completed disconnection episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectionRecord {
    /// Epoch milliseconds.
    pub disconnected_at: i64,
    /// Epoch milliseconds.
    pub reconnected_at: i64,
    pub duration_ms: u64,
}

/// Derived stats over retained sync durations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationStats {
    pub count: usize,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time view handed to the metrics listener.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub syncs_started: u64,
    pub reconnection_syncs: u64,
    pub completed: u64,
    pub aborted: u64,
    pub errored: u64,
    pub mismatches: u64,
    pub disconnect_count: u64,
    pub last_error_kind: Option<String>,
    pub disconnections: Vec<DisconnectionRecord>,
    pub disconnections_evicted: u64,
    pub sync_durations: DurationStats,
}

struct Inner {
    disconnected_at: Option<(tokio::time::Instant, i64)>,
    disconnections: BoundedLog<DisconnectionRecord>,
    sync_durations: BoundedLog<f64>,
    syncs_started: u64,
    reconnection_syncs: u64,
    completed: u64,
    aborted: u64,
    errored: u64,
    mismatches: u64,
    disconnect_count: u64,
    last_error_kind: Option<String>,
}

type SnapshotListener = Box<dyn Fn(SyncSnapshot) + Send + Sync>;

/// Collector shared between the replicator and its owning client.
pub struct SyncMetrics {
    inner: Mutex<Inner>,
    listener: Mutex<Option<SnapshotListener>>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_RECORD_CAP)
    }

    pub fn with_cap(record_cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                disconnected_at: None,
                disconnections: BoundedLog::new(record_cap),
                sync_durations: BoundedLog::new(record_cap),
                syncs_started: 0,
                reconnection_syncs: 0,
                completed: 0,
                aborted: 0,
                errored: 0,
                mismatches: 0,
                disconnect_count: 0,
                last_error_kind: None,
            }),
            listener: Mutex::new(None),
        }
    }

    /// Called when the transport reports a disconnect.
    pub fn on_disconnect(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.disconnect_count += 1;
            if inner.disconnected_at.is_none() {
                inner.disconnected_at = Some((tokio::time::Instant::now(), epoch_ms()));
            }
        }
    }

    /// Called when the transport reconnects; completes the open
    /// disconnection record.
    pub fn on_reconnect(&self) {
        if let Ok(mut inner) = self.inner.lock()
            && let Some((since, at_ms)) = inner.disconnected_at.take()
        {
            let record = DisconnectionRecord {
                disconnected_at: at_ms,
                reconnected_at: epoch_ms(),
                duration_ms: since.elapsed().as_millis() as u64,
            };
            debug!(duration_ms = record.duration_ms, "disconnection episode closed");
            inner.disconnections.push(record);
        }
    }

    pub fn record_mismatch(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.mismatches += 1;
        }
    }

    pub fn sync_started(&self, is_reconnection: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.syncs_started += 1;
            if is_reconnection {
                inner.reconnection_syncs += 1;
            }
        }
    }

    pub fn sync_completed(
        &self,
        outcome: SyncOutcome,
        agent_mismatch: bool,
        meta_mismatch: bool,
        error_kind: Option<&str>,
        duration: Duration,
    ) {
        if let Ok(mut inner) = self.inner.lock() {
            match outcome {
                SyncOutcome::Completed => inner.completed += 1,
                SyncOutcome::Aborted => inner.aborted += 1,
                SyncOutcome::Error => inner.errored += 1,
            }
            if let Some(kind) = error_kind {
                inner.last_error_kind = Some(kind.to_string());
            }
            inner.sync_durations.push(duration.as_secs_f64() * 1000.0);
            debug!(
                ?outcome,
                agent_mismatch, meta_mismatch, "sync completed"
            );
        }
        self.notify();
    }

    /// Registers the snapshot listener; each completed sync pushes one.
    pub fn set_listener(&self, listener: SnapshotListener) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
    }

    fn notify(&self) {
        let has_listener = self
            .listener
            .lock()
            .map(|l| l.is_some())
            .unwrap_or(false);
        if !has_listener {
            return;
        }
        let snapshot = self.snapshot();
        if let Ok(listener) = self.listener.lock()
            && let Some(cb) = listener.as_ref()
        {
            cb(snapshot);
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let Ok(inner) = self.inner.lock() else {
            return SyncSnapshot {
                syncs_started: 0,
                reconnection_syncs: 0,
                completed: 0,
                aborted: 0,
                errored: 0,
                mismatches: 0,
                disconnect_count: 0,
                last_error_kind: None,
                disconnections: Vec::new(),
                disconnections_evicted: 0,
                sync_durations: DurationStats::default(),
            };
        };
        let durations: Vec<f64> = inner.sync_durations.entries.iter().copied().collect();
        let stats = if durations.is_empty() {
            DurationStats::default()
        } else {
            let min = durations.iter().copied().fold(f64::INFINITY, f64::min);
            let max = durations.iter().copied().fold(0.0f64, f64::max);
            let mean = durations.iter().sum::<f64>() / durations.len() as f64;
            DurationStats {
                count: durations.len(),
                min_ms: min,
                mean_ms: mean,
                max_ms: max,
            }
        };
        SyncSnapshot {
            syncs_started: inner.syncs_started,
            reconnection_syncs: inner.reconnection_syncs,
            completed: inner.completed,
            aborted: inner.aborted,
            errored: inner.errored,
            mismatches: inner.mismatches,
            disconnect_count: inner.disconnect_count,
            last_error_kind: inner.last_error_kind.clone(),
            disconnections: inner.disconnections.entries.iter().cloned().collect(),
            disconnections_evicted: inner.disconnections.evicted,
            sync_durations: stats,
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bounded_log_evicts_oldest() {
        let mut log = BoundedLog::new(3);
        for i in 0..5 {
            log.push(i);
        }
        assert_eq!(log.entries.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(log.evicted, 2);
    }

    #[tokio::test]
    async fn disconnect_reconnect_produces_record() {
        tokio::time::pause();
        let m = SyncMetrics::new();
        m.on_disconnect();
        tokio::time::advance(Duration::from_millis(1500)).await;
        m.on_reconnect();

        let snap = m.snapshot();
        assert_eq!(snap.disconnect_count, 1);
        assert_eq!(snap.disconnections.len(), 1);
        assert_eq!(snap.disconnections[0].duration_ms, 1500);
    }

    #[tokio::test]
    async fn repeated_disconnects_keep_first_timestamp() {
        tokio::time::pause();
        let m = SyncMetrics::new();
        m.on_disconnect();
        tokio::time::advance(Duration::from_millis(500)).await;
        m.on_disconnect();
        tokio::time::advance(Duration::from_millis(500)).await;
        m.on_reconnect();

        let snap = m.snapshot();
        assert_eq!(snap.disconnect_count, 2);
        assert_eq!(snap.disconnections.len(), 1);
        assert_eq!(snap.disconnections[0].duration_ms, 1000);
    }

    #[test]
    fn duration_stats_derivation() {
        let m = SyncMetrics::new();
        m.sync_started(true);
        m.sync_completed(
            SyncOutcome::Completed,
            false,
            false,
            None,
            Duration::from_millis(10),
        );
        m.sync_started(false);
        m.sync_completed(
            SyncOutcome::Completed,
            true,
            false,
            None,
            Duration::from_millis(30),
        );

        let snap = m.snapshot();
        assert_eq!(snap.syncs_started, 2);
        assert_eq!(snap.reconnection_syncs, 1);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.sync_durations.count, 2);
        assert!((snap.sync_durations.min_ms - 10.0).abs() < 0.5);
        assert!((snap.sync_durations.mean_ms - 20.0).abs() < 0.5);
        assert!((snap.sync_durations.max_ms - 30.0).abs() < 0.5);
    }

    #[test]
    fn listener_receives_snapshot_per_completion() {
        let m = SyncMetrics::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        m.set_listener(Box::new(move |snap| {
            assert_eq!(snap.completed, 1);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        m.sync_started(true);
        m.sync_completed(
            SyncOutcome::Completed,
            false,
            false,
            None,
            Duration::from_millis(5),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_kind_is_retained() {
        let m = SyncMetrics::new();
        m.sync_started(true);
        m.sync_completed(
            SyncOutcome::Error,
            false,
            false,
            Some("AckTimeout"),
            Duration::from_millis(5),
        );
        let snap = m.snapshot();
        assert_eq!(snap.errored, 1);
        assert_eq!(snap.last_error_kind.as_deref(), Some("AckTimeout"));
    }
}
