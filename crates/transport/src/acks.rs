//! Pending-acknowledgement table.
//!
//! Each acknowledged emit parks a oneshot sender here under a fresh UUID.
//! The read pump resolves entries as acks arrive; disconnects reject every
//! entry by dropping the senders; orphans (receiver gone, e.g. the emitting
//! task was aborted) are reaped under memory pressure.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

pub(crate) struct PendingAcks {
    map: Mutex<HashMap<String, PendingAck>>,
    cleaned_total: AtomicU64,
}

struct PendingAck {
    tx: oneshot::Sender<serde_json::Value>,
    created_at: tokio::time::Instant,
}

impl PendingAcks {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            cleaned_total: AtomicU64::new(0),
        }
    }

    pub(crate) fn insert(&self, ack_id: &str, tx: oneshot::Sender<serde_json::Value>) {
        if let Ok(mut map) = self.map.lock() {
            map.insert(
                ack_id.to_string(),
                PendingAck {
                    tx,
                    created_at: tokio::time::Instant::now(),
                },
            );
        }
    }

    /// Resolves the entry for `ack_id` with the ack payload. Returns `false`
    /// when no entry matched (late or unknown ack).
    pub(crate) fn resolve(&self, ack_id: &str, value: serde_json::Value) -> bool {
        let entry = match self.map.lock() {
            Ok(mut map) => map.remove(ack_id),
            Err(_) => None,
        };
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Removes an entry without resolving it (timeout or failed send).
    pub(crate) fn remove(&self, ack_id: &str) -> bool {
        self.map
            .lock()
            .map(|mut map| map.remove(ack_id).is_some())
            .unwrap_or(false)
    }

    /// Rejects every pending entry by dropping its sender; waiting emitters
    /// observe a disconnected error.
    pub(crate) fn reject_all(&self) {
        if let Ok(mut map) = self.map.lock() {
            map.clear();
        }
    }

    /// Removes entries whose receiver is gone. Returns how many were reaped.
    pub(crate) fn reap_orphans(&self) -> usize {
        let Ok(mut map) = self.map.lock() else {
            return 0;
        };
        let before = map.len();
        map.retain(|_, pending| !pending.tx.is_closed());
        let reaped = before - map.len();
        self.cleaned_total.fetch_add(reaped as u64, Ordering::Relaxed);
        reaped
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub(crate) fn cleaned_total(&self) -> u64 {
        self.cleaned_total.load(Ordering::Relaxed)
    }

    /// Age of the oldest pending entry, for diagnostics.
    pub(crate) fn oldest_age(&self) -> Option<tokio::time::Duration> {
        self.map.lock().ok().and_then(|map| {
            map.values()
                .map(|p| p.created_at.elapsed())
                .max_by_key(|d| *d)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_routes_to_waiter() {
        let acks = PendingAcks::new();
        let (tx, rx) = oneshot::channel();
        acks.insert("a1", tx);
        assert_eq!(acks.len(), 1);

        assert!(acks.resolve("a1", serde_json::json!({"ok": true})));
        assert_eq!(rx.await.unwrap(), serde_json::json!({"ok": true}));
        assert_eq!(acks.len(), 0);
    }

    #[tokio::test]
    async fn unmatched_ack_is_reported() {
        let acks = PendingAcks::new();
        assert!(!acks.resolve("ghost", serde_json::Value::Null));
    }

    #[tokio::test]
    async fn reject_all_errors_waiters() {
        let acks = PendingAcks::new();
        let (tx, rx) = oneshot::channel::<serde_json::Value>();
        acks.insert("a1", tx);
        acks.reject_all();
        assert!(rx.await.is_err());
        assert_eq!(acks.len(), 0);
    }

    #[tokio::test]
    async fn reap_orphans_removes_closed_receivers() {
        let acks = PendingAcks::new();
        let (tx1, rx1) = oneshot::channel::<serde_json::Value>();
        let (tx2, _rx2_dropped) = oneshot::channel::<serde_json::Value>();
        drop(_rx2_dropped);
        acks.insert("live", tx1);
        acks.insert("orphan", tx2);

        assert_eq!(acks.reap_orphans(), 1);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks.cleaned_total(), 1);
        drop(rx1);
    }

    #[tokio::test]
    async fn oldest_age_tracks_entries() {
        let acks = PendingAcks::new();
        assert!(acks.oldest_age().is_none());
        let (tx, _rx) = oneshot::channel();
        acks.insert("a", tx);
        assert!(acks.oldest_age().is_some());
    }
}
