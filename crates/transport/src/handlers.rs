//! Bounded event handler registry with weakly-held callbacks.
//!
//! Callbacks are stored as `Weak` references: a handler lives only as long
//! as its owner retains the `Arc`. This keeps week-long daemon processes
//! from pinning scopes through stale subscriptions. Dead entries are pruned
//! on dispatch and under memory pressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use happy_protocol::constants::{HANDLER_WARNING_THRESHOLD, MAX_HANDLERS_PER_EVENT};

/// Event callback signature. Owners keep the `Arc`; the registry keeps a
/// `Weak`.
pub type EventCallback = dyn Fn(serde_json::Value) + Send + Sync;

pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Vec<Weak<EventCallback>>>>,
    rejected_total: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Registers a callback for an event. Returns `false` when the event is
    /// already at [`MAX_HANDLERS_PER_EVENT`] live callbacks and the
    /// registration was dropped. Re-registering the same `Arc` is a no-op.
    pub fn on(&self, event: &str, callback: &Arc<EventCallback>) -> bool {
        let Ok(mut map) = self.handlers.lock() else {
            return false;
        };
        let entries = map.entry(event.to_string()).or_default();
        entries.retain(|w| w.strong_count() > 0);

        let incoming = Arc::downgrade(callback);
        if entries.iter().any(|w| w.ptr_eq(&incoming)) {
            return true;
        }
        if entries.len() >= MAX_HANDLERS_PER_EVENT {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                event,
                limit = MAX_HANDLERS_PER_EVENT,
                "handler limit reached, registration dropped"
            );
            return false;
        }
        entries.push(incoming);
        if entries.len() == HANDLER_WARNING_THRESHOLD {
            warn!(
                event,
                count = HANDLER_WARNING_THRESHOLD,
                limit = MAX_HANDLERS_PER_EVENT,
                "handler count approaching limit"
            );
        }
        true
    }

    /// Removes a callback by pointer identity.
    pub fn off(&self, event: &str, callback: &Arc<EventCallback>) {
        if let Ok(mut map) = self.handlers.lock()
            && let Some(entries) = map.get_mut(event)
        {
            let target = Arc::downgrade(callback);
            entries.retain(|w| w.strong_count() > 0 && !w.ptr_eq(&target));
            if entries.is_empty() {
                map.remove(event);
            }
        }
    }

    /// Removes all handlers for one event, or every handler when `event` is
    /// `None`.
    pub fn remove_all(&self, event: Option<&str>) {
        if let Ok(mut map) = self.handlers.lock() {
            match event {
                Some(name) => {
                    map.remove(name);
                }
                None => map.clear(),
            }
        }
    }

    /// Dispatches an event to every live callback, pruning dead entries.
    pub fn dispatch(&self, event: &str, data: serde_json::Value) {
        let callbacks: Vec<Arc<EventCallback>> = {
            let Ok(mut map) = self.handlers.lock() else {
                return;
            };
            let Some(entries) = map.get_mut(event) else {
                debug!(event, "no handlers registered, event dropped");
                return;
            };
            entries.retain(|w| w.strong_count() > 0);
            let live = entries.iter().filter_map(Weak::upgrade).collect();
            if entries.is_empty() {
                map.remove(event);
            }
            live
        };
        for cb in callbacks {
            cb(data.clone());
        }
    }

    /// Total live callbacks across all events.
    pub fn live_handlers(&self) -> usize {
        self.handlers
            .lock()
            .map(|map| {
                map.values()
                    .map(|v| v.iter().filter(|w| w.strong_count() > 0).count())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Live callbacks for a single event.
    pub fn live_handlers_for(&self, event: &str) -> usize {
        self.handlers
            .lock()
            .map(|map| {
                map.get(event)
                    .map(|v| v.iter().filter(|w| w.strong_count() > 0).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Distinct event names with at least one live callback.
    pub fn event_types(&self) -> usize {
        self.handlers
            .lock()
            .map(|map| {
                map.values()
                    .filter(|v| v.iter().any(|w| w.strong_count() > 0))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    /// Drops dead weak entries everywhere. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let Ok(mut map) = self.handlers.lock() else {
            return 0;
        };
        let mut removed = 0;
        map.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|w| w.strong_count() > 0);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn callback() -> Arc<EventCallback> {
        Arc::new(|_| {})
    }

    #[test]
    fn registers_and_dispatches() {
        let reg = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb: Arc<EventCallback> = Arc::new(move |v| {
            assert_eq!(v, serde_json::json!(7));
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(reg.on("update", &cb));
        reg.dispatch("update", serde_json::json!(7));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_registration_is_noop() {
        let reg = HandlerRegistry::new();
        let cb = callback();
        assert!(reg.on("e", &cb));
        assert!(reg.on("e", &cb));
        assert_eq!(reg.live_handlers_for("e"), 1);
    }

    #[test]
    fn dropping_owner_drops_handler() {
        let reg = HandlerRegistry::new();
        let cb = callback();
        reg.on("e", &cb);
        assert_eq!(reg.live_handlers_for("e"), 1);
        drop(cb);
        assert_eq!(reg.live_handlers_for("e"), 0);
    }

    #[test]
    fn hundred_and_first_registration_is_rejected() {
        let reg = HandlerRegistry::new();
        let mut retained = Vec::new();
        for _ in 0..MAX_HANDLERS_PER_EVENT {
            let cb = callback();
            assert!(reg.on("e", &cb));
            retained.push(cb);
        }
        let extra = callback();
        assert!(!reg.on("e", &extra));
        assert_eq!(reg.live_handlers_for("e"), MAX_HANDLERS_PER_EVENT);
        assert_eq!(reg.rejected_total(), 1);
    }

    #[test]
    fn dead_slots_free_capacity() {
        let reg = HandlerRegistry::new();
        let mut retained = Vec::new();
        for _ in 0..MAX_HANDLERS_PER_EVENT {
            let cb = callback();
            reg.on("e", &cb);
            retained.push(cb);
        }
        retained.pop();
        let replacement = callback();
        assert!(reg.on("e", &replacement));
    }

    #[test]
    fn off_removes_by_identity() {
        let reg = HandlerRegistry::new();
        let a = callback();
        let b = callback();
        reg.on("e", &a);
        reg.on("e", &b);
        reg.off("e", &a);
        assert_eq!(reg.live_handlers_for("e"), 1);
        // `b` survives.
        reg.off("e", &b);
        assert_eq!(reg.live_handlers_for("e"), 0);
    }

    #[test]
    fn remove_all_single_event() {
        let reg = HandlerRegistry::new();
        let a = callback();
        let b = callback();
        reg.on("x", &a);
        reg.on("y", &b);
        reg.remove_all(Some("x"));
        assert_eq!(reg.live_handlers_for("x"), 0);
        assert_eq!(reg.live_handlers_for("y"), 1);
        reg.remove_all(None);
        assert_eq!(reg.live_handlers(), 0);
    }

    #[test]
    fn event_types_counts_live_events() {
        let reg = HandlerRegistry::new();
        let a = callback();
        let b = callback();
        reg.on("x", &a);
        reg.on("y", &b);
        assert_eq!(reg.event_types(), 2);
        drop(b);
        assert_eq!(reg.event_types(), 1);
    }

    #[test]
    fn reap_counts_dead_entries() {
        let reg = HandlerRegistry::new();
        let a = callback();
        let b = callback();
        reg.on("x", &a);
        reg.on("x", &b);
        drop(a);
        assert_eq!(reg.reap(), 1);
        assert_eq!(reg.reap(), 0);
    }
}
