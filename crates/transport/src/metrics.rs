//! Transport gauges and counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cumulative counters shared across socket generations.
#[derive(Debug, Default)]
pub(crate) struct TransportCounters {
    pub(crate) memory_pressure: AtomicU64,
}

impl TransportCounters {
    pub(crate) fn record_memory_pressure(&self) {
        self.memory_pressure.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn memory_pressure_count(&self) -> u64 {
        self.memory_pressure.load(Ordering::Relaxed)
    }
}

/// Snapshot returned by `Transport::metrics()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMetrics {
    /// Live callbacks across all events.
    pub live_handlers: usize,
    /// Distinct event names with at least one live callback.
    pub event_types: usize,
    /// Acknowledgements currently awaiting a reply.
    pub pending_acks: usize,
    pub memory_pressure_count: u64,
    pub acks_cleaned_total: u64,
    pub handlers_rejected_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let c = TransportCounters::default();
        c.record_memory_pressure();
        c.record_memory_pressure();
        assert_eq!(c.memory_pressure_count(), 2);
    }

    #[test]
    fn metrics_serialize_camel_case() {
        let m = TransportMetrics {
            live_handlers: 3,
            event_types: 2,
            pending_acks: 1,
            memory_pressure_count: 0,
            acks_cleaned_total: 4,
            handlers_rejected_total: 5,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["liveHandlers"], 3);
        assert_eq!(v["acksCleanedTotal"], 4);
        assert_eq!(v["handlersRejectedTotal"], 5);
    }
}
