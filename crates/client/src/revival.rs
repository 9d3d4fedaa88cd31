//! Revival bookkeeping: per-session attempt caps and the global
//! sliding-window circuit breaker.
//!
//! The machine client drives the actual respawn; this module owns the
//! counters, the failure window, the cooldown deadline, and the in-flight
//! deduplication map.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::time::Instant;

use happy_protocol::constants::{
    MAX_REVIVAL_ATTEMPTS_PER_SESSION, REVIVAL_COOLDOWN, REVIVAL_FAILURE_THRESHOLD,
    REVIVAL_FAILURE_WINDOW, SESSION_REVIVAL_TIMEOUT,
};

/// Environment variable overriding the spawn timeout, in milliseconds.
pub const ENV_REVIVAL_TIMEOUT: &str = "HAPPY_SESSION_REVIVAL_TIMEOUT";
/// Environment variable overriding the per-session attempt cap.
pub const ENV_REVIVAL_MAX_ATTEMPTS: &str = "HAPPY_SESSION_REVIVAL_MAX_ATTEMPTS";

/// Revival tunables, read once at construction.
#[derive(Debug, Clone)]
pub struct RevivalConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for RevivalConfig {
    fn default() -> Self {
        Self {
            timeout: SESSION_REVIVAL_TIMEOUT,
            max_attempts: MAX_REVIVAL_ATTEMPTS_PER_SESSION,
        }
    }
}

impl RevivalConfig {
    /// Reads the environment tunables, falling back to defaults on missing
    /// or invalid values.
    pub fn from_env() -> Self {
        Self {
            timeout: parse_timeout_ms(std::env::var(ENV_REVIVAL_TIMEOUT).ok().as_deref()),
            max_attempts: parse_max_attempts(
                std::env::var(ENV_REVIVAL_MAX_ATTEMPTS).ok().as_deref(),
            ),
        }
    }
}

fn parse_timeout_ms(raw: Option<&str>) -> Duration {
    match raw.and_then(|s| s.trim().parse::<u64>().ok()) {
        Some(ms) => Duration::from_millis(ms),
        None => SESSION_REVIVAL_TIMEOUT,
    }
}

fn parse_max_attempts(raw: Option<&str>) -> u32 {
    match raw.and_then(|s| s.trim().parse::<u32>().ok()) {
        Some(n) if n > 0 => n,
        _ => MAX_REVIVAL_ATTEMPTS_PER_SESSION,
    }
}

/// Outcome of one revival attempt, shared verbatim with every deduplicated
/// caller and serialized into `SESSION_REVIVAL_FAILED` responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevivalResult {
    pub revived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    pub original_session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub command_replayed: bool,
}

impl RevivalResult {
    pub fn failed(scope: &str, error: impl Into<String>) -> Self {
        Self {
            revived: false,
            new_session_id: None,
            original_session_id: scope.to_string(),
            error: Some(error.into()),
            command_replayed: false,
        }
    }
}

/// The circuit breaker tripped; carries what to report.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CooldownTrip {
    pub(crate) failure_count: usize,
}

pub(crate) type SharedRevival = Shared<BoxFuture<'static, RevivalResult>>;

pub(crate) struct RevivalController {
    pub(crate) config: RevivalConfig,
    attempts: Mutex<HashMap<String, u32>>,
    failures: Mutex<VecDeque<Instant>>,
    cooldown_until: Mutex<Option<Instant>>,
    /// One `session-revival-paused` broadcast per breaker trip.
    paused_notified: AtomicBool,
    pub(crate) in_flight: tokio::sync::Mutex<HashMap<String, SharedRevival>>,
    pub(crate) attempted: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) failed: AtomicU64,
}

impl RevivalController {
    pub(crate) fn new(config: RevivalConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            cooldown_until: Mutex::new(None),
            paused_notified: AtomicBool::new(false),
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Remaining cooldown, when the breaker is open.
    pub(crate) fn cooldown_remaining(&self) -> Option<Duration> {
        let guard = self.cooldown_until.lock().ok()?;
        let until = (*guard)?;
        let now = Instant::now();
        if now < until { Some(until - now) } else { None }
    }

    /// `true` for the first rejection of the current trip; later rejections
    /// stay quiet.
    pub(crate) fn should_notify_paused(&self) -> bool {
        !self.paused_notified.swap(true, Ordering::SeqCst)
    }

    /// Drops failure timestamps that fell out of the sliding window.
    pub(crate) fn prune_window(&self) {
        if let Ok(mut failures) = self.failures.lock()
            && let Some(cutoff) = Instant::now().checked_sub(REVIVAL_FAILURE_WINDOW)
        {
            while failures.front().is_some_and(|t| *t < cutoff) {
                failures.pop_front();
            }
        }
    }

    pub(crate) fn attempts_for(&self, scope: &str) -> u32 {
        self.attempts
            .lock()
            .map(|map| map.get(scope).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub(crate) fn increment_attempts(&self, scope: &str) {
        if let Ok(mut map) = self.attempts.lock() {
            *map.entry(scope.to_string()).or_insert(0) += 1;
        }
    }

    pub(crate) fn clear_attempts(&self, scope: &str) {
        if let Ok(mut map) = self.attempts.lock() {
            map.remove(scope);
        }
    }

    /// Records a failure timestamp. When the window reaches the threshold,
    /// opens the breaker and reports the trip.
    pub(crate) fn record_failure(&self) -> Option<CooldownTrip> {
        let count = {
            let Ok(mut failures) = self.failures.lock() else {
                return None;
            };
            let now = Instant::now();
            failures.push_back(now);
            if let Some(cutoff) = now.checked_sub(REVIVAL_FAILURE_WINDOW) {
                while failures.front().is_some_and(|t| *t < cutoff) {
                    failures.pop_front();
                }
            }
            failures.len()
        };
        if count >= REVIVAL_FAILURE_THRESHOLD {
            if let Ok(mut until) = self.cooldown_until.lock() {
                *until = Some(Instant::now() + REVIVAL_COOLDOWN);
            }
            self.paused_notified.store(false, Ordering::SeqCst);
            Some(CooldownTrip {
                failure_count: count,
            })
        } else {
            None
        }
    }

    /// Clears revival state. Called on shutdown.
    pub(crate) fn reset(&self) {
        if let Ok(mut map) = self.attempts.lock() {
            map.clear();
        }
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
        if let Ok(mut until) = self.cooldown_until.lock() {
            *until = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parsing_defaults_on_invalid() {
        assert_eq!(parse_timeout_ms(None), SESSION_REVIVAL_TIMEOUT);
        assert_eq!(parse_timeout_ms(Some("abc")), SESSION_REVIVAL_TIMEOUT);
        assert_eq!(parse_timeout_ms(Some("-5")), SESSION_REVIVAL_TIMEOUT);
        assert_eq!(parse_timeout_ms(Some("1500")), Duration::from_millis(1500));

        assert_eq!(parse_max_attempts(None), MAX_REVIVAL_ATTEMPTS_PER_SESSION);
        assert_eq!(
            parse_max_attempts(Some("0")),
            MAX_REVIVAL_ATTEMPTS_PER_SESSION
        );
        assert_eq!(
            parse_max_attempts(Some("nope")),
            MAX_REVIVAL_ATTEMPTS_PER_SESSION
        );
        assert_eq!(parse_max_attempts(Some("5")), 5);
    }

    #[test]
    fn attempt_counters_per_scope() {
        let c = RevivalController::new(RevivalConfig::default());
        assert_eq!(c.attempts_for("a"), 0);
        c.increment_attempts("a");
        c.increment_attempts("a");
        c.increment_attempts("b");
        assert_eq!(c.attempts_for("a"), 2);
        assert_eq!(c.attempts_for("b"), 1);
        c.clear_attempts("a");
        assert_eq!(c.attempts_for("a"), 0);
        assert_eq!(c.attempts_for("b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_trips_at_threshold_and_expires() {
        let c = RevivalController::new(RevivalConfig::default());
        for i in 0..REVIVAL_FAILURE_THRESHOLD {
            let trip = c.record_failure();
            if i + 1 < REVIVAL_FAILURE_THRESHOLD {
                assert!(trip.is_none(), "tripped early at {i}");
            } else {
                assert_eq!(trip.unwrap().failure_count, REVIVAL_FAILURE_THRESHOLD);
            }
        }
        assert!(c.cooldown_remaining().is_some());

        tokio::time::advance(REVIVAL_COOLDOWN + Duration::from_secs(1)).await;
        assert!(c.cooldown_remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_age_out_of_window() {
        let c = RevivalController::new(RevivalConfig::default());
        for _ in 0..REVIVAL_FAILURE_THRESHOLD - 1 {
            assert!(c.record_failure().is_none());
        }
        // Let the window slide past the earlier failures.
        tokio::time::advance(REVIVAL_FAILURE_WINDOW + Duration::from_secs(1)).await;
        assert!(c.record_failure().is_none());
        assert!(c.cooldown_remaining().is_none());
    }

    #[test]
    fn paused_notification_once_per_trip() {
        let c = RevivalController::new(RevivalConfig::default());
        for _ in 0..REVIVAL_FAILURE_THRESHOLD {
            c.record_failure();
        }
        assert!(c.should_notify_paused());
        assert!(!c.should_notify_paused());

        // A new trip re-arms the notification.
        for _ in 0..REVIVAL_FAILURE_THRESHOLD {
            c.record_failure();
        }
        assert!(c.should_notify_paused());
    }

    #[test]
    fn revival_result_serialization() {
        let result = RevivalResult::failed("bb6c", "boom");
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["revived"], false);
        assert_eq!(v["originalSessionId"], "bb6c");
        assert_eq!(v["error"], "boom");
        assert!(v.get("newSessionId").is_none());
    }
}
