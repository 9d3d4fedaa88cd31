//! Transport configuration and the reconnection backoff schedule.

use std::time::Duration;

use rand::Rng;

use happy_protocol::constants::{
    ACK_TIMEOUT, CONNECT_TIMEOUT, RECONNECTION_DELAY, RECONNECTION_DELAY_MAX,
    RECONNECTION_DELAY_MIN, RECONNECTION_JITTER_FACTOR,
};

use crate::error::SocketError;

/// Configuration for one transport endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server base URL (`http(s)://` or `ws(s)://`).
    pub base_url: String,
    /// WebSocket path appended to the base URL.
    pub path: String,
    /// Default wait for an acknowledgement.
    pub ack_timeout: Duration,
    /// Wait for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// How long `flush()` yields.
    pub flush_delay: Duration,
    /// Optional `X-Correlation-ID` header value.
    pub correlation_id: Option<String>,
    pub reconnect: ReconnectConfig,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: "/v1/updates".into(),
            ack_timeout: ACK_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            flush_delay: Duration::from_millis(10),
            correlation_id: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnection backoff with centered jitter.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay; doubles per attempt.
    pub delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Jitter spread: the delay multiplier is uniform on
    /// `[1 − factor, 1 + factor]`.
    pub jitter_factor: f64,
    /// Give up (emitting `reconnect_failed`) after this many attempts.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: RECONNECTION_DELAY,
            max_delay: RECONNECTION_DELAY_MAX,
            jitter_factor: RECONNECTION_JITTER_FACTOR,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `k` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::thread_rng().gen_range(0.0..1.0))
    }

    /// Deterministic variant: `random` must be in `[0, 1)`.
    ///
    /// `base = min(delay · 2^k, max_delay)`, multiplied by
    /// `1 − factor + random · factor · 2`, floored at 100 ms.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let exp = attempt.min(31) as i32;
        let base = (self.delay.as_millis() as f64 * 2f64.powi(exp))
            .min(self.max_delay.as_millis() as f64);
        let mult = 1.0 - self.jitter_factor + random * self.jitter_factor * 2.0;
        let floor = RECONNECTION_DELAY_MIN.as_millis() as f64;
        Duration::from_millis((base * mult).max(floor) as u64)
    }
}

/// Derives the WebSocket URL from a base URL and path. Credentials are
/// carried in handshake headers only and never appear here.
pub fn websocket_url(base: &str, path: &str) -> Result<String, SocketError> {
    let (scheme, rest) = base
        .split_once("://")
        .ok_or_else(|| SocketError::InvalidEndpoint(base.to_string()))?;
    let ws_scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(SocketError::InvalidEndpoint(base.to_string())),
    };
    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        return Err(SocketError::InvalidEndpoint(base.to_string()));
    }
    let sep = if path.starts_with('/') { "" } else { "/" };
    Ok(format!("{ws_scheme}://{host}{sep}{path}"))
}
