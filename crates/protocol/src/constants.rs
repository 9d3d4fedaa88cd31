use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire event names
// ---------------------------------------------------------------------------

/// Server-to-client RPC request (acknowledged).
pub const EVENT_RPC_REQUEST: &str = "rpc-request";
/// Client-to-server RPC response frame.
pub const EVENT_RPC_RESPONSE: &str = "rpc-response";
/// Server-to-client cancellation of an in-flight RPC.
pub const EVENT_RPC_CANCEL: &str = "rpc-cancel";
/// Client-to-server registration of an RPC method.
pub const EVENT_RPC_REGISTER: &str = "rpc-register";

/// Encrypted session message (client to server).
pub const EVENT_MESSAGE: &str = "message";
/// Server push carrying a state or metadata change.
pub const EVENT_UPDATE: &str = "update";
/// Best-effort server notification (activity/usage pings).
pub const EVENT_EPHEMERAL: &str = "ephemeral";

/// Session state CAS update (acknowledged).
pub const EVENT_UPDATE_STATE: &str = "update-state";
/// Session metadata CAS update (acknowledged).
pub const EVENT_UPDATE_METADATA: &str = "update-metadata";
/// Machine daemon-state CAS update (acknowledged).
pub const EVENT_MACHINE_UPDATE_STATE: &str = "machine-update-state";
/// Machine metadata CAS update (acknowledged).
pub const EVENT_MACHINE_UPDATE_METADATA: &str = "machine-update-metadata";

/// Volatile session keepalive.
pub const EVENT_SESSION_ALIVE: &str = "session-alive";
/// Volatile machine keepalive.
pub const EVENT_MACHINE_ALIVE: &str = "machine-alive";
/// Normalized token/cost usage report.
pub const EVENT_USAGE_REPORT: &str = "usage-report";

/// Broadcast after a session was respawned under a new id.
pub const EVENT_SESSION_REVIVED: &str = "session-revived";
/// Broadcast when the revival circuit breaker rejects an attempt.
pub const EVENT_SESSION_REVIVAL_PAUSED: &str = "session-revival-paused";

// Local lifecycle events dispatched to the handler registry; never on the wire.
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_RECONNECT_ATTEMPT: &str = "reconnect_attempt";
pub const EVENT_RECONNECT_FAILED: &str = "reconnect_failed";

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Default wait for an acknowledgement before an emit fails.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the WebSocket handshake to complete.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Initial reconnection delay (doubles per attempt).
pub const RECONNECTION_DELAY: Duration = Duration::from_secs(1);

/// Reconnection delay cap.
pub const RECONNECTION_DELAY_MAX: Duration = Duration::from_secs(30);

/// Jitter spread applied to reconnection delays (0.5 = uniform on
/// [0.5·base, 1.5·base]).
pub const RECONNECTION_JITTER_FACTOR: f64 = 0.5;

/// Hard floor for any reconnection delay.
pub const RECONNECTION_DELAY_MIN: Duration = Duration::from_millis(100);

/// How often the transport sends protocol-level pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(25);

/// Read deadline: a connection with no inbound traffic for this long is dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Session keepalive cadence.
pub const SESSION_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Machine keepalive base cadence; a uniform jitter is added on top.
pub const MACHINE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Upper bound of the machine keepalive jitter.
pub const MACHINE_KEEPALIVE_JITTER: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Handler registry bounds
// ---------------------------------------------------------------------------

/// Maximum live callbacks per event; further registrations are rejected.
pub const MAX_HANDLERS_PER_EVENT: usize = 100;

/// Live-handler count at which a single warning is logged.
pub const HANDLER_WARNING_THRESHOLD: usize = 90;

// ---------------------------------------------------------------------------
// Session revival
// ---------------------------------------------------------------------------

/// Default time allowed for a session respawn.
pub const SESSION_REVIVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default revival attempts per session before giving up.
pub const MAX_REVIVAL_ATTEMPTS_PER_SESSION: u32 = 3;

/// Sliding window over which revival failures are counted.
pub const REVIVAL_FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// Failures within the window that trip the circuit breaker.
pub const REVIVAL_FAILURE_THRESHOLD: usize = 10;

/// How long the circuit breaker pauses revivals once tripped.
pub const REVIVAL_COOLDOWN: Duration = Duration::from_secs(60);

/// Polling step while waiting for a revived session's handlers.
pub const HANDLER_READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the handler-ready wait; after this the replay proceeds
/// anyway.
pub const HANDLER_READY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

/// Maps a WebSocket close code to the disconnect reason reported to local
/// handlers.
pub fn close_reason(code: Option<u16>) -> String {
    match code {
        Some(1000) => "io client disconnect".into(),
        Some(1001) => "transport close".into(),
        Some(1006) | None => "transport error".into(),
        Some(4000) => "io server disconnect".into(),
        Some(n) => format!("transport close (code: {n})"),
    }
}
