//! Wire error codes carried inside encrypted RPC responses.

/// The request params (or a nested payload) could not be decrypted.
pub const DECRYPTION_FAILED: &str = "DECRYPTION_FAILED";

/// No handler for a method whose prefix is not a plausible session id.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";

/// No handler for a session-scoped method; the session is not hosted here.
/// Triggers the revival flow in the machine client.
pub const SESSION_NOT_ACTIVE: &str = "SESSION_NOT_ACTIVE";

/// The request was cancelled while in flight.
pub const OPERATION_CANCELLED: &str = "OPERATION_CANCELLED";

/// Revival was attempted for the target session and failed.
pub const SESSION_REVIVAL_FAILED: &str = "SESSION_REVIVAL_FAILED";

/// Method prefixes at least this long are treated as session ids when
/// classifying a lookup miss.
pub const SESSION_SCOPE_MIN_LEN: usize = 32;
