//! Credential and scope identity types.

use serde::{Deserialize, Serialize};

/// Which endpoint a connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    #[serde(rename = "session-scoped")]
    SessionScoped,
    #[serde(rename = "machine-scoped")]
    MachineScoped,
}

impl ClientType {
    /// The value carried in the `X-Client-Type` handshake header.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::SessionScoped => "session-scoped",
            ClientType::MachineScoped => "machine-scoped",
        }
    }
}

/// Bearer credential for one connection. Immutable once the connection is
/// established; carried only in handshake headers, never in the URL.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub client_type: ClientType,
    pub session_id: Option<String>,
    pub machine_id: Option<String>,
}

impl Credential {
    /// Credential for a session-scoped connection.
    pub fn session(token: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_type: ClientType::SessionScoped,
            session_id: Some(session_id.into()),
            machine_id: None,
        }
    }

    /// Credential for a machine-scoped connection.
    pub fn machine(token: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_type: ClientType::MachineScoped,
            session_id: None,
            machine_id: Some(machine_id.into()),
        }
    }
}

/// Returns `true` for a well-formed session id: a UUID (8-4-4-4-12 hex
/// groups) or a bare 32-character hex string.
pub fn is_valid_session_id(id: &str) -> bool {
    is_uuid(id) || is_hex32(id)
}

/// Canonicalizes a session id to lowercase. Hyphenation is preserved; a
/// malformed id yields `None`.
pub fn normalize_session_id(id: &str) -> Option<String> {
    if is_valid_session_id(id) {
        Some(id.to_ascii_lowercase())
    } else {
        None
    }
}

fn is_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

fn is_hex32(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
