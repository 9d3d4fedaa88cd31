//! Wire protocol types for the Happy client-server channel.
//!
//! Defines the socket frame envelope, typed payloads for every frame the
//! client exchanges with the coordination server, protocol constants, and
//! session-id validation helpers.

pub mod constants;
pub mod frame;
pub mod messages;
pub mod types;

pub use constants::close_reason;
pub use frame::Frame;
pub use types::{ClientType, Credential};
