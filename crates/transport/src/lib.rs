//! WebSocket transport for the Happy client-server channel.
//!
//! One [`Transport`] per endpoint: it owns the credential, the bounded event
//! handler registry, the pending-acknowledgement table, and the reconnect
//! loop. Each physical connection is a [`socket::Socket`] running three
//! pumps (read, write, keepalive) that feed inbound frames back into the
//! shared state.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod socket;
pub mod transport;

pub(crate) mod acks;
pub(crate) mod pumps;
pub(crate) mod reconnect;

pub use config::{ReconnectConfig, TransportConfig};
pub use error::SocketError;
pub use handlers::EventCallback;
pub use metrics::TransportMetrics;
pub use socket::{RpcRequestHandler, RpcResponder};
pub use transport::{ConnectionState, Transport};
