//! End-to-end encrypted RPC dispatch.
//!
//! Handlers register under `scope:method` keys. Inbound requests arrive with
//! ciphertext params; the dispatcher decrypts, invokes the handler with a
//! cancellation token, and encrypts the reply. Lookup misses are classified
//! by the method prefix: a plausibly session-scoped method yields the
//! structured `SESSION_NOT_ACTIVE` error that drives revival upstream.

pub mod codes;
pub mod dispatcher;

pub use dispatcher::{HandlerError, RpcDispatcher, RpcHandlerFn};
