//! Resumable event-stream modules.
//!
//! - `client`: HTTP stream transport, liveness checks, and reconnect handling.
//! - `codec`: incremental frame decoder for the text event stream.
//! - `proto`: wire records, outbound request body, and consumer event types.
//! - `session`: resume state (conversation, cursor, attempts) kept across
//!   physical connections.

/// HTTP stream transport and its configuration.
pub mod client;
/// Frame decoder.
pub mod codec;
pub(crate) mod listener;
/// Stream protocol types.
pub mod proto;
/// Resume state carried across reconnects.
pub mod session;

pub use client::{
    ConfigError, ConnectionState, ErrorKind, StreamTransport, TransportConfig, TransportDefaults,
    TransportError,
};
pub use listener::Subscription;
pub use proto::{EventKind, StreamEvent};
