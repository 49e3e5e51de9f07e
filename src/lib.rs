//! Resumable client transport for server-pushed event streams.
//!
//! The crate is organized by concern:
//! - `stream`: HTTP stream transport, frame decoding, protocol types, and
//!   resume state.
//! - `retry`: backoff policy and timeout utilities.

/// Backoff and timeout helpers used by the transport.
pub mod retry;
/// Stream transport, protocol types, and session state.
pub mod stream;

pub use stream::{
    ConfigError, ConnectionState, ErrorKind, EventKind, StreamEvent, StreamTransport,
    Subscription, TransportConfig, TransportError,
};
