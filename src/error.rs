//! Error taxonomy for the transport engine.
//!
//! Transport-level failures are surfaced as connection-state events on the
//! bus, not as errors thrown into arbitrary call sites. The variants here
//! cover the cases a caller can actually hit: dispatching a command while
//! not connected, an open/handshake failure, a correlated request timing
//! out, or a malformed envelope.
//!
//! Duplicate delivery is not an error at all. The reassembler absorbs
//! duplicates through its typed outcomes and never reports them upward.

/// Errors that can occur during engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// Failed to establish or keep the socket (open/handshake failure).
    Connection(String),
    /// A correlated request received no response within its bound.
    Timeout,
    /// Malformed or unparseable wire envelope.
    Protocol(String),
    /// A command was issued while the session is not connected.
    NotConnected,
    /// The engine was shut down and can no longer accept commands.
    Closed,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "Connection failed: {msg}"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Closed => write!(f, "Engine closed"),
        }
    }
}

impl std::error::Error for EngineError {}
