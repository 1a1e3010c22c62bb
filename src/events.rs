//! Typed event stream - the engine's public output.
//!
//! All domain events (connection lifecycle, message fragments/completions,
//! tool events, control responses, errors) fan out through a single
//! `broadcast` channel. Delivery is replay-free: a consumer that subscribes
//! after an event fired will not receive it retroactively, and always
//! re-derives current state from the latest
//! [`ConnectionSnapshot`](crate::state::ConnectionSnapshot) instead.
//!
//! # Architecture
//!
//! ```text
//! Supervisor ──broadcast::Sender<EngineEvent>──> subscriber 1
//!                                           └──> subscriber 2 …
//! ```
//!
//! Delivery order to each subscriber matches emission order.

use serde_json::Value;
use tokio::sync::broadcast;

/// Fan-out capacity per subscriber before the slowest one starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event emitted by the engine to the application layer.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Opening the socket.
    Connecting,
    /// The socket is up; a new session generation begins.
    Connected {
        /// Identity of the new socket generation.
        session_id: String,
    },
    /// An automatic reconnect attempt is about to run.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Configured attempt budget.
        max_attempts: u32,
    },
    /// The session was torn down by `disconnect()`.
    Disconnected,
    /// The socket could not be (re)established; terminal until `connect()`.
    ConnectionError {
        /// Human-readable failure description.
        message: String,
    },
    /// The in-flight assistant turn grew.
    ///
    /// Carries the *full* accumulated text so consumers replace-by-id
    /// rather than append, which avoids double-rendering after a
    /// mid-stream resubscribe.
    PartialMessage {
        /// Stable turn identity across all partials and the completion.
        stream_id: String,
        /// Full accumulated text so far.
        text: String,
    },
    /// The assistant turn finalized.
    MessageComplete {
        /// Same id the partials carried.
        stream_id: String,
        /// Reconciled final text.
        text: String,
    },
    /// The assistant invoked a tool.
    ToolCall {
        /// Correlation id, if the server attached one.
        id: Option<String>,
        /// Tool name.
        name: String,
        /// Tool arguments.
        arguments: Value,
    },
    /// A tool produced a result.
    ToolResult {
        /// Correlation id, if the server attached one.
        id: Option<String>,
        /// Tool name, if reported.
        name: Option<String>,
        /// Tool output.
        output: Value,
    },
    /// A control request was answered (history payloads included).
    ControlResponse {
        /// Id of the pending request this resolved, when one matched.
        request_id: Option<String>,
        /// Which control request this answers, as reported by the server.
        request: Option<String>,
        /// Full response payload.
        payload: Value,
    },
    /// A file upload was acknowledged.
    FileUploadResponse {
        /// Id of the pending request this resolved.
        request_id: Option<String>,
        /// Full response payload.
        payload: Value,
    },
    /// A file listing arrived.
    FileListResponse {
        /// Id of the pending request this resolved.
        request_id: Option<String>,
        /// Full response payload.
        payload: Value,
    },
    /// Requested file content arrived.
    FileContent {
        /// Id of the pending request this resolved.
        request_id: Option<String>,
        /// Full response payload.
        payload: Value,
    },
    /// A recoverable communication failure (request timeout, server error).
    CommunicationError {
        /// Machine-readable code (`timeout`, or a server-provided code).
        code: String,
        /// Human-readable message.
        message: String,
    },
}

/// Replay-free fan-out publisher for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events emitted from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// Emitting with no subscribers is not an error; the event is simply
    /// dropped, matching the bus's no-buffering contract.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
