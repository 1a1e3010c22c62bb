//! Tether - resilient streaming transport for chat sessions.
//!
//! This crate keeps a single logical chat session alive over an unreliable
//! WebSocket connection, reassembles the server-streamed assistant response
//! into one coherent de-duplicated message, and correlates the asynchronous
//! control operations (history, file upload/list/content, abort) that share
//! the socket.
//!
//! # Architecture
//!
//! ```text
//! Engine (facade)
//!     ├── supervisor  - socket lifecycle: connect, reconnect budget, heartbeat
//!     ├── envelope    - stateless wire codec, typed frame routing
//!     ├── correlation - pending request table with deadline sweeps
//!     ├── reassembly  - Idle → Accumulating → Finalizing turn state machine
//!     └── events      - replay-free broadcast of typed EngineEvents
//! ```
//!
//! The application layer issues commands through [`Engine`] and consumes
//! [`EngineEvent`]s plus [`ConnectionSnapshot`]s; it never reaches into
//! engine state directly.
//!
//! # Modules
//!
//! - [`engine`] - public command surface
//! - [`supervisor`] - per-session background task (crate-private)
//! - [`envelope`] - wire envelope codec
//! - [`correlation`] - outstanding-request table
//! - [`reassembly`] - streaming-turn reassembler
//! - [`events`] - event types and fan-out bus
//! - [`state`] - observable connection snapshot
//! - [`ws`] - raw WebSocket plumbing

// Library modules
pub mod config;
pub mod correlation;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod reassembly;
pub mod state;
pub mod ws;

mod supervisor;

// Re-export commonly used types
pub use config::EngineConfig;
pub use correlation::{CorrelationTable, PendingRequest, RequestKind};
pub use engine::{ControlRequest, Engine, MessageOptions};
pub use envelope::{Envelope, EnvelopeMetadata, FilePayload, ServerFrame};
pub use error::EngineError;
pub use events::{EngineEvent, EventBus};
pub use reassembly::{CompletionOutcome, FragmentOutcome, StreamReassembler};
pub use state::{ConnectionSnapshot, ConnectionStatus, SharedSnapshot};
