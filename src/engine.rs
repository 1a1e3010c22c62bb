//! Engine facade - the public command surface.
//!
//! One `Engine` owns one logical chat session. `connect()` opens the socket
//! and spawns the supervisor task; commands are typed methods that build
//! wire envelopes and dispatch them to the task; output arrives on the
//! event bus (`subscribe()`) and in the connection snapshot (`snapshot()`).
//!
//! # Usage
//!
//! ```ignore
//! let mut engine = Engine::new(config)?;
//! let mut events = engine.subscribe();
//!
//! engine.connect().await?;
//! engine.send_message("Hi", MessageOptions::default()).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         EngineEvent::PartialMessage { stream_id, text } => { /* replace bubble */ }
//!         EngineEvent::MessageComplete { stream_id, text } => { /* finalize bubble */ }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! Transport failures never surface as errors here: a send only fails if it
//! could not be dispatched (not connected, engine closed). Whether the
//! streamed reply ever arrives is visible only on the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::correlation::RequestKind;
use crate::envelope::{
    Envelope, FilePayload, KIND_CHAT_MESSAGE, KIND_CONTROL, KIND_FILE_LIST, KIND_FILE_REQUEST,
    KIND_FILE_UPLOAD,
};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::state::{ConnectionSnapshot, ConnectionStatus, SharedSnapshot};
use crate::supervisor::{self, Command};
use crate::ws;

/// Control operations accepted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Stop the in-flight generation. The local turn is discarded first.
    Abort,
    /// Clear the server-side conversation history.
    ClearHistory,
    /// Fetch the conversation history. Correlated; may resolve through a
    /// status-only response that carries no id.
    GetHistory,
    /// Fetch server-side session status. Correlated.
    GetStatus,
}

impl ControlRequest {
    /// Wire name of the request.
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::ClearHistory => "clear_history",
            Self::GetHistory => "get_history",
            Self::GetStatus => "get_status",
        }
    }

    /// Correlation kind, for requests that expect a response. Abort and
    /// clear-history are fire-and-forget.
    fn correlation(self) -> Option<RequestKind> {
        match self {
            Self::Abort | Self::ClearHistory => None,
            Self::GetHistory => Some(RequestKind::GetHistory),
            Self::GetStatus => Some(RequestKind::GetStatus),
        }
    }
}

/// Options attached to an outgoing chat message.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    /// Opaque metadata forwarded to the server under `options`.
    pub metadata: Option<Value>,
}

/// The resilient streaming transport engine for one chat session.
pub struct Engine {
    config: EngineConfig,
    snapshot: Arc<SharedSnapshot>,
    bus: EventBus,
    command_tx: Option<mpsc::UnboundedSender<Command>>,
    shutdown: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("url", &self.config.url)
            .field("active", &self.command_tx.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine for one logical session.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Connection` if the configuration is invalid.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            snapshot: SharedSnapshot::new(Uuid::new_v4().to_string()),
            bus: EventBus::new(),
            command_tx: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            task: None,
        })
    }

    /// Subscribe to the event stream. No replay: only events emitted after
    /// this call are delivered. Re-derive current state from [`Engine::snapshot`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Get a copy of the current connection snapshot.
    pub async fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.get().await
    }

    /// Open the socket and start the session.
    ///
    /// Performs the initial open inline, bounded by `config.timeout`, then
    /// hands the socket to the supervisor task. Later unexpected closes are
    /// retried automatically within the reconnect budget; an initial open
    /// failure is not.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Connection` if an attempt is already active or
    /// the open fails within the bound.
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        match self.snapshot.status().await {
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
            status => {
                return Err(EngineError::Connection(format!(
                    "connect() while already {status:?}"
                )));
            }
        }

        // The previous supervisor may still be winding down after a
        // disconnect(); let it finish so its teardown cannot overwrite the
        // new session's status. The status gate above guarantees it has
        // already been told to stop.
        if let Some(handle) = self.task.take() {
            let _ = handle.await;
        }

        // A fresh Connection: counters restart with the session.
        self.snapshot
            .update(|s| {
                s.status = ConnectionStatus::Connecting;
                s.session_id = None;
                s.connected_at = None;
                s.messages_sent = 0;
                s.messages_received = 0;
                s.reconnect_count = 0;
            })
            .await;
        self.bus.emit(EngineEvent::Connecting);

        let socket = match ws::connect(&self.config.url, self.config.timeout).await {
            Ok(socket) => socket,
            Err(e) => {
                self.snapshot.set_status(ConnectionStatus::Error).await;
                let message = format!("{e:#}");
                self.bus.emit(EngineEvent::ConnectionError {
                    message: message.clone(),
                });
                return Err(EngineError::Connection(message));
            }
        };

        let session_id = Uuid::new_v4().to_string();
        self.snapshot
            .update(|s| {
                s.status = ConnectionStatus::Connected;
                s.session_id = Some(session_id.clone());
                s.connected_at = Some(Utc::now());
            })
            .await;
        self.bus.emit(EngineEvent::Connected { session_id });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        self.command_tx = Some(command_tx);
        self.shutdown = Arc::clone(&shutdown);

        self.task = Some(tokio::spawn(supervisor::run_session(
            self.config.clone(),
            Arc::clone(&self.snapshot),
            self.bus.clone(),
            command_rx,
            shutdown,
            socket,
        )));

        Ok(())
    }

    /// Tear the session down: stop the heartbeat, cancel any scheduled
    /// reconnect, expire all pending requests, and discard the in-flight
    /// turn. Idempotent, and safe to call from within an event handler.
    pub async fn disconnect(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = self.command_tx.take() {
            if tx.send(Command::Shutdown).is_err() {
                // Supervisor already gone (budget exhausted); publish the
                // terminal state ourselves.
                self.bus.emit(EngineEvent::Disconnected);
            }
        }
        self.snapshot
            .update(|s| {
                s.status = ConnectionStatus::Disconnected;
                s.session_id = None;
                s.connected_at = None;
            })
            .await;
    }

    /// Send a chat message to the assistant.
    ///
    /// # Errors
    ///
    /// Fails only if dispatch fails (`NotConnected`, `Closed`) - never
    /// because the streamed reply does not arrive.
    pub async fn send_message(
        &self,
        text: &str,
        options: MessageOptions,
    ) -> Result<(), EngineError> {
        let mut data = json!({ "text": text });
        if let Some(metadata) = options.metadata {
            data["options"] = metadata;
        }
        let envelope = Envelope::command(KIND_CHAT_MESSAGE, data);
        self.dispatch(Command::Send {
            envelope,
            correlate: None,
        })
        .await
    }

    /// Send a control request. Returns the request id; correlated requests
    /// answer on the bus as `ControlResponse` or time out as
    /// `CommunicationError { code: "timeout" }`.
    pub async fn send_control(&self, request: ControlRequest) -> Result<String, EngineError> {
        let envelope = Envelope::command(KIND_CONTROL, json!({ "request": request.as_wire() }));
        let request_id = envelope.id.clone().expect("command envelopes carry an id");

        let command = if request == ControlRequest::Abort {
            Command::Abort { envelope }
        } else {
            Command::Send {
                envelope,
                correlate: request.correlation(),
            }
        };

        self.dispatch(command).await?;
        Ok(request_id)
    }

    /// Upload files to the session. Payloads without inline `data` reference
    /// files already sent over the HTTP multipart channel.
    pub async fn upload_files(&self, files: Vec<FilePayload>) -> Result<String, EngineError> {
        let envelope = Envelope::command(KIND_FILE_UPLOAD, json!({ "files": files }));
        let request_id = envelope.id.clone().expect("command envelopes carry an id");
        self.dispatch(Command::Send {
            envelope,
            correlate: Some(RequestKind::FileUpload),
        })
        .await?;
        Ok(request_id)
    }

    /// List the files attached to the session.
    pub async fn list_files(&self) -> Result<String, EngineError> {
        let envelope = Envelope::command(KIND_FILE_LIST, json!({}));
        let request_id = envelope.id.clone().expect("command envelopes carry an id");
        self.dispatch(Command::Send {
            envelope,
            correlate: Some(RequestKind::FileList),
        })
        .await?;
        Ok(request_id)
    }

    /// Retrieve one file's content, optionally base64-encoded.
    pub async fn request_file(
        &self,
        file_name: &str,
        as_base64: bool,
    ) -> Result<String, EngineError> {
        let envelope = Envelope::command(
            KIND_FILE_REQUEST,
            json!({ "name": file_name, "as_base64": as_base64 }),
        );
        let request_id = envelope.id.clone().expect("command envelopes carry an id");
        self.dispatch(Command::Send {
            envelope,
            correlate: Some(RequestKind::FileRequest),
        })
        .await?;
        Ok(request_id)
    }

    /// Fail fast while not connected, then hand the command to the task.
    async fn dispatch(&self, command: Command) -> Result<(), EngineError> {
        if !self.snapshot.is_connected().await {
            return Err(EngineError::NotConnected);
        }
        let tx = self.command_tx.as_ref().ok_or(EngineError::NotConnected)?;
        tx.send(command).map_err(|_| EngineError::Closed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(Command::Shutdown);
        }
    }
}
