//! Socket supervisor - owns the socket lifecycle for one session.
//!
//! A single background task per session runs a `tokio::select!` loop over
//! the socket, the command channel from the engine facade, a heartbeat
//! timer, and a maintenance timer (correlation sweeps + silent-failure
//! detection). All engine-private mutable state - the correlation table,
//! the stream reassembler, the connection counters - lives inside this
//! task; frames are processed strictly in network-arrival order.
//!
//! # Lifecycle
//!
//! ```text
//! run_session(first socket)
//!     │
//!     ├── message_loop ──Shutdown──────> teardown (drain, reset, Disconnected)
//!     │        │
//!     │   ConnectionLost
//!     │        │
//!     │   expire pending, discard turn
//!     │        │
//!     └── reconnect (budgeted, fixed delay) ──> new socket ──> message_loop …
//!                  └──exhausted──> status Error, stop until connect()
//! ```
//!
//! Status transitions made here are the only authoritative source for the
//! connection's status; consumers must not infer state from message arrival.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::correlation::{CorrelationTable, RequestKind};
use crate::envelope::{Envelope, ServerFrame};
use crate::events::{EngineEvent, EventBus};
use crate::reassembly::{CompletionOutcome, FragmentOutcome, StreamReassembler};
use crate::state::{ConnectionStatus, SharedSnapshot};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Cadence of correlation sweeps and grace-window checks.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

/// Command sent from the engine facade to the supervisor task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Send an envelope, optionally registering a pending correlation entry.
    Send {
        /// Envelope to put on the wire.
        envelope: Envelope,
        /// Register the envelope's id under this kind before sending.
        correlate: Option<RequestKind>,
    },
    /// Discard the in-flight turn, then tell the server to stop generating.
    Abort {
        /// The `control { request: "abort" }` envelope.
        envelope: Envelope,
    },
    /// Tear the session down.
    Shutdown,
}

/// Why the per-connection message loop returned.
enum LoopExit {
    /// Shutdown was requested - exit permanently, no reconnection.
    Shutdown,
    /// The socket died - take the reconnect path.
    ConnectionLost,
}

/// Result of the budgeted reconnect phase.
enum ReconnectOutcome {
    /// A fresh socket is up.
    Connected(WsWriter, WsReader),
    /// Shutdown was requested while waiting.
    Shutdown,
    /// The attempt budget ran out; status is `Error`.
    Exhausted,
}

/// Run one session to completion.
///
/// `first_socket` was opened by `Engine::connect()`; the status is already
/// `Connected` when this task starts.
pub(crate) async fn run_session(
    config: EngineConfig,
    snapshot: Arc<SharedSnapshot>,
    bus: EventBus,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    shutdown: Arc<AtomicBool>,
    first_socket: (WsWriter, WsReader),
) {
    let mut table = CorrelationTable::new();
    let mut reassembler = StreamReassembler::new();
    let mut socket = Some(first_socket);

    while let Some((mut writer, mut reader)) = socket.take() {
        let exit = message_loop(
            &config,
            &snapshot,
            &bus,
            &mut command_rx,
            &shutdown,
            &mut table,
            &mut reassembler,
            &mut writer,
            &mut reader,
        )
        .await;

        match exit {
            LoopExit::Shutdown => {
                let _ = writer.close().await;
                teardown(&snapshot, &bus, &mut table, &mut reassembler).await;
                return;
            }
            LoopExit::ConnectionLost => {
                drop(writer);
                drop(reader);

                // Correlated replies cannot arrive on a successor socket.
                expire_after_loss(&bus, &mut table);
                // Fragments from a successor socket are a new generation.
                reassembler.reset();

                match reconnect(&config, &snapshot, &bus, &mut command_rx, &shutdown).await {
                    ReconnectOutcome::Connected(w, r) => socket = Some((w, r)),
                    ReconnectOutcome::Shutdown => {
                        teardown(&snapshot, &bus, &mut table, &mut reassembler).await;
                        return;
                    }
                    ReconnectOutcome::Exhausted => return,
                }
            }
        }
    }
}

/// Inner loop for a single socket generation.
#[allow(clippy::too_many_arguments)]
async fn message_loop(
    config: &EngineConfig,
    snapshot: &Arc<SharedSnapshot>,
    bus: &EventBus,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &Arc<AtomicBool>,
    table: &mut CorrelationTable,
    reassembler: &mut StreamReassembler,
    writer: &mut WsWriter,
    reader: &mut WsReader,
) -> LoopExit {
    let mut last_activity = Instant::now();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

    loop {
        if shutdown.load(Ordering::SeqCst) {
            log::info!("Shutdown requested, closing connection");
            return LoopExit::Shutdown;
        }

        tokio::select! {
            // Commands from the engine facade
            cmd = command_rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => {
                        log::info!("Shutdown signal received");
                        return LoopExit::Shutdown;
                    }
                    Some(Command::Send { envelope, correlate }) => {
                        if let Some(kind) = correlate {
                            if let Some(id) = envelope.id.clone() {
                                table.register(id, kind, config.timeout);
                            }
                        }
                        if let Err(e) = writer.send_text(&envelope.encode()).await {
                            log::error!("Failed to send {} envelope: {e}", envelope.kind);
                            return LoopExit::ConnectionLost;
                        }
                        snapshot.update(|s| s.messages_sent += 1).await;
                    }
                    Some(Command::Abort { envelope }) => {
                        // The aborted turn is left as whatever partial content
                        // was last emitted; no synthetic completion.
                        reassembler.reset();
                        if let Err(e) = writer.send_text(&envelope.encode()).await {
                            log::error!("Failed to send abort: {e}");
                            return LoopExit::ConnectionLost;
                        }
                        snapshot.update(|s| s.messages_sent += 1).await;
                    }
                }
            }

            // Frames from the socket, strictly in arrival order
            msg = reader.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_activity = Instant::now();
                        handle_frame(&text, snapshot, bus, table, reassembler).await;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        last_activity = Instant::now();
                        if writer.send_pong(data).await.is_err() {
                            log::warn!("Failed to send pong");
                            return LoopExit::ConnectionLost;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        last_activity = Instant::now();
                        log::debug!("Ignoring {}-byte binary frame", data.len());
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("WebSocket closed by server (code {code}: {reason})");
                        return LoopExit::ConnectionLost;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error: {e}");
                        return LoopExit::ConnectionLost;
                    }
                    None => {
                        log::info!("WebSocket stream ended");
                        return LoopExit::ConnectionLost;
                    }
                }
            }

            // Liveness probe
            _ = heartbeat.tick() => {
                if writer.send_text(&Envelope::ping().encode()).await.is_err() {
                    log::warn!("Failed to send heartbeat probe");
                    return LoopExit::ConnectionLost;
                }
            }

            // Correlation sweep + silent-failure detection
            _ = maintenance.tick() => {
                if last_activity.elapsed() > config.heartbeat_grace {
                    log::warn!(
                        "No traffic for {:?} (grace {:?}), treating connection as dead",
                        last_activity.elapsed(),
                        config.heartbeat_grace
                    );
                    return LoopExit::ConnectionLost;
                }
                for expired in table.sweep(Instant::now()) {
                    log::warn!("Request {} ({}) timed out", expired.request_id, expired.kind);
                    bus.emit(EngineEvent::CommunicationError {
                        code: "timeout".to_string(),
                        message: format!("{} request timed out", expired.kind),
                    });
                }
            }
        }
    }
}

/// Decode one text frame and dispatch it.
async fn handle_frame(
    text: &str,
    snapshot: &Arc<SharedSnapshot>,
    bus: &EventBus,
    table: &mut CorrelationTable,
    reassembler: &mut StreamReassembler,
) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("Dropping malformed envelope: {e}");
            return;
        }
    };
    let kind = envelope.kind.clone();

    let Some(frame) = ServerFrame::from_envelope(envelope) else {
        log::warn!("Dropping unrecognized envelope kind: {kind}");
        return;
    };

    if !matches!(frame, ServerFrame::Pong) {
        snapshot.update(|s| s.messages_received += 1).await;
    }

    match frame {
        ServerFrame::StreamFragment { text, sequence } => {
            match reassembler.fragment(&text, sequence) {
                FragmentOutcome::Accepted { stream_id, text } => {
                    bus.emit(EngineEvent::PartialMessage { stream_id, text });
                }
                FragmentOutcome::Duplicate => {
                    log::debug!("Suppressed duplicate fragment");
                }
            }
        }
        ServerFrame::StreamComplete { message_id, text } => {
            match reassembler.complete(&message_id, &text) {
                CompletionOutcome::Finalized { stream_id, text } => {
                    bus.emit(EngineEvent::MessageComplete { stream_id, text });
                }
                CompletionOutcome::Duplicate => {
                    log::debug!("Suppressed duplicate completion for {message_id}");
                }
            }
        }
        ServerFrame::ToolCall { id, name, arguments } => {
            bus.emit(EngineEvent::ToolCall { id, name, arguments });
        }
        ServerFrame::ToolResult { id, name, output } => {
            bus.emit(EngineEvent::ToolResult { id, name, output });
        }
        ServerFrame::ControlResponse { id, request, payload } => {
            let kind = request.as_deref().and_then(RequestKind::from_wire);
            if let ResponseRoute::Deliver(request_id) = resolve_pending(table, id, kind) {
                bus.emit(EngineEvent::ControlResponse {
                    request_id,
                    request,
                    payload,
                });
            }
        }
        ServerFrame::FileUploadResponse { id, payload } => {
            if let ResponseRoute::Deliver(request_id) =
                resolve_pending(table, id, Some(RequestKind::FileUpload))
            {
                bus.emit(EngineEvent::FileUploadResponse { request_id, payload });
            }
        }
        ServerFrame::FileListResponse { id, payload } => {
            if let ResponseRoute::Deliver(request_id) =
                resolve_pending(table, id, Some(RequestKind::FileList))
            {
                bus.emit(EngineEvent::FileListResponse { request_id, payload });
            }
        }
        ServerFrame::FileContent { id, payload } => {
            if let ResponseRoute::Deliver(request_id) =
                resolve_pending(table, id, Some(RequestKind::FileRequest))
            {
                bus.emit(EngineEvent::FileContent { request_id, payload });
            }
        }
        ServerFrame::ServerError { code, message } => {
            bus.emit(EngineEvent::CommunicationError {
                code: code.unwrap_or_else(|| "server_error".to_string()),
                message,
            });
        }
        ServerFrame::Pong => {}
    }
}

/// Where a correlated response goes after consulting the table.
#[derive(Debug, PartialEq, Eq)]
enum ResponseRoute {
    /// Late or duplicate delivery for a consumed id - drop it.
    Drop,
    /// Emit, tagged with the pending entry it resolved (if any).
    Deliver(Option<String>),
}

/// Match a response frame to its pending entry.
///
/// A response carrying an id that matches no pending entry is a late or
/// duplicate delivery and is dropped. A response without an id resolves the
/// oldest pending entry of its kind - the empty-history path - or passes
/// through unresolved when nothing is pending.
fn resolve_pending(
    table: &mut CorrelationTable,
    id: Option<String>,
    kind: Option<RequestKind>,
) -> ResponseRoute {
    match id {
        Some(id) => match table.resolve(&id) {
            Some(pending) => ResponseRoute::Deliver(Some(pending.request_id)),
            None => {
                log::debug!("Dropping late/duplicate response for request {id}");
                ResponseRoute::Drop
            }
        },
        None => match kind.and_then(|k| table.resolve_kind(k)) {
            Some(pending) => ResponseRoute::Deliver(Some(pending.request_id)),
            None => ResponseRoute::Deliver(None),
        },
    }
}

/// Expire every pending request after an unexpected connection loss.
fn expire_after_loss(bus: &EventBus, table: &mut CorrelationTable) {
    for pending in table.drain() {
        log::warn!(
            "Expiring request {} ({}) after connection loss",
            pending.request_id,
            pending.kind
        );
        bus.emit(EngineEvent::CommunicationError {
            code: "timeout".to_string(),
            message: format!("{} request expired after connection loss", pending.kind),
        });
    }
}

/// Budgeted reconnect with a fixed delay before each attempt.
async fn reconnect(
    config: &EngineConfig,
    snapshot: &Arc<SharedSnapshot>,
    bus: &EventBus,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &Arc<AtomicBool>,
) -> ReconnectOutcome {
    for attempt in 1..=config.reconnect_attempts {
        if shutdown.load(Ordering::SeqCst) {
            return ReconnectOutcome::Shutdown;
        }

        snapshot.set_status(ConnectionStatus::Reconnecting).await;
        bus.emit(EngineEvent::Reconnecting {
            attempt,
            max_attempts: config.reconnect_attempts,
        });
        log::info!(
            "Reconnecting in {:?} (attempt {attempt}/{})",
            config.reconnect_delay,
            config.reconnect_attempts
        );

        if wait_for_retry(config.reconnect_delay, command_rx, shutdown).await {
            return ReconnectOutcome::Shutdown;
        }

        snapshot.set_status(ConnectionStatus::Connecting).await;
        bus.emit(EngineEvent::Connecting);

        match ws::connect(&config.url, config.timeout).await {
            Ok((writer, reader)) => {
                let session_id = Uuid::new_v4().to_string();
                snapshot
                    .update(|s| {
                        s.status = ConnectionStatus::Connected;
                        s.session_id = Some(session_id.clone());
                        s.connected_at = Some(Utc::now());
                        s.reconnect_count += 1;
                    })
                    .await;
                bus.emit(EngineEvent::Connected { session_id });
                log::info!("Reconnected to {}", config.url);
                return ReconnectOutcome::Connected(writer, reader);
            }
            Err(e) => {
                log::warn!("Reconnect attempt {attempt} failed: {e}");
            }
        }
    }

    log::error!(
        "Reconnect budget exhausted after {} attempts",
        config.reconnect_attempts
    );
    snapshot.set_status(ConnectionStatus::Error).await;
    bus.emit(EngineEvent::ConnectionError {
        message: format!(
            "reconnect budget exhausted after {} attempts",
            config.reconnect_attempts
        ),
    });
    ReconnectOutcome::Exhausted
}

/// Wait out the retry delay while still servicing the command channel.
///
/// Returns `true` if shutdown was requested during the wait. Data commands
/// that race a disconnect are dropped here; the engine facade already fails
/// sends fast while the status is not `Connected`.
async fn wait_for_retry(
    delay: Duration,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &Arc<AtomicBool>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return false,
            cmd = command_rx.recv() => match cmd {
                None | Some(Command::Shutdown) => return true,
                Some(Command::Send { envelope, .. }) => {
                    log::warn!("Dropping {} command while reconnecting", envelope.kind);
                }
                Some(Command::Abort { .. }) => {
                    log::warn!("Dropping abort while reconnecting");
                }
            }
        }
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
    }
}

/// Session teardown: drain the table, discard the turn, publish the final
/// `Disconnected` state. Requested shutdowns do not emit timeout errors -
/// consumers are tearing down with us.
async fn teardown(
    snapshot: &Arc<SharedSnapshot>,
    bus: &EventBus,
    table: &mut CorrelationTable,
    reassembler: &mut StreamReassembler,
) {
    let dropped = table.drain().len();
    if dropped > 0 {
        log::debug!("Dropped {dropped} pending requests on disconnect");
    }
    reassembler.reset();
    snapshot
        .update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.session_id = None;
            s.connected_at = None;
        })
        .await;
    bus.emit(EngineEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_pending_by_id() {
        let mut table = CorrelationTable::new();
        table.register("req-1", RequestKind::GetStatus, Duration::from_secs(5));

        let route = resolve_pending(&mut table, Some("req-1".to_string()), None);
        assert_eq!(route, ResponseRoute::Deliver(Some("req-1".to_string())));
    }

    #[test]
    fn test_resolve_pending_drops_late_response() {
        let mut table = CorrelationTable::new();
        // No entry registered - this response is late or duplicate.
        let route = resolve_pending(&mut table, Some("stale".to_string()), None);
        assert_eq!(route, ResponseRoute::Drop);
    }

    #[test]
    fn test_resolve_pending_idless_falls_back_to_kind() {
        let mut table = CorrelationTable::new();
        table.register("hist-1", RequestKind::GetHistory, Duration::from_secs(5));

        let route = resolve_pending(&mut table, None, Some(RequestKind::GetHistory));
        assert_eq!(route, ResponseRoute::Deliver(Some("hist-1".to_string())));
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolve_pending_unsolicited_passes_through() {
        let mut table = CorrelationTable::new();
        let route = resolve_pending(&mut table, None, Some(RequestKind::GetStatus));
        assert_eq!(route, ResponseRoute::Deliver(None));
    }

    #[tokio::test]
    async fn test_expire_after_loss_emits_timeout_per_entry() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut table = CorrelationTable::new();
        table.register("a", RequestKind::GetHistory, Duration::from_secs(5));
        table.register("b", RequestKind::FileList, Duration::from_secs(5));

        expire_after_loss(&bus, &mut table);
        assert!(table.is_empty());

        for _ in 0..2 {
            match rx.recv().await {
                Ok(EngineEvent::CommunicationError { code, .. }) => assert_eq!(code, "timeout"),
                other => panic!("Expected CommunicationError, got {other:?}"),
            }
        }
    }
}
