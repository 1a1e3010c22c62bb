//! Wire envelope codec.
//!
//! Every frame on the socket is a JSON envelope:
//!
//! ```text
//! { "type": "...", "id"?: "...", "data": {...}, "metadata": { "timestamp": ms, "sequence"?: n } }
//! ```
//!
//! `type` selects the domain event or command. `id` is present on anything
//! that requires correlation (commands, file operations); generation
//! fragments carry no envelope id and are correlated by an engine-assigned
//! stream id instead.
//!
//! The codec is a stateless transform: encoding builds an envelope with a
//! fresh id where correlation is required, decoding validates minimal shape
//! (`type` present) and routes recognized kinds into [`ServerFrame`].
//! Unrecognized kinds decode to `None` and are logged and dropped by the
//! caller - forward compatibility over strictness.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

/// Outbound kind: a chat message for the assistant.
pub const KIND_CHAT_MESSAGE: &str = "chat_message";
/// Outbound kind: a control request (abort, history, status).
pub const KIND_CONTROL: &str = "control";
/// Outbound kind: file upload (metadata, optionally inline base64 content).
pub const KIND_FILE_UPLOAD: &str = "file_upload";
/// Outbound kind: list files attached to the session.
pub const KIND_FILE_LIST: &str = "file_list";
/// Outbound kind: retrieve one file's content.
pub const KIND_FILE_REQUEST: &str = "file_request";
/// Outbound kind: liveness probe.
pub const KIND_PING: &str = "ping";

/// Envelope metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    /// Sender timestamp, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Advisory ordering hint for stream fragments. Never used to reorder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// A discriminated unit of wire traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope kind (wire field `type`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id, present on commands and file operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Kind-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Timestamp and optional sequence hint.
    #[serde(default)]
    pub metadata: EnvelopeMetadata,
}

impl Envelope {
    /// Build a command envelope with a fresh correlation id.
    #[must_use]
    pub fn command(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            id: Some(Uuid::new_v4().to_string()),
            data,
            metadata: EnvelopeMetadata {
                timestamp: Utc::now().timestamp_millis(),
                sequence: None,
            },
        }
    }

    /// Build a liveness probe. Probes carry no correlation id.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            kind: KIND_PING.to_string(),
            id: None,
            data: Value::Object(serde_json::Map::new()),
            metadata: EnvelopeMetadata {
                timestamp: Utc::now().timestamp_millis(),
                sequence: None,
            },
        }
    }

    /// Serialize to a wire string.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("envelope serializable")
    }

    /// Parse raw wire data, validating minimal shape (`type` present).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Protocol` if the payload is not a JSON envelope.
    pub fn decode(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::Protocol(e.to_string()))
    }
}

/// File payload for upload and content responses.
///
/// `data` is omitted when the file already went over the separate HTTP
/// multipart channel and only the reference travels on the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePayload {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type (wire field `type`).
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Base64-encoded content, if carried inline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl FilePayload {
    /// Build an inline payload, base64-encoding `bytes`.
    #[must_use]
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            mime_type: mime_type.into(),
            data: Some(BASE64.encode(bytes)),
        }
    }

    /// Build a reference payload for a file uploaded out-of-band.
    #[must_use]
    pub fn reference(name: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
            data: None,
        }
    }
}

/// A recognized inbound frame, routed from a decoded [`Envelope`].
#[derive(Debug, Clone)]
pub enum ServerFrame {
    /// One fragment of the in-flight assistant turn.
    StreamFragment {
        /// Fragment content.
        text: String,
        /// Advisory server-side ordering hint.
        sequence: Option<u64>,
    },
    /// The assistant turn completed.
    StreamComplete {
        /// Server-assigned message id, used only for duplicate suppression.
        message_id: String,
        /// The server's view of the full text.
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
    /// Response to a control request (history, status, …).
    ControlResponse {
        /// Envelope correlation id. Absent on status-only responses.
        id: Option<String>,
        /// Which control request this answers (wire field `request`).
        request: Option<String>,
        /// Full response payload.
        payload: Value,
    },
    /// Response to a file upload.
    FileUploadResponse {
        /// Envelope correlation id.
        id: Option<String>,
        /// Full response payload.
        payload: Value,
    },
    /// Response to a file listing request.
    FileListResponse {
        /// Envelope correlation id.
        id: Option<String>,
        /// Full response payload.
        payload: Value,
    },
    /// Content of a requested file.
    FileContent {
        /// Envelope correlation id.
        id: Option<String>,
        /// Full response payload (includes a [`FilePayload`]).
        payload: Value,
    },
    /// Server-pushed error.
    ServerError {
        /// Machine-readable code, if provided.
        code: Option<String>,
        /// Human-readable message.
        message: String,
    },
    /// Answer to a liveness probe.
    Pong,
}

impl ServerFrame {
    /// Route a decoded envelope to a typed frame.
    ///
    /// Returns `None` for unrecognized kinds and for recognized kinds whose
    /// payload is missing a required field; the caller logs and drops those.
    #[must_use]
    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        let Envelope {
            kind,
            id,
            data,
            metadata,
        } = envelope;

        match kind.as_str() {
            "stream_fragment" => Some(Self::StreamFragment {
                text: data.get("text")?.as_str()?.to_string(),
                sequence: metadata.sequence,
            }),
            "stream_complete" => Some(Self::StreamComplete {
                message_id: data.get("message_id")?.as_str()?.to_string(),
                text: data.get("text")?.as_str()?.to_string(),
            }),
            "tool_call" => Some(Self::ToolCall {
                id,
                name: data.get("name")?.as_str()?.to_string(),
                arguments: data.get("arguments").cloned().unwrap_or(Value::Null),
            }),
            "tool_result" => Some(Self::ToolResult {
                id,
                name: data
                    .get("name")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                output: data.get("output").cloned().unwrap_or(Value::Null),
            }),
            "control_response" => Some(Self::ControlResponse {
                id,
                request: data
                    .get("request")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                payload: data,
            }),
            "file_upload_response" => Some(Self::FileUploadResponse { id, payload: data }),
            "file_list_response" => Some(Self::FileListResponse { id, payload: data }),
            "file_content" => Some(Self::FileContent { id, payload: data }),
            "error" => Some(Self::ServerError {
                code: data
                    .get("code")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                message: data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified server error")
                    .to_string(),
            }),
            "pong" => Some(Self::Pong),
            _ => None,
        }
    }
}
