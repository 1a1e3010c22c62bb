//! Stream reassembly for the in-flight assistant turn.
//!
//! Accumulates ordered text fragments for a single server-streamed response
//! into one logical message, detects completion, and guards against the
//! duplicate and out-of-order hazards of at-least-once transport delivery.
//!
//! # State machine
//!
//! ```text
//!            first fragment                completion
//!   Idle ───────────────────> Accumulating ──────────> Finalizing ──> Idle
//!    │                            │  ▲                     ▲
//!    │                            └──┘ more fragments      │
//!    └─────────────────────────────────────────────────────┘
//!                  completion with no open turn
//! ```
//!
//! - A fragment that is byte-identical to the immediately preceding one is
//!   dropped (duplicate suppression by content signature).
//! - Fragments append in arrival order; the server `sequence` hint is kept
//!   as advisory metadata and never used to resequence.
//! - Every accepted fragment re-emits the *full* accumulated text under the
//!   turn's stable stream id, so consumers replace-by-id.
//! - A completion always yields exactly one finalized message, whether zero,
//!   one, or many fragments preceded it. The finalized text is the longer of
//!   the server's full text and the locally accumulated text.
//! - Duplicate completions (same server message id) are dropped. The
//!   finalized-id set is owned by this instance and torn down with the
//!   session - there is no cross-session state.
//!
//! Rust guideline compliant 2026-03

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// SHA-256 digest of a fragment's content.
type FragmentSignature = [u8; 32];

fn signature_of(text: &str) -> FragmentSignature {
    Sha256::digest(text.as_bytes()).into()
}

/// One assistant response under construction.
#[derive(Debug)]
struct Turn {
    /// Engine-assigned id, stable for the turn's lifetime.
    stream_id: String,
    /// Fragments concatenated in arrival order.
    accumulated_text: String,
    /// Signature of the last accepted fragment, for duplicate suppression.
    last_fragment_signature: FragmentSignature,
    /// Latest advisory sequence hint seen. Never used for resequencing.
    sequence: Option<u64>,
}

/// Result of feeding one fragment into the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// The fragment was appended. Carries the full accumulated text.
    Accepted {
        /// Stable id of the open turn.
        stream_id: String,
        /// Full accumulated text, for replace-by-id rendering.
        text: String,
    },
    /// The fragment repeated the previous one and was dropped.
    Duplicate,
}

/// Result of feeding a completion event into the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The turn finalized. Carries the reconciled text.
    Finalized {
        /// The turn's stream id - not the server's message id - so partials
        /// and the final message are recognized as the same logical entity.
        stream_id: String,
        /// Reconciled final text (longer of server and accumulated).
        text: String,
    },
    /// This server message id already finalized; the event was dropped.
    Duplicate,
}

/// Reassembles one server-streamed assistant turn at a time.
///
/// One instance per session, constructed and torn down with the connection.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    /// The open turn, if any. At most one exists at a time.
    turn: Option<Turn>,
    /// Server message ids already finalized, for duplicate-completion
    /// suppression across the session.
    finalized_ids: HashSet<String>,
}

impl StreamReassembler {
    /// Create an idle reassembler with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment, opening a turn if none is open.
    pub fn fragment(&mut self, text: &str, sequence: Option<u64>) -> FragmentOutcome {
        let signature = signature_of(text);

        match self.turn.as_mut() {
            None => {
                let stream_id = Uuid::new_v4().to_string();
                self.turn = Some(Turn {
                    stream_id: stream_id.clone(),
                    accumulated_text: text.to_string(),
                    last_fragment_signature: signature,
                    sequence,
                });
                FragmentOutcome::Accepted {
                    stream_id,
                    text: text.to_string(),
                }
            }
            Some(turn) => {
                if signature == turn.last_fragment_signature {
                    return FragmentOutcome::Duplicate;
                }
                turn.accumulated_text.push_str(text);
                turn.last_fragment_signature = signature;
                turn.sequence = sequence.or(turn.sequence);
                FragmentOutcome::Accepted {
                    stream_id: turn.stream_id.clone(),
                    text: turn.accumulated_text.clone(),
                }
            }
        }
    }

    /// Feed a completion event, closing the turn.
    ///
    /// With no open turn (completion raced ahead of every fragment, or the
    /// server streamed nothing), a fresh turn is minted and finalized
    /// immediately so the completion still yields exactly one message.
    pub fn complete(&mut self, message_id: &str, server_text: &str) -> CompletionOutcome {
        if self.finalized_ids.contains(message_id) {
            return CompletionOutcome::Duplicate;
        }
        self.finalized_ids.insert(message_id.to_string());

        let (stream_id, accumulated) = match self.turn.take() {
            Some(turn) => (turn.stream_id, turn.accumulated_text),
            None => (Uuid::new_v4().to_string(), String::new()),
        };

        // Longer wins: a completion racing ahead of the last fragment loses
        // nothing, and a server that sends the strictly-complete final text
        // overrides a partial accumulation. This is the specified heuristic,
        // not a content diff.
        let text = if server_text.len() >= accumulated.len() {
            server_text.to_string()
        } else {
            accumulated
        };

        CompletionOutcome::Finalized { stream_id, text }
    }

    /// Discard the in-flight turn without emitting a synthetic completion.
    ///
    /// Used on abort and on socket loss. The finalized-id set survives, so
    /// a completion replayed after a silent reconnect stays idempotent.
    pub fn reset(&mut self) {
        self.turn = None;
    }

    /// Stream id of the open turn, if one is open.
    #[must_use]
    pub fn open_stream_id(&self) -> Option<&str> {
        self.turn.as_ref().map(|t| t.stream_id.as_str())
    }
}
