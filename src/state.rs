//! Observable connection state.
//!
//! The supervisor task is the only writer; consumers read snapshots and
//! must not infer connection state from individual message arrival. A
//! subscriber that (re)joins the event bus re-derives current state from
//! the latest snapshot, never from event history.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Connection lifecycle status.
///
/// Transitions form a total order per attempt:
/// `Disconnected → Connecting → {Connected | Error} → Reconnecting →
/// Connecting → …`. No two statuses are active simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not connected, no attempt in progress.
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting out the delay before a reconnect attempt.
    Reconnecting,
    /// Terminal failure; requires an explicit `connect()` to leave.
    Error,
}

/// Point-in-time view of the Connection singleton.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    /// Current lifecycle status.
    pub status: ConnectionStatus,
    /// Stable client identity, minted when the engine is created.
    pub client_id: String,
    /// Identity of the current socket generation, minted per (re)connect.
    pub session_id: Option<String>,
    /// When the current socket connected.
    pub connected_at: Option<DateTime<Utc>>,
    /// Data envelopes sent since the last explicit `connect()`.
    pub messages_sent: u64,
    /// Data envelopes received since the last explicit `connect()`.
    pub messages_received: u64,
    /// Successful automatic reconnects since the last explicit `connect()`.
    pub reconnect_count: u32,
}

impl ConnectionSnapshot {
    fn new(client_id: String) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            client_id,
            session_id: None,
            connected_at: None,
            messages_sent: 0,
            messages_received: 0,
            reconnect_count: 0,
        }
    }
}

/// Shared snapshot handle: supervisor writes, consumers read.
#[derive(Debug)]
pub struct SharedSnapshot {
    inner: RwLock<ConnectionSnapshot>,
}

impl SharedSnapshot {
    /// Create a fresh snapshot for `client_id` in the `Disconnected` state.
    pub fn new(client_id: String) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(ConnectionSnapshot::new(client_id)),
        })
    }

    /// Get a copy of the current snapshot.
    pub async fn get(&self) -> ConnectionSnapshot {
        self.inner.read().await.clone()
    }

    /// Current status only.
    pub async fn status(&self) -> ConnectionStatus {
        self.inner.read().await.status
    }

    /// Check if connected.
    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.status == ConnectionStatus::Connected
    }

    /// Set the status, leaving the rest of the snapshot untouched.
    pub async fn set_status(&self, status: ConnectionStatus) {
        self.inner.write().await.status = status;
    }

    /// Apply an arbitrary mutation to the snapshot.
    pub async fn update(&self, mutate: impl FnOnce(&mut ConnectionSnapshot)) {
        mutate(&mut *self.inner.write().await);
    }
}
