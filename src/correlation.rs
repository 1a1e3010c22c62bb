//! Correlation table for outstanding requests.
//!
//! Commands that expect a response (history, status, file operations)
//! register an entry here when sent. The entry is removed when its response
//! arrives or when its deadline passes, whichever comes first - every
//! registered id is eventually removed, and none survives `disconnect()`.
//!
//! Resolution is at-most-once: late or duplicate responses for an id that
//! already resolved (or timed out) are dropped as no-ops.
//!
//! Some responses carry no correlation id at all - the server's status-only
//! "empty history" answer is the known case. Those resolve the *oldest*
//! pending entry of the matching kind instead, so a history request is never
//! left hanging on an empty result.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Kind of a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `control { request: "get_history" }`
    GetHistory,
    /// `control { request: "get_status" }`
    GetStatus,
    /// `file_upload`
    FileUpload,
    /// `file_list`
    FileList,
    /// `file_request`
    FileRequest,
}

impl RequestKind {
    /// Wire name of the request, as echoed back by the server.
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::GetHistory => "get_history",
            Self::GetStatus => "get_status",
            Self::FileUpload => "file_upload",
            Self::FileList => "file_list",
            Self::FileRequest => "file_request",
        }
    }

    /// Parse a wire name back into a kind.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "get_history" => Some(Self::GetHistory),
            "get_status" => Some(Self::GetStatus),
            "file_upload" => Some(Self::FileUpload),
            "file_list" => Some(Self::FileList),
            "file_request" => Some(Self::FileRequest),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// An outstanding request awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    /// Correlation id carried by the outbound envelope.
    pub request_id: String,
    /// What was asked.
    pub kind: RequestKind,
    /// When the request was dispatched.
    pub issued_at: Instant,
    /// Response bound.
    pub timeout: Duration,
}

impl PendingRequest {
    /// Whether the deadline has passed as of `now`.
    #[must_use]
    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.issued_at) >= self.timeout
    }
}

/// Table of outstanding request ids, swept by the supervisor's tick.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingRequest>,
    /// Registration order, for oldest-first kind fallback. Ids already
    /// resolved are skipped lazily.
    order: VecDeque<String>,
}

impl CorrelationTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request and start its deadline.
    pub fn register(&mut self, request_id: impl Into<String>, kind: RequestKind, timeout: Duration) {
        let request_id = request_id.into();
        self.order.push_back(request_id.clone());
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                request_id,
                kind,
                issued_at: Instant::now(),
                timeout,
            },
        );
    }

    /// Resolve by id. Returns `None` for unknown, already-resolved, or
    /// timed-out ids - late and duplicate deliveries are no-ops.
    pub fn resolve(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.pending.remove(request_id)
    }

    /// Resolve the oldest pending entry of `kind`, for responses that carry
    /// no correlation id.
    pub fn resolve_kind(&mut self, kind: RequestKind) -> Option<PendingRequest> {
        let position = self
            .order
            .iter()
            .position(|id| self.pending.get(id).is_some_and(|p| p.kind == kind))?;
        let request_id = self.order.remove(position)?;
        self.pending.remove(&request_id)
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn sweep(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired_ids: Vec<String> = self
            .pending
            .values()
            .filter(|p| p.expired(now))
            .map(|p| p.request_id.clone())
            .collect();
        expired_ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect()
    }

    /// Remove and return every entry. Used on session teardown.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.order.clear();
        self.pending.drain().map(|(_, p)| p).collect()
    }

    /// Number of outstanding entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the table has no outstanding entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_resolve_removes_entry() {
        let mut table = CorrelationTable::new();
        table.register("req-1", RequestKind::GetStatus, TIMEOUT);
        assert_eq!(table.len(), 1);

        let resolved = table.resolve("req-1").expect("entry present");
        assert_eq!(resolved.kind, RequestKind::GetStatus);
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_resolve_is_noop() {
        let mut table = CorrelationTable::new();
        table.register("req-1", RequestKind::GetHistory, TIMEOUT);

        assert!(table.resolve("req-1").is_some());
        assert!(table.resolve("req-1").is_none());
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let mut table = CorrelationTable::new();
        assert!(table.resolve("ghost").is_none());
    }

    #[test]
    fn test_resolve_kind_takes_oldest_first() {
        let mut table = CorrelationTable::new();
        table.register("first", RequestKind::GetHistory, TIMEOUT);
        table.register("status", RequestKind::GetStatus, TIMEOUT);
        table.register("second", RequestKind::GetHistory, TIMEOUT);

        let oldest = table.resolve_kind(RequestKind::GetHistory).expect("match");
        assert_eq!(oldest.request_id, "first");

        let next = table.resolve_kind(RequestKind::GetHistory).expect("match");
        assert_eq!(next.request_id, "second");

        assert!(table.resolve_kind(RequestKind::GetHistory).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_kind_skips_already_resolved_ids() {
        let mut table = CorrelationTable::new();
        table.register("first", RequestKind::FileList, TIMEOUT);
        table.register("second", RequestKind::FileList, TIMEOUT);

        assert!(table.resolve("first").is_some());
        let fallback = table.resolve_kind(RequestKind::FileList).expect("match");
        assert_eq!(fallback.request_id, "second");
    }

    #[test]
    fn test_sweep_expires_only_overdue_entries() {
        let mut table = CorrelationTable::new();
        table.register("short", RequestKind::GetHistory, Duration::from_millis(10));
        table.register("long", RequestKind::GetHistory, Duration::from_secs(60));

        let expired = table.sweep(Instant::now() + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request_id, "short");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drain_clears_everything() {
        let mut table = CorrelationTable::new();
        table.register("a", RequestKind::FileUpload, TIMEOUT);
        table.register("b", RequestKind::FileRequest, TIMEOUT);

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert!(table.resolve_kind(RequestKind::FileUpload).is_none());
    }

    #[test]
    fn test_request_kind_wire_roundtrip() {
        for kind in [
            RequestKind::GetHistory,
            RequestKind::GetStatus,
            RequestKind::FileUpload,
            RequestKind::FileList,
            RequestKind::FileRequest,
        ] {
            assert_eq!(RequestKind::from_wire(kind.as_wire()), Some(kind));
        }
        assert!(RequestKind::from_wire("abort").is_none());
    }
}
