//! Per-session state store
//!
//! The single source of truth for what every session is doing right now.
//! Entries are created lazily, deleted explicitly, and accessed from the
//! control loop as well as from background listen tasks, so all mutation
//! goes through named transition methods: every state change is one short
//! critical section. The backing map is never exposed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::cancel::Cancellation;
use crate::git::MergeStream;
use crate::runner::{PermissionRequest, QuestionRequest};

/// Unique identifier for a session
pub type SessionId = String;

/// Which merge-family operation is running for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Merge,
    PullRequest,
    Push,
    MergeToParent,
}

impl std::fmt::Display for MergeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeKind::Merge => write!(f, "merge"),
            MergeKind::PullRequest => write!(f, "pull request"),
            MergeKind::Push => write!(f, "push"),
            MergeKind::MergeToParent => write!(f, "merge to parent"),
        }
    }
}

/// An in-flight merge/PR/push. Presence in session state is the witness
/// that one is running; the listener borrows `stream` for each listen.
pub struct MergeOp {
    pub stream: MergeStream,
    pub cancel: Cancellation,
    pub kind: MergeKind,
}

/// An outstanding agent request. Presence is the witness that one is
/// running; `started_at` drives elapsed-time display.
pub struct Waiting {
    pub cancel: Cancellation,
    pub started_at: Instant,
}

/// Conflict-resolution context, carried from a conflicted merge until the
/// resolving commit lands.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub path: PathBuf,
    pub kind: MergeKind,
}

/// Mutable per-session bookkeeping
#[derive(Default)]
pub struct SessionState {
    pub(crate) pending_permission: Option<PermissionRequest>,
    pub(crate) pending_question: Option<QuestionRequest>,
    pub(crate) merge: Option<MergeOp>,
    pub(crate) waiting: Option<Waiting>,
    pub(crate) input_text: String,
    pub(crate) streaming_content: String,
    pub(crate) tool_marker_pos: Option<usize>,
    pub(crate) pending_message: Option<String>,
    pub(crate) initial_message: Option<String>,
    pub(crate) session_in_use_error: bool,
    pub(crate) pending_conflict: Option<ConflictContext>,
}

/// Read-only view of a session's state, gathered for the rendering layer
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub waiting_since: Option<Instant>,
    pub pending_permission: Option<PermissionRequest>,
    pub pending_question: Option<QuestionRequest>,
    pub merge_kind: Option<MergeKind>,
    pub streaming_content: String,
    pub tool_marker_pos: Option<usize>,
    pub input_text: String,
    pub session_in_use_error: bool,
}

/// Thread-safe mapping from session id to its mutable state.
///
/// Safe to call from the control loop and from any background task; each
/// named method serializes on the store's lock, so concurrent callers
/// observe a consistent view per session. Locks are never held across an
/// await point.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<SessionState>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily create and return the state entry for `id`. Idempotent: the
    /// same allocation is returned for the life of the session.
    pub fn get_or_create(&self, id: &str) -> Arc<Mutex<SessionState>> {
        let mut sessions = self.sessions.lock();
        sessions.entry(id.to_string()).or_default().clone()
    }

    /// Entry for `id` if present. Never allocates, so read-only status
    /// probes do not leave orphaned entries behind.
    pub fn get_if_exists(&self, id: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Remove `id`, cancelling any outstanding wait or merge first. State
    /// deletion without cancellation would leak the background task.
    pub fn delete(&self, id: &str) {
        let entry = self.sessions.lock().remove(id);
        if let Some(entry) = entry {
            let mut state = entry.lock();
            if let Some(waiting) = state.waiting.take() {
                waiting.cancel.cancel();
            }
            if let Some(merge) = state.merge.take() {
                merge.cancel.cancel();
            }
            debug!(session = id, "deleted session state");
        }
    }

    fn with<R>(&self, id: &str, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let entry = self.get_or_create(id);
        let mut state = entry.lock();
        f(&mut state)
    }

    fn with_existing<R>(&self, id: &str, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let entry = self.get_if_exists(id)?;
        let mut state = entry.lock();
        Some(f(&mut state))
    }

    // --- waiting ---

    /// Record an outstanding agent request. Refuses (returns false) if one
    /// is already present.
    pub fn start_waiting(&self, id: &str, cancel: Cancellation) -> bool {
        self.with(id, |s| {
            if s.waiting.is_some() {
                return false;
            }
            s.waiting = Some(Waiting {
                cancel,
                started_at: Instant::now(),
            });
            true
        })
    }

    /// Clear the outstanding-request witness, returning it if present.
    pub fn stop_waiting(&self, id: &str) -> Option<Waiting> {
        self.with_existing(id, |s| s.waiting.take()).flatten()
    }

    pub fn is_waiting(&self, id: &str) -> bool {
        self.with_existing(id, |s| s.waiting.is_some())
            .unwrap_or(false)
    }

    pub fn waiting_since(&self, id: &str) -> Option<Instant> {
        self.with_existing(id, |s| s.waiting.as_ref().map(|w| w.started_at))
            .flatten()
    }

    /// True if any session has an outstanding agent request. Drives the
    /// aggregate idle/streaming application state.
    pub fn any_waiting(&self) -> bool {
        let sessions = self.sessions.lock();
        sessions.values().any(|e| e.lock().waiting.is_some())
    }

    // --- merge ops ---

    /// Record an in-flight merge op. Refuses (returns false) if one is
    /// already present: one merge/PR/push per session at a time.
    pub fn start_merge(&self, id: &str, op: MergeOp) -> bool {
        self.with(id, |s| {
            if s.merge.is_some() {
                return false;
            }
            s.merge = Some(op);
            true
        })
    }

    /// Clear the in-flight-merge witness, returning it if present.
    pub fn stop_merge(&self, id: &str) -> Option<MergeOp> {
        self.with_existing(id, |s| s.merge.take()).flatten()
    }

    pub fn is_merging(&self, id: &str) -> bool {
        self.with_existing(id, |s| s.merge.is_some())
            .unwrap_or(false)
    }

    pub fn merge_kind(&self, id: &str) -> Option<MergeKind> {
        self.with_existing(id, |s| s.merge.as_ref().map(|m| m.kind))
            .flatten()
    }

    /// Stream handle of the in-flight merge, for re-arming its listener.
    pub fn merge_stream(&self, id: &str) -> Option<MergeStream> {
        self.with_existing(id, |s| s.merge.as_ref().map(|m| m.stream.clone()))
            .flatten()
    }

    // --- pending permission / question ---

    pub fn set_pending_permission(&self, id: &str, request: PermissionRequest) {
        self.with(id, |s| s.pending_permission = Some(request));
    }

    pub fn take_pending_permission(&self, id: &str) -> Option<PermissionRequest> {
        self.with_existing(id, |s| s.pending_permission.take())
            .flatten()
    }

    pub fn has_pending_permission(&self, id: &str) -> bool {
        self.with_existing(id, |s| s.pending_permission.is_some())
            .unwrap_or(false)
    }

    pub fn set_pending_question(&self, id: &str, request: QuestionRequest) {
        self.with(id, |s| s.pending_question = Some(request));
    }

    pub fn take_pending_question(&self, id: &str) -> Option<QuestionRequest> {
        self.with_existing(id, |s| s.pending_question.take())
            .flatten()
    }

    pub fn has_pending_question(&self, id: &str) -> bool {
        self.with_existing(id, |s| s.pending_question.is_some())
            .unwrap_or(false)
    }

    // --- streaming buffer ---

    /// Append streamed text to the session's buffered response.
    pub fn append_streaming(&self, id: &str, text: &str) {
        self.with(id, |s| s.streaming_content.push_str(text));
    }

    /// Append a tool placeholder line, recording its byte position so a
    /// later result can rewrite it in place without reflowing the rest.
    pub fn append_tool_marker(&self, id: &str, marker: &str) -> usize {
        self.with(id, |s| {
            if !s.streaming_content.is_empty() && !s.streaming_content.ends_with('\n') {
                s.streaming_content.push('\n');
            }
            let pos = s.streaming_content.len();
            s.streaming_content.push_str(marker);
            s.streaming_content.push('\n');
            s.tool_marker_pos = Some(pos);
            pos
        })
    }

    /// Replace `marker` with `replacement` if it is still found at
    /// `expected_pos`. A mismatch is a no-op, not an error: the marker may
    /// have been superseded by a newer event arriving out of order.
    pub fn replace_tool_marker(
        &self,
        id: &str,
        marker: &str,
        replacement: &str,
        expected_pos: usize,
    ) -> bool {
        self.with_existing(id, |s| {
            let end = expected_pos + marker.len();
            if s.streaming_content.get(expected_pos..end) != Some(marker) {
                return false;
            }
            s.streaming_content.replace_range(expected_pos..end, replacement);
            if s.tool_marker_pos == Some(expected_pos) {
                s.tool_marker_pos = None;
            }
            true
        })
        .unwrap_or(false)
    }

    pub fn tool_marker_pos(&self, id: &str) -> Option<usize> {
        self.with_existing(id, |s| s.tool_marker_pos).flatten()
    }

    /// Take the buffered response, clearing it along with the marker.
    pub fn take_streaming(&self, id: &str) -> String {
        self.with_existing(id, |s| {
            s.tool_marker_pos = None;
            std::mem::take(&mut s.streaming_content)
        })
        .unwrap_or_default()
    }

    /// Overwrite the buffered response (used when a focus switch persists a
    /// partial transcript the caller was holding).
    pub fn set_streaming(&self, id: &str, content: String) {
        self.with(id, |s| s.streaming_content = content);
    }

    // --- draft input ---

    pub fn set_input(&self, id: &str, text: &str) {
        self.with(id, |s| s.input_text = text.to_string());
    }

    pub fn input(&self, id: &str) -> String {
        self.with_existing(id, |s| s.input_text.clone())
            .unwrap_or_default()
    }

    // --- queued messages ---

    /// Queue text to send once the session is free. Non-destructive: a
    /// message already queued is extended, not replaced.
    pub fn queue_pending_message(&self, id: &str, text: &str) {
        self.with(id, |s| match &mut s.pending_message {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(text);
            }
            None => s.pending_message = Some(text.to_string()),
        });
    }

    /// Look at the queued message without consuming it.
    pub fn peek_pending_message(&self, id: &str) -> Option<String> {
        self.with_existing(id, |s| s.pending_message.clone())
            .flatten()
    }

    /// Consume the queued message.
    pub fn take_pending_message(&self, id: &str) -> Option<String> {
        self.with_existing(id, |s| s.pending_message.take())
            .flatten()
    }

    pub fn set_initial_message(&self, id: &str, text: &str) {
        self.with(id, |s| s.initial_message = Some(text.to_string()));
    }

    pub fn take_initial_message(&self, id: &str) -> Option<String> {
        self.with_existing(id, |s| s.initial_message.take())
            .flatten()
    }

    // --- error flags / conflict tag ---

    pub fn set_session_in_use_error(&self, id: &str, value: bool) {
        self.with(id, |s| s.session_in_use_error = value);
    }

    pub fn session_in_use_error(&self, id: &str) -> bool {
        self.with_existing(id, |s| s.session_in_use_error)
            .unwrap_or(false)
    }

    pub fn set_pending_conflict(&self, id: &str, conflict: ConflictContext) {
        self.with(id, |s| s.pending_conflict = Some(conflict));
    }

    pub fn pending_conflict(&self, id: &str) -> Option<ConflictContext> {
        self.with_existing(id, |s| s.pending_conflict.clone())
            .flatten()
    }

    pub fn take_pending_conflict(&self, id: &str) -> Option<ConflictContext> {
        self.with_existing(id, |s| s.pending_conflict.take())
            .flatten()
    }

    // --- snapshots ---

    /// Read-only view for rendering. Never allocates a missing entry.
    pub fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        self.with_existing(id, |s| SessionSnapshot {
            waiting_since: s.waiting.as_ref().map(|w| w.started_at),
            pending_permission: s.pending_permission.clone(),
            pending_question: s.pending_question.clone(),
            merge_kind: s.merge.as_ref().map(|m| m.kind),
            streaming_content: s.streaming_content.clone(),
            tool_marker_pos: s.tool_marker_pos,
            input_text: s.input_text.clone(),
            session_in_use_error: s.session_in_use_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_returns_same_allocation() {
        let store = SessionStore::new();
        let first = store.get_or_create("x");
        let second = store.get_or_create("x");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_get_if_exists_never_allocates() {
        let store = SessionStore::new();
        assert!(store.get_if_exists("ghost").is_none());
        assert!(!store.is_waiting("ghost"));
        // Probing must not have created an entry
        assert!(store.get_if_exists("ghost").is_none());
    }

    #[test]
    fn test_at_most_one_waiting() {
        let store = SessionStore::new();
        assert!(store.start_waiting("a", Cancellation::noop()));
        assert!(!store.start_waiting("a", Cancellation::noop()));
        store.stop_waiting("a");
        assert!(store.start_waiting("a", Cancellation::noop()));
    }

    #[test]
    fn test_delete_cancels_outstanding_ops() {
        let store = SessionStore::new();
        let wait_cancel = Cancellation::noop();
        let merge_cancel = Cancellation::noop();
        store.start_waiting("a", wait_cancel.clone());

        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        let op = MergeOp {
            stream: Arc::new(crate::session::routing::LineStream::new(rx)),
            cancel: merge_cancel.clone(),
            kind: MergeKind::Merge,
        };
        assert!(store.start_merge("a", op));

        store.delete("a");
        assert!(wait_cancel.is_cancelled());
        assert!(merge_cancel.is_cancelled());
        assert!(store.get_if_exists("a").is_none());
    }

    #[test]
    fn test_tool_marker_replace() {
        let store = SessionStore::new();
        store.append_streaming("a", "thinking\n");
        let pos = store.append_tool_marker("a", "[tool running]");
        assert!(store.replace_tool_marker("a", "[tool running]", "[tool done]", pos));
        let content = store.take_streaming("a");
        assert!(content.contains("[tool done]"));
        assert!(!content.contains("[tool running]"));
    }

    #[test]
    fn test_tool_marker_replace_stale_pos_is_noop() {
        let store = SessionStore::new();
        let pos = store.append_tool_marker("a", "[tool running]");
        // More text superseded the marker position
        store.append_streaming("a", "later output\n");
        assert!(!store.replace_tool_marker("a", "[tool running]", "[tool done]", pos + 3));
        let before = store.snapshot("a").unwrap().streaming_content;
        assert!(!store.replace_tool_marker("a", "[missing]", "[tool done]", pos));
        assert_eq!(store.snapshot("a").unwrap().streaming_content, before);
        // The correct position still replaces exactly once
        assert!(store.replace_tool_marker("a", "[tool running]", "[tool done]", pos));
        assert!(!store.replace_tool_marker("a", "[tool running]", "[tool done]", pos));
    }

    #[test]
    fn test_pending_message_peek_and_take() {
        let store = SessionStore::new();
        store.start_waiting("a", Cancellation::noop());
        store.queue_pending_message("a", "follow-up");
        // Queuing while waiting is non-destructive
        assert!(store.is_waiting("a"));
        assert_eq!(store.peek_pending_message("a").as_deref(), Some("follow-up"));
        assert_eq!(store.peek_pending_message("a").as_deref(), Some("follow-up"));
        assert_eq!(store.take_pending_message("a").as_deref(), Some("follow-up"));
        assert!(store.take_pending_message("a").is_none());
    }

    #[test]
    fn test_queued_messages_extend() {
        let store = SessionStore::new();
        store.queue_pending_message("a", "one");
        store.queue_pending_message("a", "two");
        assert_eq!(store.take_pending_message("a").as_deref(), Some("one\ntwo"));
    }

    #[test]
    fn test_any_waiting() {
        let store = SessionStore::new();
        assert!(!store.any_waiting());
        store.start_waiting("a", Cancellation::noop());
        assert!(store.any_waiting());
        store.stop_waiting("a");
        assert!(!store.any_waiting());
    }

    #[test]
    fn test_snapshot_gathers_state() {
        let store = SessionStore::new();
        store.set_input("a", "draft text");
        store.append_streaming("a", "partial response");
        store.set_session_in_use_error("a", true);
        let snapshot = store.snapshot("a").unwrap();
        assert_eq!(snapshot.input_text, "draft text");
        assert_eq!(snapshot.streaming_content, "partial response");
        assert!(snapshot.session_in_use_error);
        assert!(snapshot.merge_kind.is_none());
    }
}
