//! Event routing: listen, react, re-arm
//!
//! Each runner exposes independent streams (response chunks, permission
//! requests, question requests) and each running merge exposes a progress
//! stream. The control loop processes one message at a time, so a dedicated
//! one-shot listen task is issued per stream per session; when it resolves,
//! the dispatcher reacts and - unless the delivered message was terminal -
//! issues a replacement listen for the same stream. Skipping the re-arm
//! silently starves the session; re-arming unconditionally spins forever on
//! a finished conversation. The decision is domain logic, kept in pure
//! functions here so it is testable apart from the scheduling primitive.
//!
//! Ordering: each stream has at most one outstanding listen task, so
//! messages for a given session arrive in stream order. Messages for
//! different sessions interleave arbitrarily.

use tokio::sync::{Mutex, mpsc};
use tracing::trace;

use crate::git::{MergeLine, MergeStream};
use crate::runner::{PermissionRequest, QuestionRequest, ResponseChunk, RunnerHandle};

use super::state::SessionId;

/// Result of one listen request
#[derive(Debug, Clone)]
pub enum Listened<T> {
    Message(T),
    Closed,
}

/// A message routed back into the control loop
#[derive(Debug)]
pub enum RoutedEvent {
    Response {
        session: SessionId,
        event: Listened<ResponseChunk>,
    },
    Permission {
        session: SessionId,
        event: Listened<PermissionRequest>,
    },
    Question {
        session: SessionId,
        event: Listened<QuestionRequest>,
    },
    MergeProgress {
        session: SessionId,
        event: Listened<MergeLine>,
    },
}

/// A receiver wrapped for listener-style consumption: each `next` call is a
/// single listen request, so at most one task waits on the stream at a time
/// and per-stream ordering is preserved by construction.
pub struct LineStream<T> {
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> LineStream<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx: Mutex::new(rx) }
    }

    pub async fn next(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

/// Issues one-shot listen tasks that post back into the control loop's
/// single event channel.
#[derive(Clone)]
pub struct ListenerPool {
    events_tx: mpsc::UnboundedSender<RoutedEvent>,
}

impl ListenerPool {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RoutedEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Self { events_tx }, events_rx)
    }

    /// Listen for the next response chunk of `session`.
    pub fn arm_response(&self, session: SessionId, runner: RunnerHandle) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match runner.next_response().await {
                Some(chunk) => Listened::Message(chunk),
                None => Listened::Closed,
            };
            trace!(session = %session, "response listen resolved");
            let _ = tx.send(RoutedEvent::Response { session, event });
        });
    }

    /// Listen for the next permission request of `session`.
    pub fn arm_permission(&self, session: SessionId, runner: RunnerHandle) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match runner.next_permission().await {
                Some(request) => Listened::Message(request),
                None => Listened::Closed,
            };
            let _ = tx.send(RoutedEvent::Permission { session, event });
        });
    }

    /// Listen for the next question request of `session`.
    pub fn arm_question(&self, session: SessionId, runner: RunnerHandle) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match runner.next_question().await {
                Some(request) => Listened::Message(request),
                None => Listened::Closed,
            };
            let _ = tx.send(RoutedEvent::Question { session, event });
        });
    }

    /// Listen for the next progress line of `session`'s merge run.
    pub fn arm_merge(&self, session: SessionId, stream: MergeStream) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match stream.next().await {
                Some(line) => Listened::Message(line),
                None => Listened::Closed,
            };
            let _ = tx.send(RoutedEvent::MergeProgress { session, event });
        });
    }
}

/// Response listens re-arm after every chunk except a terminal done/error.
/// The terminal chunk ends the message, not the session; the next user
/// message starts a fresh listen.
pub fn response_rearms(chunk: &ResponseChunk) -> bool {
    !chunk.is_terminal()
}

/// Permission and question listens re-arm after every delivered request -
/// a single agent turn may issue several in sequence.
pub fn request_rearms<T>(event: &Listened<T>) -> bool {
    matches!(event, Listened::Message(_))
}

/// Merge listens re-arm until the terminal done/error line.
pub fn merge_rearms(line: &MergeLine) -> bool {
    !line.is_terminal()
}
