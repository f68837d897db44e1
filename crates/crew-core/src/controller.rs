//! Reactive control loop dispatch
//!
//! The controller owns no per-session mutable state itself. It reads the
//! store, mutates it through named transitions, talks to the lifecycle
//! manager, and turns routed events into notices for the rendering layer.
//! Suspension only ever happens in the background tasks it arms, never
//! here.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::config::{ConfigStore, SessionRecord, TranscriptMessage};
use crate::error::{Error, Result};
use crate::git::MergeLine;
use crate::merge::{MergeEntry, MergeOutcome, MergeWorkflow};
use crate::runner::{PermissionRequest, QuestionRequest, ResponseChunk, RunnerHandle};
use crate::session::lifecycle::{PreviousFocus, SelectionResult, SessionLifecycle};
use crate::session::routing::{self, Listened, ListenerPool, RoutedEvent};
use crate::session::state::{MergeKind, SessionId, SessionStore};
use crate::bulk;

/// Message patterns meaning "another process holds this working tree"
const IN_USE_PATTERNS: &[&str] = &[
    "already in use",
    "worktree is locked",
    "session in use",
    "index.lock",
];

/// Whether an agent error message is the transient "working tree locked"
/// condition, recoverable via force-resume.
pub fn is_session_in_use_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    IN_USE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Placeholder line appended when a tool invocation starts
pub fn tool_running_line(name: &str) -> String {
    format!("[{} ...]", name)
}

/// Replacement written in place when the invocation completes
pub fn tool_done_line(name: &str) -> String {
    format!("[{} done]", name)
}

/// Aggregate application state, derived from per-session waits - never set
/// independently. Gates cross-cutting UI affordances only; correctness is
/// enforced per session by the store's presence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Idle,
    StreamingClaude,
}

/// What the rendering layer should surface after a dispatch
#[derive(Debug, Clone)]
pub enum Notice {
    /// The streaming buffer changed for this session
    StreamingUpdated(SessionId),
    /// A full response finished and was flushed to the transcript
    ResponseFinished(SessionId),
    PermissionRequested(SessionId),
    QuestionRequested(SessionId),
    MergeOutput { session: SessionId, line: String },
    MergeFinished { session: SessionId, outcome: MergeOutcome },
    /// The working tree is locked by another process; force-resume repairs
    SessionInUse(SessionId),
    AgentError { session: SessionId, message: String },
    /// A write failed; in-memory state stays authoritative
    PersistenceWarning(String),
}

pub struct Controller {
    store: Arc<SessionStore>,
    lifecycle: Arc<SessionLifecycle>,
    merge: Arc<MergeWorkflow>,
    config: Arc<dyn ConfigStore>,
    pool: ListenerPool,
    phase: AppPhase,
}

impl Controller {
    pub fn new(
        store: Arc<SessionStore>,
        lifecycle: Arc<SessionLifecycle>,
        merge: Arc<MergeWorkflow>,
        config: Arc<dyn ConfigStore>,
        pool: ListenerPool,
    ) -> Self {
        Self {
            store,
            lifecycle,
            merge,
            config,
            pool,
            phase: AppPhase::Idle,
        }
    }

    pub fn phase(&self) -> AppPhase {
        self.phase
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<SessionLifecycle> {
        &self.lifecycle
    }

    pub fn merge(&self) -> &Arc<MergeWorkflow> {
        &self.merge
    }

    /// Recompute the aggregate phase from "does any session have an
    /// outstanding agent request"; logs every transition.
    fn refresh_phase(&mut self) {
        let next = if self.store.any_waiting() {
            AppPhase::StreamingClaude
        } else {
            AppPhase::Idle
        };
        if next != self.phase {
            info!(from = ?self.phase, to = ?next, "app phase changed");
            self.phase = next;
        }
    }

    /// Process one routed event; returns notices for the rendering layer.
    pub async fn dispatch(&mut self, event: RoutedEvent) -> Vec<Notice> {
        let notices = match event {
            RoutedEvent::Response { session, event } => self.on_response(session, event).await,
            RoutedEvent::Permission { session, event } => self.on_permission(session, event),
            RoutedEvent::Question { session, event } => self.on_question(session, event),
            RoutedEvent::MergeProgress { session, event } => {
                self.on_merge_line(session, event).await
            }
        };
        self.refresh_phase();
        notices
    }

    async fn on_response(
        &mut self,
        session: SessionId,
        event: Listened<ResponseChunk>,
    ) -> Vec<Notice> {
        let chunk = match event {
            Listened::Closed => {
                debug!(session = %session, "response stream closed");
                self.store.stop_waiting(&session);
                return Vec::new();
            }
            Listened::Message(chunk) => chunk,
        };

        let mut notices = Vec::new();
        match &chunk {
            ResponseChunk::Text { content } => {
                self.store.append_streaming(&session, content);
                notices.push(Notice::StreamingUpdated(session.clone()));
            }
            ResponseChunk::ToolUseStart { name } => {
                self.store
                    .append_tool_marker(&session, &tool_running_line(name));
                notices.push(Notice::StreamingUpdated(session.clone()));
            }
            ResponseChunk::ToolUseResult { name } => {
                if let Some(pos) = self.store.tool_marker_pos(&session) {
                    self.store.replace_tool_marker(
                        &session,
                        &tool_running_line(name),
                        &tool_done_line(name),
                        pos,
                    );
                }
                notices.push(Notice::StreamingUpdated(session.clone()));
            }
            ResponseChunk::Done => {
                notices.extend(self.finish_response(&session).await);
            }
            ResponseChunk::Error { message } => {
                self.store.stop_waiting(&session);
                if is_session_in_use_error(message) {
                    self.store.set_session_in_use_error(&session, true);
                    notices.push(Notice::SessionInUse(session.clone()));
                } else {
                    // Generic agent errors go into the visible transcript
                    // verbatim and the session returns to idle
                    self.store
                        .append_streaming(&session, &format!("\n{}\n", message));
                    notices.push(Notice::AgentError {
                        session: session.clone(),
                        message: message.clone(),
                    });
                }
            }
        }

        if routing::response_rearms(&chunk)
            && let Some(runner) = self.lifecycle.runner_for(&session)
        {
            self.pool.arm_response(session, runner);
        }
        notices
    }

    async fn finish_response(&mut self, session: &str) -> Vec<Notice> {
        let mut notices = vec![Notice::ResponseFinished(session.to_string())];
        self.store.stop_waiting(session);

        // Flush the buffered response into the persisted transcript
        let content = self.store.take_streaming(session);
        if !content.is_empty()
            && let Err(e) = self.append_transcript(session, TranscriptMessage::assistant(content))
        {
            notices.push(Notice::PersistenceWarning(e.to_string()));
        }

        let record = match self.config.get_session(session) {
            Ok(Some(record)) => record,
            _ => return notices,
        };

        // First successful exchange marks the session started
        if !record.started
            && let Err(e) = self.config.mark_started(session)
        {
            notices.push(Notice::PersistenceWarning(e.to_string()));
        }

        // A session tagged with a pending conflict just finished its
        // resolution turn: commit it instead of treating the turn as a
        // fresh exchange.
        if self.store.pending_conflict(session).is_some() {
            match self
                .merge
                .commit_conflict_resolution(&record, "Resolve merge conflicts")
                .await
            {
                Ok(()) => notices.push(Notice::MergeFinished {
                    session: session.to_string(),
                    outcome: MergeOutcome::Succeeded {
                        detail: Some("conflicts resolved".to_string()),
                    },
                }),
                Err(e) => notices.push(Notice::AgentError {
                    session: session.to_string(),
                    message: e.to_string(),
                }),
            }
        }

        // Queued text goes out as soon as the session is free
        if let Some(text) = self.store.take_pending_message(session) {
            if let Err(e) = self.send_now(&record, text).await {
                notices.push(Notice::AgentError {
                    session: session.to_string(),
                    message: e.to_string(),
                });
            }
        }
        notices
    }

    fn on_permission(
        &mut self,
        session: SessionId,
        event: Listened<PermissionRequest>,
    ) -> Vec<Notice> {
        let mut notices = Vec::new();
        if let Listened::Message(request) = &event {
            self.store.set_pending_permission(&session, request.clone());
            notices.push(Notice::PermissionRequested(session.clone()));
        }
        if routing::request_rearms(&event)
            && let Some(runner) = self.lifecycle.runner_for(&session)
        {
            self.pool.arm_permission(session, runner);
        }
        notices
    }

    fn on_question(&mut self, session: SessionId, event: Listened<QuestionRequest>) -> Vec<Notice> {
        let mut notices = Vec::new();
        if let Listened::Message(request) = &event {
            self.store.set_pending_question(&session, request.clone());
            notices.push(Notice::QuestionRequested(session.clone()));
        }
        if routing::request_rearms(&event)
            && let Some(runner) = self.lifecycle.runner_for(&session)
        {
            self.pool.arm_question(session, runner);
        }
        notices
    }

    async fn on_merge_line(
        &mut self,
        session: SessionId,
        event: Listened<MergeLine>,
    ) -> Vec<Notice> {
        let line = match event {
            Listened::Closed => {
                // The run task died without a terminal line (cancelled);
                // never leave the op visible with no way to complete
                self.store.stop_merge(&session);
                return Vec::new();
            }
            Listened::Message(line) => line,
        };

        let mut notices = Vec::new();
        match MergeWorkflow::classify(&line) {
            None => {
                if let MergeLine::Output(text) = &line {
                    notices.push(Notice::MergeOutput {
                        session: session.clone(),
                        line: text.clone(),
                    });
                }
            }
            Some(outcome) => {
                match self.config.get_session(&session) {
                    Ok(Some(record)) => self.merge.finish(&record, &outcome),
                    _ => {
                        self.store.stop_merge(&session);
                    }
                }
                notices.push(Notice::MergeFinished {
                    session: session.clone(),
                    outcome,
                });
            }
        }

        if routing::merge_rearms(&line)
            && let Some(stream) = self.store.merge_stream(&session)
        {
            self.pool.arm_merge(session, stream);
        }
        notices
    }

    fn append_transcript(&self, session: &str, message: TranscriptMessage) -> Result<()> {
        let mut transcript = self.config.load_transcript(session)?;
        transcript.push(message);
        self.config.save_transcript(session, &transcript)
    }

    /// Send user text to a session, or queue it when a request is already
    /// outstanding. Returns true if sent now, false if queued.
    pub async fn send_message(&mut self, record: &SessionRecord, text: String) -> Result<bool> {
        if self.store.is_waiting(&record.id) {
            self.store.queue_pending_message(&record.id, &text);
            debug!(session = %record.id, "queued message while waiting");
            return Ok(false);
        }
        self.send_now(record, text).await?;
        self.refresh_phase();
        Ok(true)
    }

    async fn send_now(&mut self, record: &SessionRecord, text: String) -> Result<()> {
        let runner = self.lifecycle.ensure_runner(record).await?;
        if let Err(e) = self.append_transcript(&record.id, TranscriptMessage::user(text.clone())) {
            warn!(session = %record.id, "failed to persist user message: {}", e);
        }
        let cancel_target = runner.clone();
        let cancel = Cancellation::new(move || cancel_target.cancel_current());
        if !self.store.start_waiting(&record.id, cancel) {
            return Err(Error::AlreadyWaiting(record.id.clone()));
        }
        if let Err(e) = runner.send(text).await {
            // Always clear the witness on failure so the UI cannot observe
            // a request that can never complete
            self.store.stop_waiting(&record.id);
            return Err(e);
        }
        self.pool.arm_response(record.id.clone(), runner);
        Ok(())
    }

    /// Answer a pending permission request.
    pub async fn respond_permission(
        &mut self,
        record: &SessionRecord,
        id: &str,
        allowed: bool,
        always_allow: bool,
    ) -> Result<()> {
        let runner = self
            .lifecycle
            .runner_for(&record.id)
            .ok_or_else(|| Error::Runner(format!("no runner for session {}", record.id)))?;
        let request = self.store.take_pending_permission(&record.id);
        if allowed
            && always_allow
            && let Some(request) = &request
        {
            if let Err(e) = self.config.add_allowed_tool(&record.id, &request.tool_name) {
                warn!(session = %record.id, "failed to persist allowed tool: {}", e);
            }
            runner.set_allowed_tools(self.config.allowed_tools(&record.id).unwrap_or_default());
        }
        runner.respond_permission(id, allowed, always_allow).await
    }

    /// Answer a pending question request.
    pub async fn respond_question(
        &mut self,
        record: &SessionRecord,
        id: &str,
        answers: HashMap<String, String>,
    ) -> Result<()> {
        let runner = self
            .lifecycle
            .runner_for(&record.id)
            .ok_or_else(|| Error::Runner(format!("no runner for session {}", record.id)))?;
        self.store.take_pending_question(&record.id);
        runner.respond_question(id, answers).await
    }

    /// Cancel the outstanding agent request for `id`, if any. The stored
    /// cancellation interrupts only that task; the flag is always cleared.
    pub fn cancel_agent(&mut self, id: &str) -> bool {
        let fired = match self.store.stop_waiting(id) {
            Some(waiting) => {
                waiting.cancel.cancel();
                true
            }
            None => false,
        };
        self.refresh_phase();
        fired
    }

    /// Cancel a running merge/PR/push for `id`, if any.
    pub fn cancel_merge(&mut self, id: &str) -> bool {
        match self.store.stop_merge(id) {
            Some(op) => {
                op.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Switch focus to `record`; a queued initial message goes out on
    /// first focus if the session is idle.
    pub async fn select(
        &mut self,
        record: &SessionRecord,
        previous: Option<PreviousFocus>,
    ) -> Result<SelectionResult> {
        let mut result = self.lifecycle.select(record, previous).await?;
        if !self.store.is_waiting(&record.id)
            && let Some(text) = self.store.take_initial_message(&record.id)
        {
            self.send_now(record, text).await?;
            self.refresh_phase();
            result.snapshot = self.store.snapshot(&record.id).unwrap_or_default();
        }
        Ok(result)
    }

    /// Enter the merge workflow for `record`.
    pub async fn begin_merge(&mut self, record: &SessionRecord, kind: MergeKind) -> Result<MergeEntry> {
        self.merge.begin(record, kind).await
    }

    /// Confirm the commit message and launch the pending run.
    pub async fn confirm_commit(
        &mut self,
        record: &SessionRecord,
        kind: MergeKind,
        message: String,
    ) -> Result<()> {
        self.merge.confirm_commit(record, kind, message).await
    }

    /// Hand conflict resolution to the agent: the directive prompt names
    /// the conflicted files and the normal response flow takes over.
    pub async fn delegate_conflicts(
        &mut self,
        record: &SessionRecord,
        files: &[String],
    ) -> Result<()> {
        let prompt = MergeWorkflow::conflict_prompt(files);
        self.send_message(record, prompt).await?;
        Ok(())
    }

    /// Kill orphaned processes holding the worktree and clear the in-use
    /// flag; safe to call when no orphan exists.
    pub async fn force_resume(&mut self, record: &SessionRecord) -> Result<usize> {
        self.lifecycle.force_resume(record).await
    }

    /// Delete one session: stop its runner, drop its state, remove its
    /// persisted record.
    pub async fn delete_session(&mut self, id: &str) -> Option<RunnerHandle> {
        let runner = self.lifecycle.delete_session(id).await;
        if let Err(e) = self.config.delete_session(id) {
            warn!(session = id, "failed to delete session record: {}", e);
        }
        self.refresh_phase();
        runner
    }

    /// Delete many sessions: runner stops fan out with a bounded pool,
    /// the shared maps are cleaned up sequentially after the join.
    pub async fn bulk_delete(&mut self, ids: Vec<SessionId>) -> usize {
        let targets: Vec<(SessionId, Option<RunnerHandle>)> = ids
            .into_iter()
            .map(|id| {
                let runner = self.lifecycle.take_runner(&id);
                (id, runner)
            })
            .collect();

        let stopped = bulk::fan_out(
            targets,
            bulk::DEFAULT_FAN_OUT_LIMIT,
            |(id, runner)| async move {
                if let Some(runner) = runner {
                    runner.stop().await;
                }
                id
            },
        )
        .await;

        // Join phase: shared-state mutation stays on this task
        let mut deleted = 0;
        for id in stopped.into_iter().flatten() {
            self.store.delete(&id);
            if let Err(e) = self.config.delete_session(&id) {
                warn!(session = %id, "failed to delete session record: {}", e);
            }
            deleted += 1;
        }
        self.refresh_phase();
        deleted
    }

    /// Create PRs for many sessions (bounded fan-out in the workflow).
    pub async fn bulk_create_prs(
        &mut self,
        records: Vec<SessionRecord>,
    ) -> Vec<(SessionId, Result<bool>)> {
        self.merge.bulk_create_prs(records).await
    }

    /// Stop every runner; called once at exit.
    pub async fn shutdown(&mut self) {
        self.lifecycle.shutdown().await;
    }
}
