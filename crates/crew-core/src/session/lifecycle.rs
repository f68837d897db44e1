//! Session lifecycle: runner cache, selection, deletion, recovery
//!
//! Owns the mapping from session id to its live runner handle and composes
//! store reads into the single "select this session" transition. Selection
//! is invoked from the single-threaded control loop, so two selections
//! never race on the same handle by construction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{ConfigStore, SessionRecord, TranscriptMessage};
use crate::error::Result;
use crate::process::ProcessSupervisor;
use crate::runner::{RunnerFactory, RunnerHandle};

use super::routing::ListenerPool;
use super::state::{SessionId, SessionSnapshot, SessionStore};

/// State of the previously focused session, captured by the caller before
/// a switch so nothing typed or streamed is lost.
#[derive(Debug, Clone)]
pub struct PreviousFocus {
    pub id: SessionId,
    pub input_text: String,
    /// Partial transcript the caller was holding while focused, when the
    /// stream has not been finalized yet
    pub streaming: Option<String>,
}

/// Everything the caller needs to render a newly selected session
pub struct SelectionResult {
    pub runner: RunnerHandle,
    pub transcript: Vec<TranscriptMessage>,
    pub snapshot: SessionSnapshot,
    pub header: String,
}

pub struct SessionLifecycle {
    runners: Mutex<HashMap<SessionId, RunnerHandle>>,
    store: Arc<SessionStore>,
    config: Arc<dyn ConfigStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
    factory: Arc<dyn RunnerFactory>,
    pool: ListenerPool,
}

impl SessionLifecycle {
    pub fn new(
        store: Arc<SessionStore>,
        config: Arc<dyn ConfigStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
        factory: Arc<dyn RunnerFactory>,
        pool: ListenerPool,
    ) -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
            store,
            config,
            supervisor,
            factory,
            pool,
        }
    }

    /// Cached runner for `id`, if any.
    pub fn runner_for(&self, id: &str) -> Option<RunnerHandle> {
        self.runners.lock().get(id).cloned()
    }

    /// Remove and return the cached runner for `id` without touching any
    /// other state. Used by bulk deletion, which stops runners in a
    /// fan-out phase before the sequential map cleanup.
    pub fn take_runner(&self, id: &str) -> Option<RunnerHandle> {
        self.runners.lock().remove(id)
    }

    /// Resolve or create the runner for `record`.
    pub async fn ensure_runner(&self, record: &SessionRecord) -> Result<RunnerHandle> {
        if let Some(runner) = self.runner_for(&record.id) {
            return Ok(runner);
        }
        let transcript = self.config.load_transcript(&record.id)?;
        self.create_runner(record, transcript).await
    }

    async fn create_runner(
        &self,
        record: &SessionRecord,
        transcript: Vec<TranscriptMessage>,
    ) -> Result<RunnerHandle> {
        let runner = self
            .factory
            .spawn(record, transcript, record.started)
            .await?;
        // Apply the configured allow-list before any traffic
        let allowed = self.config.allowed_tools(&record.id)?;
        if !allowed.is_empty() {
            runner.set_allowed_tools(allowed);
        }
        // Permission and question streams are listened from the start;
        // response listens are armed per send.
        self.pool.arm_permission(record.id.clone(), runner.clone());
        self.pool.arm_question(record.id.clone(), runner.clone());
        self.runners
            .lock()
            .insert(record.id.clone(), runner.clone());
        info!(session = %record.id, "created runner");
        Ok(runner)
    }

    /// Switch focus to `record`.
    ///
    /// Persists the outgoing session's draft input and any un-flushed
    /// streaming buffer, resolves or creates the incoming runner, and
    /// gathers the incoming session's state for rendering. On failure no
    /// state of the incoming session is touched, so the caller's
    /// active-session pointer stays valid.
    pub async fn select(
        &self,
        record: &SessionRecord,
        previous: Option<PreviousFocus>,
    ) -> Result<SelectionResult> {
        if let Some(prev) = previous {
            self.store.set_input(&prev.id, &prev.input_text);
            if let Some(streaming) = prev.streaming {
                self.store.set_streaming(&prev.id, streaming);
            }
        }

        let transcript = self.config.load_transcript(&record.id)?;
        let runner = match self.runner_for(&record.id) {
            Some(runner) => runner,
            None => self.create_runner(record, transcript.clone()).await?,
        };

        let snapshot = self.store.snapshot(&record.id).unwrap_or_default();
        let header = match &record.issue {
            Some(issue) => format!("{} [{}] ({})", record.name, record.branch, issue),
            None => format!("{} [{}]", record.name, record.branch),
        };
        Ok(SelectionResult {
            runner,
            transcript,
            snapshot,
            header,
        })
    }

    /// Kill orphaned processes holding the session's worktree and clear
    /// the in-use flag. A repair action distinct from selection; zero
    /// kills is success.
    pub async fn force_resume(&self, record: &SessionRecord) -> Result<usize> {
        let killed = self.supervisor.kill_orphans(&record.worktree_path).await?;
        self.store.set_session_in_use_error(&record.id, false);
        info!(session = %record.id, killed, "force-resumed session");
        Ok(killed)
    }

    /// Stop the runner and drop all state for `id`. Returns the stopped
    /// handle so the caller can log or verify it.
    pub async fn delete_session(&self, id: &str) -> Option<RunnerHandle> {
        let runner = self.take_runner(id);
        if let Some(runner) = &runner {
            runner.stop().await;
        }
        self.store.delete(id);
        info!(session = id, stopped_runner = runner.is_some(), "deleted session");
        runner
    }

    /// True if any cached runner reports itself mid-stream. Drives the
    /// aggregate idle/streaming application state.
    pub fn has_active_streaming(&self) -> bool {
        self.runners.lock().values().any(|r| r.is_streaming())
    }

    /// Stop every cached runner. Called once at process exit.
    pub async fn shutdown(&self) {
        let runners: Vec<(SessionId, RunnerHandle)> = {
            let mut map = self.runners.lock();
            map.drain().collect()
        };
        for (id, runner) in runners {
            debug!(session = %id, "stopping runner");
            runner.stop().await;
        }
    }
}
