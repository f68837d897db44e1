//! Merge / PR / conflict workflow
//!
//! Sequences "detect local changes → confirm a commit message → run the
//! requested operation → handle success or conflict" per session. The
//! store's merge-op presence is the one-at-a-time guard; precondition
//! failures are rejected synchronously before any background task starts.
//!
//! When the tree has uncommitted changes, a commit message is generated
//! (primary generator with a deterministic fallback) and the user must
//! confirm or edit it before anything touches git: an unreviewed,
//! agent-authored message is never used verbatim.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::bulk;
use crate::config::{ConfigStore, SessionRecord};
use crate::error::{Error, Result};
use crate::git::{GitBackend, MergeContext, MergeLine, WorktreeStatus};
use crate::session::routing::ListenerPool;
use crate::session::state::{ConflictContext, MergeKind, MergeOp, SessionId, SessionStore};

/// Generates a commit message for uncommitted changes.
#[async_trait]
pub trait CommitMessageGenerator: Send + Sync {
    async fn generate(&self, record: &SessionRecord, status: &WorktreeStatus) -> Result<String>;
}

/// Deterministic fallback, derived from the change summary alone.
pub fn fallback_commit_message(record: &SessionRecord, status: &WorktreeStatus) -> String {
    match status.files.as_slice() {
        [] => format!("Update {}", record.branch),
        [file] => format!("Update {}", file),
        files => format!("Update {} files on {}", files.len(), record.branch),
    }
}

/// How a merge request entered the pipeline
#[derive(Debug)]
pub enum MergeEntry {
    /// Uncommitted changes found; the user must confirm or edit the draft
    /// message before anything touches git
    CommitMessagePending {
        draft: String,
        status: WorktreeStatus,
    },
    /// Clean tree; the operation is already running
    Started,
}

/// Terminal outcome of a run
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Succeeded { detail: Option<String> },
    Conflicted { files: Vec<String> },
    Failed { message: String },
}

pub struct MergeWorkflow {
    store: Arc<SessionStore>,
    config: Arc<dyn ConfigStore>,
    git: Arc<dyn GitBackend>,
    generator: Option<Arc<dyn CommitMessageGenerator>>,
    pool: ListenerPool,
}

impl MergeWorkflow {
    pub fn new(
        store: Arc<SessionStore>,
        config: Arc<dyn ConfigStore>,
        git: Arc<dyn GitBackend>,
        generator: Option<Arc<dyn CommitMessageGenerator>>,
        pool: ListenerPool,
    ) -> Self {
        Self {
            store,
            config,
            git,
            generator,
            pool,
        }
    }

    /// Enter the workflow. Rejects synchronously when an op is already in
    /// flight for the session or, for merge-to-parent, when the parent no
    /// longer exists - no state is changed, no task is started.
    pub async fn begin(&self, record: &SessionRecord, kind: MergeKind) -> Result<MergeEntry> {
        if self.store.is_merging(&record.id) {
            return Err(Error::MergeInProgress(record.id.clone()));
        }
        if kind == MergeKind::MergeToParent {
            self.resolve_parent(record)?;
        }

        let status = self.git.worktree_status(&record.worktree_path).await?;
        if status.has_changes {
            let draft = self.draft_commit_message(record, &status).await;
            Ok(MergeEntry::CommitMessagePending { draft, status })
        } else {
            self.start_run(record, kind, None).await?;
            Ok(MergeEntry::Started)
        }
    }

    /// Launch the run with the user-confirmed commit message.
    pub async fn confirm_commit(
        &self,
        record: &SessionRecord,
        kind: MergeKind,
        message: String,
    ) -> Result<()> {
        self.start_run(record, kind, Some(message)).await
    }

    async fn draft_commit_message(
        &self,
        record: &SessionRecord,
        status: &WorktreeStatus,
    ) -> String {
        if let Some(generator) = &self.generator {
            match generator.generate(record, status).await {
                Ok(message) if !message.trim().is_empty() => return message,
                Ok(_) => {}
                Err(e) => {
                    warn!(session = %record.id, "commit message generation failed: {}", e);
                }
            }
        }
        fallback_commit_message(record, status)
    }

    fn resolve_parent(&self, record: &SessionRecord) -> Result<SessionRecord> {
        let parent_id = record
            .parent
            .as_deref()
            .ok_or_else(|| Error::ParentMissing("<none>".to_string()))?;
        self.config
            .get_session(parent_id)?
            .ok_or_else(|| Error::ParentMissing(parent_id.to_string()))
    }

    async fn start_run(
        &self,
        record: &SessionRecord,
        kind: MergeKind,
        commit_message: Option<String>,
    ) -> Result<()> {
        if self.store.is_merging(&record.id) {
            return Err(Error::MergeInProgress(record.id.clone()));
        }

        let target_branch = match kind {
            MergeKind::MergeToParent => Some(self.resolve_parent(record)?.branch),
            _ => None,
        };
        let ctx = MergeContext {
            worktree_path: record.worktree_path.clone(),
            branch: record.branch.clone(),
            target_branch,
            commit_message,
            issue: record.issue.clone(),
        };

        let (stream, cancel) = match kind {
            MergeKind::Merge => self.git.merge_to_main(ctx).await?,
            MergeKind::MergeToParent => self.git.merge_to_parent(ctx).await?,
            MergeKind::PullRequest => self.git.create_pr(ctx).await?,
            MergeKind::Push => self.git.push_updates(ctx).await?,
        };

        let op = MergeOp {
            stream: stream.clone(),
            cancel: cancel.clone(),
            kind,
        };
        if !self.store.start_merge(&record.id, op) {
            // Lost a race that the single-threaded loop should preclude;
            // never leak the task
            cancel.cancel();
            return Err(Error::MergeInProgress(record.id.clone()));
        }
        self.pool.arm_merge(record.id.clone(), stream);
        info!(session = %record.id, kind = %kind, "merge run started");
        Ok(())
    }

    /// Map a progress line to a terminal outcome, if it is one.
    pub fn classify(line: &MergeLine) -> Option<MergeOutcome> {
        match line {
            MergeLine::Output(_) => None,
            MergeLine::Done { detail } => Some(MergeOutcome::Succeeded {
                detail: detail.clone(),
            }),
            MergeLine::Error(failure) if failure.is_conflict() => Some(MergeOutcome::Conflicted {
                files: failure.conflicts.clone(),
            }),
            MergeLine::Error(failure) => Some(MergeOutcome::Failed {
                message: failure.message.clone(),
            }),
        }
    }

    /// Handle a terminal outcome: clear the op, update the persisted
    /// status on success, tag the session on conflict.
    pub fn finish(&self, record: &SessionRecord, outcome: &MergeOutcome) {
        let op = self.store.stop_merge(&record.id);
        let kind = op.map(|o| o.kind);
        match outcome {
            MergeOutcome::Succeeded { .. } => {
                let marked = match kind {
                    Some(MergeKind::Merge) | Some(MergeKind::MergeToParent) => {
                        self.config.mark_merged(&record.id)
                    }
                    Some(MergeKind::PullRequest) => self.config.mark_pr_created(&record.id),
                    _ => Ok(()),
                };
                if let Err(e) = marked {
                    warn!(session = %record.id, "failed to persist merge status: {}", e);
                }
            }
            MergeOutcome::Conflicted { files } => {
                if let Some(kind) = kind {
                    self.store.set_pending_conflict(
                        &record.id,
                        ConflictContext {
                            path: record.worktree_path.clone(),
                            kind,
                        },
                    );
                }
                info!(session = %record.id, conflicts = files.len(), "merge conflicted");
            }
            MergeOutcome::Failed { message } => {
                warn!(session = %record.id, "merge failed: {}", message);
            }
        }
    }

    /// Directive prompt handed to the agent to resolve the named conflicts.
    /// The session keeps its pending-conflict tag, so the next successful
    /// turn is recognized as conflict resolution rather than a fresh
    /// exchange.
    pub fn conflict_prompt(files: &[String]) -> String {
        let list = files
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "The merge stopped on conflicts in the following files:\n{}\n\n\
             Resolve each conflict, keeping both sides' intent where possible, \
             then stage the resolved files. Do not commit; the console commits \
             the resolution.",
            list
        )
    }

    /// Abort the conflicted merge outright, clearing the pending tag.
    pub async fn abort(&self, record: &SessionRecord) -> Result<()> {
        if let Some(conflict) = self.store.take_pending_conflict(&record.id) {
            self.git.abort_merge(&conflict.path).await?;
        }
        Ok(())
    }

    /// Manual recovery instructions for the third resolution path.
    pub fn manual_instructions(record: &SessionRecord) -> String {
        format!(
            "Resolve the conflicts by hand:\n  cd {}\n  # edit the conflicted files\n  git add -A\n  git commit\nThen re-run the merge from the console.",
            record.worktree_path.display()
        )
    }

    /// Commit a finished conflict resolution against the stored context.
    ///
    /// The one commit that bypasses the general pipeline: it applies to
    /// the pending conflict's path directly.
    pub async fn commit_conflict_resolution(
        &self,
        record: &SessionRecord,
        message: &str,
    ) -> Result<()> {
        let conflict = self
            .store
            .take_pending_conflict(&record.id)
            .ok_or_else(|| Error::Git(format!("no pending conflict for session {}", record.id)))?;
        self.git
            .commit_conflict_resolution(&conflict.path, message)
            .await
    }

    /// Create PRs for many sessions: the worktree checks fan out with a
    /// bounded pool, then eligible runs start sequentially. Sessions
    /// already merging or with uncommitted changes are skipped - bulk PR
    /// creation never commits on the user's behalf.
    pub async fn bulk_create_prs(
        &self,
        records: Vec<SessionRecord>,
    ) -> Vec<(SessionId, Result<bool>)> {
        let eligible: Vec<SessionRecord> = records
            .into_iter()
            .filter(|r| !self.store.is_merging(&r.id))
            .collect();

        let git = self.git.clone();
        let statuses = bulk::fan_out(eligible, bulk::DEFAULT_FAN_OUT_LIMIT, move |record| {
            let git = git.clone();
            async move {
                let status = git.worktree_status(&record.worktree_path).await;
                (record, status)
            }
        })
        .await;

        // Join phase: state mutation stays sequential on the caller's task
        let mut results = Vec::new();
        for entry in statuses.into_iter().flatten() {
            let (record, status) = entry;
            match status {
                Ok(status) if status.has_changes => {
                    results.push((record.id.clone(), Ok(false)));
                }
                Ok(_) => {
                    let started = self
                        .start_run(&record, MergeKind::PullRequest, None)
                        .await
                        .map(|_| true);
                    results.push((record.id.clone(), started));
                }
                Err(e) => results.push((record.id.clone(), Err(e))),
            }
        }
        results
    }
}
