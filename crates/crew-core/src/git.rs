//! Git and pull-request collaborator
//!
//! Merge, PR, and push runs emit a stream of incremental output lines
//! followed by a terminal done-or-error marker, consumed with the same
//! listen/re-arm discipline as the agent streams. `GitCli` shells out to
//! `git` and `gh`; the sync step of a merge runs inside the session
//! worktree so that conflicts surface where the agent can resolve them.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::cancel::Cancellation;
use crate::error::{Error, Result};
use crate::session::routing::LineStream;

/// Snapshot of a working tree's local changes
#[derive(Debug, Clone, Default)]
pub struct WorktreeStatus {
    pub has_changes: bool,
    /// Porcelain status text, one file per line
    pub summary: String,
    pub files: Vec<String>,
}

/// Terminal failure of a merge/PR/push run
#[derive(Debug, Clone)]
pub struct MergeFailure {
    pub message: String,
    /// Conflicted paths, when the failure is a merge conflict
    pub conflicts: Vec<String>,
}

impl MergeFailure {
    pub fn is_conflict(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// One line of merge/PR/push progress
#[derive(Debug, Clone)]
pub enum MergeLine {
    Output(String),
    Done { detail: Option<String> },
    Error(MergeFailure),
}

impl MergeLine {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MergeLine::Done { .. } | MergeLine::Error(_))
    }
}

/// Stream of merge progress lines, consumed listener-style
pub type MergeStream = Arc<LineStream<MergeLine>>;

/// Inputs for a merge/PR/push run
#[derive(Debug, Clone)]
pub struct MergeContext {
    pub worktree_path: PathBuf,
    pub branch: String,
    /// Target branch; `None` means the backend's main branch
    pub target_branch: Option<String>,
    /// Commit message for uncommitted changes, when present
    pub commit_message: Option<String>,
    /// Issue reference included in PR bodies
    pub issue: Option<String>,
}

#[async_trait]
pub trait GitBackend: Send + Sync {
    async fn worktree_status(&self, path: &Path) -> Result<WorktreeStatus>;

    async fn merge_to_main(&self, ctx: MergeContext) -> Result<(MergeStream, Cancellation)>;
    async fn merge_to_parent(&self, ctx: MergeContext) -> Result<(MergeStream, Cancellation)>;
    async fn create_pr(&self, ctx: MergeContext) -> Result<(MergeStream, Cancellation)>;
    async fn push_updates(&self, ctx: MergeContext) -> Result<(MergeStream, Cancellation)>;

    /// Abort a conflicted merge in `path`.
    async fn abort_merge(&self, path: &Path) -> Result<()>;

    /// Commit a finished conflict resolution in `path`.
    async fn commit_conflict_resolution(&self, path: &Path, message: &str) -> Result<()>;
}

/// Helper to run git commands
async fn run_git(dir: &Path, args: &[&str]) -> std::result::Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| format!("Failed to run git: {}", e))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).to_string())
    }
}

/// Helper to run gh (GitHub CLI) commands
async fn run_gh(dir: &Path, args: &[&str]) -> std::result::Result<String, String> {
    let output = Command::new("gh")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| format!("Failed to run gh: {}", e))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).to_string())
    }
}

/// Paths still conflicted in `dir`
async fn conflicted_files(dir: &Path) -> Vec<String> {
    match run_git(dir, &["diff", "--name-only", "--diff-filter=U"]).await {
        Ok(out) => out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// The primary checkout that owns `worktree`; the common git dir lives
/// under it.
async fn resolve_repo_root(worktree: &Path) -> std::result::Result<PathBuf, String> {
    let common = run_git(worktree, &["rev-parse", "--git-common-dir"]).await?;
    let common = common.trim();
    let common_path = if Path::new(common).is_relative() {
        worktree.join(common)
    } else {
        PathBuf::from(common)
    };
    common_path
        .parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| format!("cannot resolve repository root from {}", common_path.display()))
}

async fn send_line(tx: &mpsc::Sender<MergeLine>, line: MergeLine) {
    let _ = tx.send(line).await;
}

async fn send_failure(tx: &mpsc::Sender<MergeLine>, message: String, conflicts: Vec<String>) {
    send_line(
        tx,
        MergeLine::Error(MergeFailure {
            message: message.trim().to_string(),
            conflicts,
        }),
    )
    .await;
}

/// Commit local changes first when a confirmed message was supplied.
async fn commit_local_changes(
    ctx: &MergeContext,
    tx: &mpsc::Sender<MergeLine>,
) -> std::result::Result<(), String> {
    let Some(message) = &ctx.commit_message else {
        return Ok(());
    };
    send_line(
        tx,
        MergeLine::Output(format!("committing local changes on {}", ctx.branch)),
    )
    .await;
    run_git(&ctx.worktree_path, &["add", "-A"]).await?;
    run_git(&ctx.worktree_path, &["commit", "-m", message]).await?;
    Ok(())
}

async fn run_merge(ctx: MergeContext, target: String, tx: mpsc::Sender<MergeLine>) {
    if let Err(e) = commit_local_changes(&ctx, &tx).await {
        send_failure(&tx, e, Vec::new()).await;
        return;
    }
    send_line(
        &tx,
        MergeLine::Output(format!("merging {} into {}", ctx.branch, target)),
    )
    .await;

    // Sync the branch inside the worktree first; conflicts surface where
    // the agent can resolve them.
    let sync_message = format!("Merge {} into {}", target, ctx.branch);
    if let Err(e) = run_git(&ctx.worktree_path, &["merge", &target, "-m", &sync_message]).await {
        let conflicts = conflicted_files(&ctx.worktree_path).await;
        send_failure(&tx, e, conflicts).await;
        return;
    }

    let repo_root = match resolve_repo_root(&ctx.worktree_path).await {
        Ok(root) => root,
        Err(e) => {
            send_failure(&tx, e, Vec::new()).await;
            return;
        }
    };
    let merge_message = format!("Merge branch '{}'", ctx.branch);
    match run_git(&repo_root, &["merge", "--no-ff", &ctx.branch, "-m", &merge_message]).await {
        Ok(out) => {
            for line in out.lines() {
                send_line(&tx, MergeLine::Output(line.to_string())).await;
            }
            send_line(
                &tx,
                MergeLine::Done {
                    detail: Some(format!("merged {} into {}", ctx.branch, target)),
                },
            )
            .await;
        }
        Err(e) => {
            let conflicts = conflicted_files(&repo_root).await;
            send_failure(&tx, e, conflicts).await;
        }
    }
}

async fn run_create_pr(ctx: MergeContext, tx: mpsc::Sender<MergeLine>) {
    if let Err(e) = commit_local_changes(&ctx, &tx).await {
        send_failure(&tx, e, Vec::new()).await;
        return;
    }
    send_line(
        &tx,
        MergeLine::Output(format!("pushing {} to origin", ctx.branch)),
    )
    .await;
    if let Err(e) = run_git(&ctx.worktree_path, &["push", "-u", "origin", &ctx.branch]).await {
        send_failure(&tx, e, Vec::new()).await;
        return;
    }

    let title = ctx
        .commit_message
        .as_deref()
        .and_then(|m| m.lines().next())
        .unwrap_or(&ctx.branch)
        .to_string();
    let body = match &ctx.issue {
        Some(issue) => format!("Closes {}", issue),
        None => String::new(),
    };
    match run_gh(
        &ctx.worktree_path,
        &["pr", "create", "--title", &title, "--body", &body, "--head", &ctx.branch],
    )
    .await
    {
        Ok(out) => {
            let url = out.lines().last().unwrap_or("").trim().to_string();
            for line in out.lines() {
                send_line(&tx, MergeLine::Output(line.to_string())).await;
            }
            send_line(
                &tx,
                MergeLine::Done {
                    detail: if url.is_empty() { None } else { Some(url) },
                },
            )
            .await;
        }
        Err(e) => send_failure(&tx, e, Vec::new()).await,
    }
}

async fn run_push(ctx: MergeContext, tx: mpsc::Sender<MergeLine>) {
    if let Err(e) = commit_local_changes(&ctx, &tx).await {
        send_failure(&tx, e, Vec::new()).await;
        return;
    }
    match run_git(&ctx.worktree_path, &["push", "-u", "origin", &ctx.branch]).await {
        Ok(out) => {
            for line in out.lines() {
                send_line(&tx, MergeLine::Output(line.to_string())).await;
            }
            send_line(
                &tx,
                MergeLine::Done {
                    detail: Some(format!("pushed {}", ctx.branch)),
                },
            )
            .await;
        }
        Err(e) => send_failure(&tx, e, Vec::new()).await,
    }
}

/// Shells out to `git` and `gh`, streaming progress lines.
pub struct GitCli {
    main_branch: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            main_branch: "main".to_string(),
        }
    }

    pub fn with_main_branch(branch: impl Into<String>) -> Self {
        Self {
            main_branch: branch.into(),
        }
    }

    /// Spawn a run as a background task; the returned cancellation aborts
    /// it, which closes the stream.
    fn spawn_run<F, Fut>(build: F) -> (MergeStream, Cancellation)
    where
        F: FnOnce(mpsc::Sender<MergeLine>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(build(tx));
        let slot = Arc::new(Mutex::new(Some(handle)));
        let cancel = Cancellation::new(move || {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        });
        (Arc::new(LineStream::new(rx)), cancel)
    }
}

#[async_trait]
impl GitBackend for GitCli {
    async fn worktree_status(&self, path: &Path) -> Result<WorktreeStatus> {
        let summary = run_git(path, &["status", "--porcelain"])
            .await
            .map_err(Error::Git)?;
        let files: Vec<String> = summary
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].trim().to_string())
            .collect();
        Ok(WorktreeStatus {
            has_changes: !summary.trim().is_empty(),
            summary,
            files,
        })
    }

    async fn merge_to_main(&self, ctx: MergeContext) -> Result<(MergeStream, Cancellation)> {
        let target = ctx
            .target_branch
            .clone()
            .unwrap_or_else(|| self.main_branch.clone());
        Ok(Self::spawn_run(move |tx| run_merge(ctx, target, tx)))
    }

    async fn merge_to_parent(&self, ctx: MergeContext) -> Result<(MergeStream, Cancellation)> {
        let target = ctx
            .target_branch
            .clone()
            .ok_or_else(|| Error::Git("merge to parent requires a target branch".to_string()))?;
        Ok(Self::spawn_run(move |tx| run_merge(ctx, target, tx)))
    }

    async fn create_pr(&self, ctx: MergeContext) -> Result<(MergeStream, Cancellation)> {
        Ok(Self::spawn_run(move |tx| run_create_pr(ctx, tx)))
    }

    async fn push_updates(&self, ctx: MergeContext) -> Result<(MergeStream, Cancellation)> {
        Ok(Self::spawn_run(move |tx| run_push(ctx, tx)))
    }

    async fn abort_merge(&self, path: &Path) -> Result<()> {
        run_git(path, &["merge", "--abort"]).await.map_err(Error::Git)?;
        Ok(())
    }

    async fn commit_conflict_resolution(&self, path: &Path, message: &str) -> Result<()> {
        run_git(path, &["add", "-A"]).await.map_err(Error::Git)?;
        run_git(path, &["commit", "-m", message])
            .await
            .map_err(Error::Git)?;
        Ok(())
    }
}
