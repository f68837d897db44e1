//! Process supervision for orphaned agent processes
//!
//! A crashed console can leave agent processes holding their working
//! trees, which the next start sees as "session in use". Force-resume uses
//! this collaborator to clear them out.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Kill processes still bound to `worktree_path`. Returns the number
    /// killed; zero orphans is success, not failure.
    async fn kill_orphans(&self, worktree_path: &Path) -> Result<usize>;
}

/// Finds orphans by matching the worktree path in process command lines.
#[derive(Debug, Default)]
pub struct PgrepSupervisor;

impl PgrepSupervisor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSupervisor for PgrepSupervisor {
    async fn kill_orphans(&self, worktree_path: &Path) -> Result<usize> {
        let pattern = worktree_path.to_string_lossy();
        let output = Command::new("pgrep")
            .args(["-f", pattern.as_ref()])
            .output()
            .await
            .map_err(|e| Error::Process(format!("failed to run pgrep: {}", e)))?;

        // pgrep exits non-zero when nothing matches
        if !output.status.success() {
            return Ok(0);
        }

        let own_pid = std::process::id();
        let mut killed = 0;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Ok(pid) = line.trim().parse::<u32>() else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            let status = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await
                .map_err(|e| Error::Process(format!("failed to run kill: {}", e)))?;
            if status.success() {
                debug!(pid, path = %pattern, "killed orphaned process");
                killed += 1;
            }
        }
        Ok(killed)
    }
}
