//! Crew Core - session concurrency and orchestration engine
//!
//! This crate provides the core of the Crew operator console:
//! - Per-session state store with named, lockable transitions
//! - Session lifecycle management (runner cache, selection, deletion)
//! - The listen → react → re-arm event routing protocol
//! - The merge/PR/conflict workflow layered on top
//! - Collaborator traits for the agent runner, git, config persistence,
//!   and process supervision, with file/CLI-backed implementations
//!
//! Sessions are independent units of failure: one session's stall, error,
//! or deletion never blocks another's forward progress.

pub mod bulk;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod git;
pub mod merge;
pub mod process;
pub mod runner;
pub mod session;

pub use cancel::Cancellation;
pub use config::{
    ConfigStore, FileConfigStore, Role, SessionRecord, SessionStatus, TranscriptMessage,
    default_data_dir,
};
pub use controller::{
    AppPhase, Controller, Notice, is_session_in_use_error, tool_done_line, tool_running_line,
};
pub use error::{Error, Result};
pub use git::{
    GitBackend, GitCli, MergeContext, MergeFailure, MergeLine, MergeStream, WorktreeStatus,
};
pub use merge::{
    CommitMessageGenerator, MergeEntry, MergeOutcome, MergeWorkflow, fallback_commit_message,
};
pub use process::{PgrepSupervisor, ProcessSupervisor};
pub use runner::{
    AgentRunner, PermissionRequest, QuestionOption, QuestionRequest, ResponseChunk, RunnerFactory,
    RunnerHandle,
};
pub use session::{
    ConflictContext, Listened, LineStream, ListenerPool, MergeKind, MergeOp, PreviousFocus,
    RoutedEvent, SelectionResult, SessionId, SessionLifecycle, SessionSnapshot, SessionStore,
};
